//! Workflow domain types shared by every business module
//!
//! A module (budgets, invoices, tenders, ...) describes its approval process
//! as a [`WorkflowDefinition`]: a graph of [`Step`]s whose outcomes route to
//! the next step. Each tracked business entity gets a [`WorkflowInstance`]
//! that the engine advances through that graph.

#![deny(unsafe_code)]

pub mod definition;
pub mod error;
pub mod instance;

pub use definition::{
    Step, StepId, StepKind, WorkflowDefinition, WorkflowDefinitionId, DEFAULT_OUTCOME,
};
pub use error::{WorkflowError, WorkflowResult};
pub use instance::{InstanceStatus, WorkflowInstance, WorkflowInstanceId};
