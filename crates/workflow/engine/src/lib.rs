//! Workflow engine shared by every business module
//!
//! A module registers its approval process as a [`WorkflowDefinition`],
//! starts one instance per business entity, and reports completed steps.
//! The engine validates each requested outcome against the graph, moves the
//! instance under optimistic concurrency, and records every change in the
//! entity's hash-chained audit trail.
//!
//! # Architecture
//!
//! - [`DefinitionRegistry`]: validated, versioned definitions
//! - [`WorkflowExecutor`]: the state machine over an [`InstanceStore`] and an [`AuditLedger`]
//! - [`TaskDispatcher`]: notified of every step an instance enters
//! - [`RetryPolicy`]: backoff and stall threshold for failing service tasks
//!
//! # Example
//!
//! ```rust
//! use workflow_engine::WorkflowExecutor;
//! use workflow_types::{Step, WorkflowDefinition};
//!
//! # tokio_test_block(async {
//! let executor = WorkflowExecutor::detached();
//! executor
//!     .register_definition(
//!         WorkflowDefinition::new("invoice_approval", "review")
//!             .with_step(Step::user_task("review", "finance").on("approve", "pay").on_finish("reject"))
//!             .with_step(Step::service_task("pay", "payments.release").then_finish()),
//!     )
//!     .await
//!     .unwrap();
//!
//! let instance = executor
//!     .start_workflow("invoice_approval", "invoice", "INV-2024-0042", "clerk-7")
//!     .await
//!     .unwrap();
//! let instance = executor
//!     .complete_task(&instance.id, instance.version, "reject", "manager-2", None)
//!     .await
//!     .unwrap();
//! assert!(instance.is_terminal());
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```
//!
//! [`WorkflowDefinition`]: workflow_types::WorkflowDefinition
//! [`InstanceStore`]: workflow_storage::InstanceStore
//! [`AuditLedger`]: audit_ledger::AuditLedger

#![deny(unsafe_code)]

pub mod config;
pub mod definition_registry;
pub mod dispatcher;
pub mod executor;
pub mod retry;

pub use config::{build_executor, EngineConfig, LoggingConfig, StorageConfig};
pub use definition_registry::DefinitionRegistry;
pub use dispatcher::{
    DispatchError, DispatchedTask, LogNotifier, NoopDispatcher, NotificationManager,
    ServiceHandler, StandardDispatcher, TaskDispatcher, TaskEvent, TaskEventLoop,
};
pub use executor::{RetryScheduled, WorkflowExecutor};
pub use retry::RetryPolicy;
