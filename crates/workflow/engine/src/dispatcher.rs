//! Task dispatch: telling the outside world a step is waiting
//!
//! The executor hands every newly entered step to a [`TaskDispatcher`] and
//! never waits on it. User tasks become notifications for the assignee
//! role; service tasks run a registered [`ServiceHandler`] in the background
//! and report back as [`TaskEvent`]s, which [`TaskEventLoop`] feeds into the
//! executor.

use crate::executor::WorkflowExecutor;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use workflow_types::{Step, StepKind, WorkflowError, WorkflowInstanceId};

/// Notification template used for newly assigned user tasks.
pub const TASK_ASSIGNED_TEMPLATE: &str = "workflow.task_assigned";

/// Errors raised while dispatching a step.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no service handler registered for '{0}'")]
    NoHandler(String),

    #[error("notification failed: {0}")]
    Notification(String),

    #[error("service call failed: {0}")]
    Service(String),

    #[error("task event channel closed")]
    ChannelClosed,
}

/// A step handed to the dispatcher, with enough context to call back.
#[derive(Debug, Clone)]
pub struct DispatchedTask {
    pub instance_id: WorkflowInstanceId,
    /// Instance version at dispatch time; callbacks pass it as `expected_version`
    pub version: u64,
    /// The instance completed on entering this step; nothing reports back
    pub notify_only: bool,
    pub step: Step,
    pub entity_type: String,
    pub entity_id: String,
}

/// Receives every step an instance enters.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: DispatchedTask) -> Result<(), DispatchError>;
}

/// Dispatcher that drops every task. For callers that poll instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDispatcher;

#[async_trait]
impl TaskDispatcher for NoopDispatcher {
    async fn dispatch(&self, _task: DispatchedTask) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// External notification sink. Fire-and-forget from the engine's side.
#[async_trait]
pub trait NotificationManager: Send + Sync {
    async fn notify(
        &self,
        recipient: &str,
        template_key: &str,
        data: serde_json::Value,
    ) -> Result<(), DispatchError>;
}

/// Notification sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationManager for LogNotifier {
    async fn notify(
        &self,
        recipient: &str,
        template_key: &str,
        data: serde_json::Value,
    ) -> Result<(), DispatchError> {
        tracing::info!(recipient, template = template_key, %data, "Notification");
        Ok(())
    }
}

/// Callback implementing one service task, looked up by `service_ref`.
///
/// On success returns the outcome to complete the step with.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn call(&self, task: &DispatchedTask) -> Result<String, DispatchError>;
}

/// Result of a background service call.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Completed {
        task: DispatchedTask,
        outcome: String,
    },
    Failed {
        task: DispatchedTask,
        detail: String,
    },
}

/// Notifies user-task assignees and runs service tasks on the tokio runtime.
pub struct StandardDispatcher {
    notifier: Arc<dyn NotificationManager>,
    handlers: DashMap<String, Arc<dyn ServiceHandler>>,
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl StandardDispatcher {
    /// Create a dispatcher and the receiving end of its event stream.
    pub fn new(
        notifier: Arc<dyn NotificationManager>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            notifier,
            handlers: DashMap::new(),
            events,
        };
        (dispatcher, rx)
    }

    /// Register (or replace) the handler for a `service_ref`.
    pub fn register_handler(&self, service_ref: impl Into<String>, handler: Arc<dyn ServiceHandler>) {
        let service_ref = service_ref.into();
        tracing::debug!(service_ref = %service_ref, "Service handler registered");
        self.handlers.insert(service_ref, handler);
    }

    pub fn has_handler(&self, service_ref: &str) -> bool {
        self.handlers.contains_key(service_ref)
    }
}

#[async_trait]
impl TaskDispatcher for StandardDispatcher {
    async fn dispatch(&self, task: DispatchedTask) -> Result<(), DispatchError> {
        match &task.step.kind {
            StepKind::UserTask { assignee_role } => {
                let data = serde_json::json!({
                    "instance_id": task.instance_id.0,
                    "step": task.step.id.as_str(),
                    "step_name": task.step.name,
                    "entity_type": task.entity_type,
                    "entity_id": task.entity_id,
                    "outcomes": task.step.effective_outcomes(),
                    "notify_only": task.notify_only,
                });
                self.notifier
                    .notify(assignee_role, TASK_ASSIGNED_TEMPLATE, data)
                    .await
            }
            StepKind::ServiceTask { service_ref } => {
                let handler = self
                    .handlers
                    .get(service_ref)
                    .map(|h| Arc::clone(h.value()))
                    .ok_or_else(|| DispatchError::NoHandler(service_ref.clone()))?;

                if self.events.is_closed() {
                    return Err(DispatchError::ChannelClosed);
                }
                let events = self.events.clone();
                tokio::spawn(async move {
                    let event = match handler.call(&task).await {
                        Ok(outcome) => TaskEvent::Completed { task, outcome },
                        Err(e) => TaskEvent::Failed {
                            task,
                            detail: e.to_string(),
                        },
                    };
                    if events.send(event).is_err() {
                        tracing::warn!("Task event dropped: event loop has stopped");
                    }
                });
                Ok(())
            }
        }
    }
}

/// Applies service-task results to the executor.
///
/// Failures are reported through the executor's retry policy; while retries
/// remain, the step is re-dispatched after the scheduled backoff.
pub struct TaskEventLoop {
    executor: Arc<WorkflowExecutor>,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    actor_id: String,
}

impl TaskEventLoop {
    pub fn new(executor: Arc<WorkflowExecutor>, events: mpsc::UnboundedReceiver<TaskEvent>) -> Self {
        Self {
            executor,
            events,
            actor_id: "system:service".to_string(),
        }
    }

    /// Actor id recorded in the audit trail for service completions
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = actor_id.into();
        self
    }

    /// Run on a background task until every sender is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle(event).await;
        }
        tracing::debug!("Task event loop stopped");
    }

    async fn handle(&self, event: TaskEvent) {
        match event {
            TaskEvent::Completed { task, outcome } => {
                let result = self
                    .executor
                    .complete_task(&task.instance_id, task.version, &outcome, &self.actor_id, None)
                    .await;
                if let Err(e) = result {
                    tracing::warn!(
                        instance_id = %task.instance_id,
                        step = %task.step.id,
                        error = %e,
                        "Service task result not applied"
                    );
                }
            }
            TaskEvent::Failed { task, detail } => {
                let result = self
                    .executor
                    .report_service_failure(&task.instance_id, task.version, &detail)
                    .await;
                match result {
                    Ok(scheduled) => {
                        let executor = Arc::clone(&self.executor);
                        let instance_id = task.instance_id.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(scheduled.delay).await;
                            if let Err(e) = executor.redispatch(&instance_id, scheduled.version).await {
                                tracing::warn!(instance_id = %instance_id, error = %e, "Retry dispatch skipped");
                            }
                        });
                    }
                    Err(WorkflowError::ServiceTaskExhausted { id, failures }) => {
                        tracing::warn!(
                            instance_id = %id,
                            step = %task.step.id,
                            failures,
                            "Service task exhausted; instance stalled"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            instance_id = %task.instance_id,
                            error = %e,
                            "Service failure not recorded"
                        );
                    }
                }
            }
        }
    }
}
