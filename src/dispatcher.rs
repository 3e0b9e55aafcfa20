//! Dispatcher (C7): a typed `TaskType -> handler` table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rca_common::errors::{DispatchError, HandlerError};
use rca_common::{Task, TaskType};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::handlers::HandlerContext;

/// Outcome of a successful handler invocation. `NamespaceBusy` and
/// `TokenUnavailable` are not errors per §7's propagation policy — the
/// handler reschedules the task itself and reports `Rescheduled` rather
/// than bubbling an `Err`.
///
/// `Detached` covers the cluster-backed stages (`FaultInjection`,
/// `BuildDatapack`, `RunAlgorithm`): the handler has created a chaos CRD
/// or batch Job and left the task in `Running`, but the task's terminal
/// transition belongs to the cluster-event ingress callback that will
/// fire later (§4.9), not to this invocation. The worker must not treat
/// `Detached` the way it treats `Completed` — doing so would mark the
/// task terminal before the callback ever arrives and the callback's own
/// `patch_state` would then be rejected by the terminal guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Completed,
    Detached,
    Rescheduled,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        task: &Task,
        cancellation: CancellationToken,
    ) -> Result<HandlerOutcome, HandlerError>;
}

/// Routes a task to its registered handler. Every call is wrapped with a
/// span named after the task type and carries the outcome in its fields,
/// satisfying §4.7's "telemetry span whose name encodes the type and
/// status" requirement at the one seam every task passes through.
pub struct Dispatcher {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type, handler);
    }

    #[instrument(skip(self, ctx, task, cancellation), fields(task_id = %task.task_id, task_type = %task.task_type()))]
    pub async fn dispatch(
        &self,
        ctx: &HandlerContext,
        task: &Task,
        cancellation: CancellationToken,
    ) -> Result<HandlerOutcome, DispatchError> {
        let task_type = task.task_type();
        let handler = self
            .handlers
            .get(&task_type)
            .ok_or_else(|| DispatchError::UnknownTaskType(task_type.to_string()))?;
        let outcome = handler.handle(ctx, task, cancellation).await?;
        tracing::info!(task_id = %task.task_id, task_type = %task_type, outcome = ?outcome, "task dispatched");
        Ok(outcome)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rca_common::{CollectResultPayload, RetryPolicy, TaskPayload, TaskState};
    use uuid::Uuid;

    struct AlwaysUnknownHandler;

    #[async_trait]
    impl TaskHandler for AlwaysUnknownHandler {
        async fn handle(
            &self,
            _ctx: &HandlerContext,
            _task: &Task,
            _cancellation: CancellationToken,
        ) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::Completed)
        }
    }

    fn sample_task(task_type: TaskType) -> Task {
        let now = chrono::Utc::now();
        let payload = match task_type {
            TaskType::CollectResult => TaskPayload::CollectResult(CollectResultPayload {
                execution_id: Uuid::new_v4(),
                result_csv_path: "r.csv".into(),
                conclusion_csv_path: "c.csv".into(),
            }),
            _ => unreachable!("test only needs CollectResult"),
        };
        Task {
            task_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            payload,
            immediate: true,
            execute_time: now.timestamp(),
            cron_expr: None,
            retry_policy: RetryPolicy::default(),
            restart_attempts: 0,
            state: TaskState::Pending,
            carrier: Default::default(),
            project_id: "p".into(),
            user_id: "u".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn unregistered_type_returns_unknown_task_type_error() {
        let dispatcher = Dispatcher::new();
        let ctx = HandlerContext::for_test();
        let task = sample_task(TaskType::CollectResult);
        let err = dispatcher
            .dispatch(&ctx, &task, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTaskType(_)));
    }

    #[tokio::test]
    async fn registered_handler_is_invoked() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(TaskType::CollectResult, Arc::new(AlwaysUnknownHandler));
        let ctx = HandlerContext::for_test();
        let task = sample_task(TaskType::CollectResult);
        let outcome = dispatcher
            .dispatch(&ctx, &task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Completed);
    }
}
