//! `RestartPedestal` handler (§4.8.1).

use async_trait::async_trait;
use chrono::Utc;
use rca_common::errors::HandlerError;
use rca_common::events::EventName;
use rca_common::{RetryPolicy, Task, TaskPayload, TaskState};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::cluster::ResourceSpec;
use crate::dispatcher::{HandlerOutcome, TaskHandler};
use crate::events::DomainEvent;
use crate::handlers::{reschedule_backoff_seconds, HandlerContext};

pub struct RestartPedestalHandler;

#[async_trait]
impl TaskHandler for RestartPedestalHandler {
    #[instrument(skip_all, fields(task_id = %task.task_id, trace_id = %task.trace_id))]
    async fn handle(
        &self,
        ctx: &HandlerContext,
        task: &Task,
        _cancellation: CancellationToken,
    ) -> Result<HandlerOutcome, HandlerError> {
        let TaskPayload::RestartPedestal(payload) = &task.payload else {
            return Err(HandlerError::PayloadInvalid(
                "expected RestartPedestal payload".into(),
            ));
        };

        // Step 1: acquire a rate-limit token, else WaitForToken; on timeout
        // reschedule this task with randomized exponential backoff.
        let acquired = if ctx.rate_limiter.acquire(task.task_id).await? {
            true
        } else {
            ctx.rate_limiter
                .wait_for_token(
                    task.task_id,
                    ctx.config.wait_for_token_timeout,
                    std::time::Duration::from_millis(200),
                )
                .await?
        };

        if !acquired {
            let mut task = task.clone();
            let backoff =
                reschedule_backoff_seconds(task.restart_attempts, ctx.config.reschedule_backoff_cap);
            ctx.queues.reschedule(&mut task, backoff).await.map_err(|e| {
                HandlerError::Store(rca_common::errors::StoreError::Backend(e.to_string()))
            })?;
            publish(ctx, &task, EventName::NoNamespaceAvailable, serde_json::json!({"reason": "token_unavailable"})).await;
            return Ok(HandlerOutcome::Rescheduled);
        }

        // Step 2: GetFree over the pedestal prefix.
        let now = Utc::now().timestamp();
        let wanted_end = now + payload.interval_min * 60;
        let free_namespace = ctx
            .namespace_lock
            .get_free(&payload.pedestal_ref, wanted_end, task.trace_id)
            .await?;

        let Some(namespace) = free_namespace else {
            ctx.rate_limiter.release(task.task_id).await?;
            let mut task = task.clone();
            let backoff =
                reschedule_backoff_seconds(task.restart_attempts, ctx.config.reschedule_backoff_cap);
            ctx.queues.reschedule(&mut task, backoff).await.map_err(|e| {
                HandlerError::Store(rca_common::errors::StoreError::Backend(e.to_string()))
            })?;
            publish(
                ctx,
                &task,
                EventName::NoNamespaceAvailable,
                serde_json::json!({"prefix": payload.pedestal_ref}),
            )
            .await;
            return Ok(HandlerOutcome::Rescheduled);
        };

        publish(
            ctx,
            task,
            EventName::RestartServiceStarted,
            serde_json::json!({"namespace": namespace}),
        )
        .await;

        // Step 3: compute inject_time and install via helm, bounded timeout.
        let inject_time = now + (payload.interval_min - payload.fault_duration_min) * 60;
        let install_result = ctx
            .cluster
            .install_helm_release(&namespace, &payload.helm_values, ctx.config.helm_install_timeout)
            .await;

        if let Err(err) = install_result {
            ctx.namespace_lock.release(&namespace, task.trace_id).await?;
            ctx.rate_limiter.release(task.task_id).await?;
            publish(
                ctx,
                task,
                EventName::RestartServiceFailed,
                serde_json::json!({"namespace": namespace, "reason": err.to_string()}),
            )
            .await;
            return Err(err);
        }

        publish(
            ctx,
            task,
            EventName::RestartServiceCompleted,
            serde_json::json!({"namespace": namespace}),
        )
        .await;

        // Step 4: submit the downstream FaultInjection task, carrying the
        // locked namespace forward.
        let mut inject_payload = payload.inject_payload.clone();
        inject_payload.namespace = namespace.clone();
        inject_payload.benchmark = payload.benchmark_ref.clone();

        let now_dt = Utc::now();
        let downstream = Task {
            task_id: Uuid::new_v4(),
            group_id: task.group_id,
            trace_id: task.trace_id,
            payload: TaskPayload::FaultInjection(inject_payload),
            immediate: false,
            execute_time: inject_time,
            cron_expr: None,
            retry_policy: RetryPolicy::default(),
            restart_attempts: 0,
            state: TaskState::Pending,
            carrier: task.carrier.clone(),
            project_id: task.project_id.clone(),
            user_id: task.user_id.clone(),
            created_at: now_dt,
            updated_at: now_dt,
        };
        ctx.queues.submit(downstream).await.map_err(|e| {
            HandlerError::Store(rca_common::errors::StoreError::Backend(e.to_string()))
        })?;

        // Step 5: mark self Completed. The namespace lock is intentionally
        // *not* released here (Open Question #1, SPEC_FULL §9) — it is
        // transferred to the downstream trace and released by ingress on
        // the terminal job-callback path. The rate-limit token, however, is
        // specific to this RestartPedestal task and is released now.
        ctx.rate_limiter.release(task.task_id).await?;
        ctx.task_store
            .patch_state(task.task_id, TaskState::Completed)
            .await
            .map_err(HandlerError::Store)?;

        let _ = ResourceSpec::default(); // helm releases are not labeled cluster resources
        Ok(HandlerOutcome::Completed)
    }
}

async fn publish(ctx: &HandlerContext, task: &Task, name: EventName, payload: serde_json::Value) {
    let event = DomainEvent::new(task.task_id, task.task_type().as_str(), name, payload)
        .with_site(file!(), line!(), "restart_pedestal");
    let _ = ctx.events.publish(task.trace_id, event).await;
}
