//! `FaultInjection` handler (§4.8.2).

use async_trait::async_trait;
use chrono::Utc;
use rca_common::errors::{HandlerError, StoreError};
use rca_common::events::EventName;
use rca_common::{FaultInjectionRecord, FaultInjectionState, Task, TaskPayload, TaskState};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::cluster::ResourceSpec;
use crate::dispatcher::{HandlerOutcome, TaskHandler};
use crate::events::DomainEvent;
use crate::handlers::{derive_injection_name, HandlerContext};

pub struct FaultInjectionHandler;

#[async_trait]
impl TaskHandler for FaultInjectionHandler {
    #[instrument(skip_all, fields(task_id = %task.task_id, trace_id = %task.trace_id))]
    async fn handle(
        &self,
        ctx: &HandlerContext,
        task: &Task,
        _cancellation: CancellationToken,
    ) -> Result<HandlerOutcome, HandlerError> {
        let TaskPayload::FaultInjection(payload) = &task.payload else {
            return Err(HandlerError::PayloadInvalid(
                "expected FaultInjection payload".into(),
            ));
        };

        // Step 1: re-validate the namespace is still locked by this trace;
        // if not, attempt to acquire it fresh. On failure, return the error
        // as-is — C9 will eventually release any stale lock/token via the
        // terminal job-callback path rather than this handler retrying.
        let now = Utc::now().timestamp();
        let wanted_end = now + payload.pre_duration * 60 + 3600;
        ctx.namespace_lock
            .check_and_lock(&payload.namespace, wanted_end, task.trace_id)
            .await?;

        // Step 2: create the chaos CRD, carrying identity labels and the
        // causal-context carrier in annotations.
        let injection_name = derive_injection_name(&payload.benchmark, &payload.namespace, task.task_id);
        let mut labels = payload.labels.clone();
        labels.insert("task_id".into(), task.task_id.to_string());
        labels.insert("trace_id".into(), task.trace_id.to_string());
        labels.insert("group_id".into(), task.group_id.to_string());
        labels.insert("task_type".into(), task.task_type().as_str().to_string());
        labels.insert("benchmark".into(), payload.benchmark.clone());
        labels.insert("pre_duration".into(), payload.pre_duration.to_string());

        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert("task_carrier".into(), task.carrier.to_annotation());
        annotations.insert("trace_carrier".into(), task.carrier.to_annotation());

        let resource = ResourceSpec {
            name: injection_name.clone(),
            namespace: payload.namespace.clone(),
            labels,
            annotations,
            spec: serde_json::json!({
                "faultType": payload.fault_type,
                "displayConfig": payload.display_config,
                "engineConfig": payload.engine_config,
            }),
        };

        if let Err(err) = ctx.cluster.create_chaos_crd(resource).await {
            ctx.namespace_lock.release(&payload.namespace, task.trace_id).await?;
            publish(
                ctx,
                task,
                EventName::FaultInjectionFailed,
                serde_json::json!({"reason": err.to_string()}),
            )
            .await;
            // The task's terminal state is the worker's call, not this
            // handler's: a retry can still succeed, and marking the row
            // Error now would make the retry's own `patch_state(Running)`
            // hit the terminal guard. The worker dead-letters and marks
            // Error only once `retry_policy` is exhausted (§7).
            return Err(err);
        }

        // Step 3: persist the FaultInjectionRecord with state=Initial.
        let record = FaultInjectionRecord {
            id: Uuid::new_v4(),
            task_id: task.task_id,
            fault_type: payload.fault_type,
            display_config: payload.display_config.clone(),
            engine_config: payload.engine_config.clone(),
            pre_duration: payload.pre_duration,
            start_time: None,
            end_time: None,
            benchmark: payload.benchmark.clone(),
            injection_name,
            state: FaultInjectionState::Initial,
            labels: payload.labels.clone(),
        };
        ctx.fault_injection_store
            .create(&record)
            .await
            .map_err(|err| match err {
                StoreError::AlreadyExists(name) => {
                    HandlerError::PayloadInvalid(format!("injection_name already exists: {name}"))
                }
                other => HandlerError::Store(other),
            })?;

        // Step 4: emit FaultInjectionStarted and return; the cluster reports
        // success/failure to C9, which advances or fails the pipeline. The
        // task stays Running — its terminal transition belongs to the
        // ingress callback (§4.9), so this handler reports `Detached`
        // rather than `Completed`.
        publish(
            ctx,
            task,
            EventName::FaultInjectionStarted,
            serde_json::json!({"injection_name": record.injection_name, "namespace": payload.namespace}),
        )
        .await;

        ctx.task_store
            .patch_state(task.task_id, TaskState::Running)
            .await
            .map_err(HandlerError::Store)?;

        Ok(HandlerOutcome::Detached)
    }
}

async fn publish(ctx: &HandlerContext, task: &Task, name: EventName, payload: serde_json::Value) {
    let event = DomainEvent::new(task.task_id, task.task_type().as_str(), name, payload)
        .with_site(file!(), line!(), "fault_injection");
    let _ = ctx.events.publish(task.trace_id, event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rca_common::RetryPolicy;
    use std::collections::BTreeMap;

    fn injection_task(namespace: &str) -> Task {
        let now = Utc::now();
        Task {
            task_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            payload: TaskPayload::FaultInjection(rca_common::FaultInjectionPayload {
                benchmark: "ts-cb".into(),
                fault_type: 1,
                namespace: namespace.into(),
                pre_duration: 20,
                display_config: serde_json::json!({"human": "network delay"}),
                engine_config: serde_json::json!({"node": "n1"}),
                labels: BTreeMap::new(),
            }),
            immediate: false,
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
    async fn happy_path_creates_crd_and_record() {
        let ctx = HandlerContext::for_test();
        let task = injection_task("ts0");
        ctx.task_store.create(&task).await.unwrap();
        ctx.namespace_lock
            .check_and_lock("ts0", i64::MAX, task.trace_id)
            .await
            .unwrap();

        let outcome = FaultInjectionHandler
            .handle(&ctx, &task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Detached);

        let record = ctx
            .fault_injection_store
            .get_by_task(task.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, FaultInjectionState::Initial);
    }

    #[tokio::test]
    async fn namespace_not_held_by_caller_fails() {
        let ctx = HandlerContext::for_test();
        let task = injection_task("ts0");
        ctx.task_store.create(&task).await.unwrap();

        let other_trace = Uuid::new_v4();
        ctx.namespace_lock
            .check_and_lock("ts0", i64::MAX, other_trace)
            .await
            .unwrap();

        let err = FaultInjectionHandler
            .handle(&ctx, &task, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NamespaceBusy));
    }
}
