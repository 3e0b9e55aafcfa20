//! `RunAlgorithm` handler (§4.8.4).

use async_trait::async_trait;
use chrono::Utc;
use rca_common::errors::HandlerError;
use rca_common::events::EventName;
use rca_common::{ExecutionResult, ExecutionState, Task, TaskPayload, TaskState};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::cluster::ResourceSpec;
use crate::dispatcher::{HandlerOutcome, TaskHandler};
use crate::events::DomainEvent;
use crate::handlers::HandlerContext;

pub struct RunAlgorithmHandler;

#[async_trait]
impl TaskHandler for RunAlgorithmHandler {
    #[instrument(skip_all, fields(task_id = %task.task_id, trace_id = %task.trace_id))]
    async fn handle(
        &self,
        ctx: &HandlerContext,
        task: &Task,
        _cancellation: CancellationToken,
    ) -> Result<HandlerOutcome, HandlerError> {
        let TaskPayload::RunAlgorithm(payload) = &task.payload else {
            return Err(HandlerError::PayloadInvalid(
                "expected RunAlgorithm payload".into(),
            ));
        };

        let record_id = payload.fault_injection_record_id.ok_or_else(|| {
            HandlerError::PayloadInvalid("missing fault_injection_record_id".into())
        })?;
        let record = ctx
            .fault_injection_store
            .get(record_id)
            .await
            .map_err(HandlerError::Store)?
            .ok_or_else(|| {
                HandlerError::PayloadInvalid(format!("fault injection record {record_id} not found"))
            })?;
        let (Some(start_time), Some(end_time)) = (record.start_time, record.end_time) else {
            return Err(HandlerError::PayloadInvalid(
                "fault injection record has no recorded time window yet".into(),
            ));
        };
        let normal_start = start_time - chrono::Duration::minutes(record.pre_duration);

        let execution = ExecutionResult {
            id: Uuid::new_v4(),
            task_id: task.task_id,
            fault_injection_record_id: Some(record_id),
            image: payload.image.clone(),
            tag: payload.tag.clone(),
            dataset: payload.dataset.clone(),
            state: ExecutionState::Initial,
            created_at: Utc::now(),
        };
        ctx.result_store
            .create_execution(&execution)
            .await
            .map_err(HandlerError::Store)?;

        // Well-known keys are set first so caller-provided `env_vars`
        // override their values but can never remove the keys entirely.
        let mut env = std::collections::BTreeMap::new();
        env.insert("NORMAL_START".into(), normal_start.to_rfc3339());
        env.insert("NORMAL_END".into(), start_time.to_rfc3339());
        env.insert("ABNORMAL_START".into(), start_time.to_rfc3339());
        env.insert("ABNORMAL_END".into(), end_time.to_rfc3339());
        env.insert("INPUT_PATH".into(), format!("{}/{}", ctx.config.jfs_dataset_path, payload.dataset));
        env.insert(
            "OUTPUT_PATH".into(),
            format!("{}/{}", ctx.config.nfs_path, execution.id),
        );
        env.insert("WORKSPACE".into(), ctx.config.k8s_namespace.clone());
        env.insert("TIMEZONE".into(), ctx.config.system_timezone.clone());
        for (key, value) in &payload.env_vars {
            env.insert(key.clone(), value.clone());
        }

        let mut labels = std::collections::BTreeMap::new();
        labels.insert("task_id".into(), task.task_id.to_string());
        labels.insert("trace_id".into(), task.trace_id.to_string());
        labels.insert("group_id".into(), task.group_id.to_string());
        labels.insert("task_type".into(), task.task_type().as_str().to_string());
        labels.insert("algorithm".into(), payload.image.clone());
        labels.insert("execution_id".into(), execution.id.to_string());

        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert("task_carrier".into(), task.carrier.to_annotation());
        annotations.insert("trace_carrier".into(), task.carrier.to_annotation());

        let resource = ResourceSpec {
            name: format!("run-algo-{}", &execution.id.simple().to_string()[..8]),
            namespace: ctx.config.k8s_namespace.clone(),
            labels,
            annotations,
            spec: serde_json::json!({"image": payload.image, "tag": payload.tag}),
        };

        if let Err(err) = ctx.cluster.create_batch_job(resource, env).await {
            ctx.result_store
                .patch_execution_state(execution.id, ExecutionState::Failed)
                .await
                .map_err(HandlerError::Store)?;
            publish(
                ctx,
                task,
                EventName::AlgoRunFailed,
                serde_json::json!({"execution_id": execution.id, "reason": err.to_string()}),
            )
            .await;
            // Leave the task row alone: a retry can still succeed, and the
            // worker — not this handler — owns the terminal Error
            // transition once `retry_policy` is exhausted (§7).
            return Err(err);
        }

        // The batch Job's outcome arrives later via the ingress callback
        // (§4.9), so the task stays Running and this handler reports
        // `Detached` rather than `Completed`.
        ctx.task_store
            .patch_state(task.task_id, TaskState::Running)
            .await
            .map_err(HandlerError::Store)?;

        Ok(HandlerOutcome::Detached)
    }
}

async fn publish(ctx: &HandlerContext, task: &Task, name: EventName, payload: serde_json::Value) {
    let event = DomainEvent::new(task.task_id, task.task_type().as_str(), name, payload)
        .with_site(file!(), line!(), "run_algorithm");
    let _ = ctx.events.publish(task.trace_id, event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rca_common::{FaultInjectionRecord, FaultInjectionState, RetryPolicy, RunAlgorithmPayload};

    fn algo_task(record_id: Uuid) -> Task {
        let now = Utc::now();
        Task {
            task_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            payload: TaskPayload::RunAlgorithm(RunAlgorithmPayload {
                image: "detector-abc".into(),
                tag: "v1".into(),
                dataset: "ts-cb-001".into(),
                env_vars: Default::default(),
                fault_injection_record_id: Some(record_id),
            }),
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

    fn seeded_record(pre_duration: i64) -> FaultInjectionRecord {
        let now = Utc::now();
        FaultInjectionRecord {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            fault_type: 1,
            display_config: serde_json::json!({}),
            engine_config: serde_json::json!({}),
            pre_duration,
            start_time: Some(now),
            end_time: Some(now + chrono::Duration::minutes(5)),
            benchmark: "ts-cb".into(),
            injection_name: "ts-cb-ts0-abcd1234".into(),
            state: FaultInjectionState::DetectorSuccess,
            labels: Default::default(),
        }
    }

    #[tokio::test]
    async fn happy_path_creates_execution_and_job() {
        let ctx = HandlerContext::for_test();
        let record = seeded_record(20);
        ctx.fault_injection_store.create(&record).await.unwrap();

        let task = algo_task(record.id);
        ctx.task_store.create(&task).await.unwrap();

        let outcome = RunAlgorithmHandler
            .handle(&ctx, &task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Detached);

        let stored = ctx.task_store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Running);
    }

    #[tokio::test]
    async fn missing_record_is_payload_invalid() {
        let ctx = HandlerContext::for_test();
        let task = algo_task(Uuid::new_v4());
        ctx.task_store.create(&task).await.unwrap();

        let err = RunAlgorithmHandler
            .handle(&ctx, &task, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::PayloadInvalid(_)));
    }
}
