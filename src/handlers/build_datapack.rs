//! `BuildDatapack` handler (§4.8.3).

use async_trait::async_trait;
use rca_common::errors::HandlerError;
use rca_common::events::EventName;
use rca_common::{Task, TaskPayload, TaskState};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::cluster::ResourceSpec;
use crate::dispatcher::{HandlerOutcome, TaskHandler};
use crate::events::DomainEvent;
use crate::handlers::HandlerContext;

pub struct BuildDatapackHandler;

#[async_trait]
impl TaskHandler for BuildDatapackHandler {
    #[instrument(skip_all, fields(task_id = %task.task_id, trace_id = %task.trace_id))]
    async fn handle(
        &self,
        ctx: &HandlerContext,
        task: &Task,
        _cancellation: CancellationToken,
    ) -> Result<HandlerOutcome, HandlerError> {
        let TaskPayload::BuildDatapack(payload) = &task.payload else {
            return Err(HandlerError::PayloadInvalid(
                "expected BuildDatapack payload".into(),
            ));
        };

        let (start_time, end_time) = if let (Some(start), Some(end)) =
            (payload.start_time, payload.end_time)
        {
            (start, end)
        } else {
            let record_id = payload.fault_injection_record_id.ok_or_else(|| {
                HandlerError::PayloadInvalid(
                    "missing start_time/end_time and fault_injection_record_id".into(),
                )
            })?;
            let record = ctx
                .fault_injection_store
                .get(record_id)
                .await
                .map_err(HandlerError::Store)?
                .ok_or_else(|| {
                    HandlerError::PayloadInvalid(format!("fault injection record {record_id} not found"))
                })?;
            let (Some(start), Some(end)) = (record.start_time, record.end_time) else {
                return Err(HandlerError::PayloadInvalid(
                    "fault injection record has no recorded time window yet".into(),
                ));
            };
            (start, end)
        };

        let normal_start = start_time - chrono::Duration::minutes(payload.pre_duration);

        let mut env = std::collections::BTreeMap::new();
        env.insert("NORMAL_START".into(), normal_start.to_rfc3339());
        env.insert("NORMAL_END".into(), start_time.to_rfc3339());
        env.insert("ABNORMAL_START".into(), start_time.to_rfc3339());
        env.insert("ABNORMAL_END".into(), end_time.to_rfc3339());
        env.insert("INPUT_PATH".into(), ctx.config.nfs_path.clone());
        env.insert(
            "OUTPUT_PATH".into(),
            format!("{}/{}", ctx.config.jfs_dataset_path, payload.dataset_name),
        );
        env.insert("NAMESPACE".into(), payload.namespace.clone());
        env.insert("SERVICE".into(), payload.service.clone());
        env.insert("TIMEZONE".into(), ctx.config.system_timezone.clone());
        env.insert("WORKSPACE".into(), ctx.config.k8s_namespace.clone());

        let mut labels = std::collections::BTreeMap::new();
        labels.insert("task_id".into(), task.task_id.to_string());
        labels.insert("trace_id".into(), task.trace_id.to_string());
        labels.insert("group_id".into(), task.group_id.to_string());
        labels.insert("task_type".into(), task.task_type().as_str().to_string());
        labels.insert("benchmark".into(), payload.benchmark.clone());
        labels.insert("dataset".into(), payload.dataset_name.clone());
        labels.insert("namespace".into(), payload.namespace.clone());
        if let Some(record_id) = payload.fault_injection_record_id {
            labels.insert("fault_injection_record_id".into(), record_id.to_string());
        }

        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert("task_carrier".into(), task.carrier.to_annotation());
        annotations.insert("trace_carrier".into(), task.carrier.to_annotation());

        let resource = ResourceSpec {
            name: format!("build-datapack-{}", &task.task_id.simple().to_string()[..8]),
            namespace: ctx.config.k8s_namespace.clone(),
            labels,
            annotations,
            spec: serde_json::json!({}),
        };

        if let Err(err) = ctx.cluster.create_batch_job(resource, env).await {
            publish(
                ctx,
                task,
                EventName::DatasetBuildFailed,
                serde_json::json!({"reason": err.to_string()}),
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
        .with_site(file!(), line!(), "build_datapack");
    let _ = ctx.events.publish(task.trace_id, event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rca_common::{BuildDatapackPayload, RetryPolicy};
    use uuid::Uuid;

    fn datapack_task(start: chrono::DateTime<Utc>, end: chrono::DateTime<Utc>) -> Task {
        let now = Utc::now();
        Task {
            task_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            payload: TaskPayload::BuildDatapack(BuildDatapackPayload {
                benchmark: "ts-cb".into(),
                dataset_name: "ts-cb-001".into(),
                namespace: "ts0".into(),
                pre_duration: 20,
                service: "ts-order".into(),
                start_time: Some(start),
                end_time: Some(end),
                fault_injection_record_id: None,
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

    #[tokio::test]
    async fn happy_path_creates_batch_job_with_time_env() {
        let ctx = HandlerContext::for_test();
        let end = Utc::now();
        let start = end - chrono::Duration::minutes(5);
        let task = datapack_task(start, end);
        ctx.task_store.create(&task).await.unwrap();

        let outcome = BuildDatapackHandler
            .handle(&ctx, &task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Detached);

        let stored = ctx.task_store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Running);
    }

    #[tokio::test]
    async fn missing_time_window_and_record_id_is_payload_invalid() {
        let ctx = HandlerContext::for_test();
        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            payload: TaskPayload::BuildDatapack(BuildDatapackPayload {
                benchmark: "ts-cb".into(),
                dataset_name: "ts-cb-001".into(),
                namespace: "ts0".into(),
                pre_duration: 20,
                service: "ts-order".into(),
                start_time: None,
                end_time: None,
                fault_injection_record_id: None,
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
        };
        ctx.task_store.create(&task).await.unwrap();

        let err = BuildDatapackHandler
            .handle(&ctx, &task, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::PayloadInvalid(_)));
    }
}
