//! `BuildContainer` handler (§4.8.6).

use async_trait::async_trait;
use chrono::Utc;
use rca_common::errors::HandlerError;
use rca_common::events::EventName;
use rca_common::{ContainerRecord, Task, TaskPayload, TaskState};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::cluster::BuildRequest;
use crate::dispatcher::{HandlerOutcome, TaskHandler};
use crate::events::DomainEvent;
use crate::handlers::HandlerContext;

pub struct BuildContainerHandler;

#[async_trait]
impl TaskHandler for BuildContainerHandler {
    #[instrument(skip_all, fields(task_id = %task.task_id, trace_id = %task.trace_id))]
    async fn handle(
        &self,
        ctx: &HandlerContext,
        task: &Task,
        _cancellation: CancellationToken,
    ) -> Result<HandlerOutcome, HandlerError> {
        let TaskPayload::BuildContainer(payload) = &task.payload else {
            return Err(HandlerError::PayloadInvalid(
                "expected BuildContainer payload".into(),
            ));
        };

        // Idempotent by (image_name, tag): a prior successful build for the
        // same key means there's nothing left for this task to do.
        if let Some(existing) = ctx
            .result_store
            .get_container_by_name_tag(&payload.image_name, &payload.tag)
            .await
            .map_err(HandlerError::Store)?
        {
            publish(
                ctx,
                task,
                EventName::ImageBuildSucceed,
                serde_json::json!({"image_digest": existing.image_digest, "reused": true}),
            )
            .await;
            ctx.task_store
                .patch_state(task.task_id, TaskState::Completed)
                .await
                .map_err(HandlerError::Store)?;
            return Ok(HandlerOutcome::Completed);
        }

        let request = BuildRequest {
            image_name: payload.image_name.clone(),
            tag: payload.tag.clone(),
            source_mount: payload.source_mount.clone(),
            dockerfile_path: payload.dockerfile_path.clone(),
            build_args: payload.build_args.clone(),
        };

        let outcome = ctx.builder.build(request).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                publish(
                    ctx,
                    task,
                    EventName::ImageBuildFailed,
                    serde_json::json!({"reason": err.to_string()}),
                )
                .await;
                ctx.task_store
                    .patch_state(task.task_id, TaskState::Error)
                    .await
                    .map_err(HandlerError::Store)?;
                return Err(err);
            }
        };

        let record = ContainerRecord {
            id: Uuid::new_v4(),
            image_name: payload.image_name.clone(),
            tag: payload.tag.clone(),
            image_digest: outcome.image_digest.clone(),
            build_args: payload.build_args.clone(),
            created_at: Utc::now(),
        };
        ctx.result_store
            .upsert_container(&record)
            .await
            .map_err(HandlerError::Store)?;

        publish(
            ctx,
            task,
            EventName::ImageBuildSucceed,
            serde_json::json!({"image_digest": record.image_digest, "reused": false}),
        )
        .await;

        ctx.task_store
            .patch_state(task.task_id, TaskState::Completed)
            .await
            .map_err(HandlerError::Store)?;

        Ok(HandlerOutcome::Completed)
    }
}

async fn publish(ctx: &HandlerContext, task: &Task, name: EventName, payload: serde_json::Value) {
    let event = DomainEvent::new(task.task_id, task.task_type().as_str(), name, payload)
        .with_site(file!(), line!(), "build_container");
    let _ = ctx.events.publish(task.trace_id, event).await;
}
