//! Conversions between the wire types and `rca-common`'s domain types.

use std::str::FromStr;

use chrono::Utc;
use rca_common::{RetryPolicy, Task, TaskPayload, TaskState};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("invalid uuid in field {field}: {source}")]
    InvalidUuid {
        field: &'static str,
        #[source]
        source: uuid::Error,
    },
    #[error("malformed payload_json: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("task_type {declared} does not match payload_json's type {actual}")]
    TaskTypeMismatch { declared: String, actual: String },
}

/// Builds a fresh [`Task`] from a [`crate::SubmitRequest`], generating
/// `task_id` and any of `trace_id`/`group_id` left empty by the caller.
pub fn task_from_submit_request(request: &crate::SubmitRequest) -> Result<Task, ProtoError> {
    let payload: TaskPayload = serde_json::from_str(&request.payload_json)?;
    if payload.task_type().as_str() != request.task_type {
        return Err(ProtoError::TaskTypeMismatch {
            declared: request.task_type.clone(),
            actual: payload.task_type().as_str().to_string(),
        });
    }

    let trace_id = parse_or_new(&request.trace_id, "trace_id")?;
    let group_id = parse_or_new(&request.group_id, "group_id")?;
    let now = Utc::now();

    Ok(Task {
        task_id: Uuid::new_v4(),
        group_id,
        trace_id,
        payload,
        immediate: request.immediate,
        execute_time: request.execute_time,
        cron_expr: request.cron_expr.clone(),
        retry_policy: RetryPolicy {
            max_attempts: if request.retry_max_attempts == 0 {
                RetryPolicy::default().max_attempts
            } else {
                request.retry_max_attempts
            },
            backoff_seconds: if request.retry_backoff_seconds == 0 {
                RetryPolicy::default().backoff_seconds
            } else {
                request.retry_backoff_seconds
            },
        },
        restart_attempts: 0,
        state: TaskState::Pending,
        carrier: Default::default(),
        project_id: request.project_id.clone(),
        user_id: request.user_id.clone(),
        created_at: now,
        updated_at: now,
    })
}

fn parse_or_new(raw: &str, field: &'static str) -> Result<Uuid, ProtoError> {
    if raw.is_empty() {
        return Ok(Uuid::new_v4());
    }
    Uuid::from_str(raw).map_err(|source| ProtoError::InvalidUuid { field, source })
}

pub fn event_envelope(
    id: &str,
    task_id: uuid::Uuid,
    task_type: &str,
    event: &rca_common::events::DomainEvent,
) -> crate::EventEnvelope {
    crate::EventEnvelope {
        id: id.to_string(),
        task_id: task_id.to_string(),
        task_type: task_type.to_string(),
        event_name: event.event_name.as_str().to_string(),
        payload_json: event.payload.to_string(),
    }
}
