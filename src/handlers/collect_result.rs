//! `CollectResult` handler (§4.8.5).
//!
//! Reads a pair of result files from a shared volume, validates headers,
//! parses floats with "empty cell means absent" null semantics, and
//! persists the parsed rows keyed by `execution_id`.

use async_trait::async_trait;
use rca_common::errors::HandlerError;
use rca_common::events::EventName;
use rca_common::{DetectorResult, ExecutionState, GranularityResult, Task, TaskPayload, TaskState};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::dispatcher::{HandlerOutcome, TaskHandler};
use crate::events::DomainEvent;
use crate::handlers::HandlerContext;

const RESULT_HEADERS: [&str; 3] = ["granularity", "metric", "value"];
const CONCLUSION_HEADERS: [&str; 2] = ["granularity", "anomaly_detected"];

pub struct CollectResultHandler;

#[async_trait]
impl TaskHandler for CollectResultHandler {
    #[instrument(skip_all, fields(task_id = %task.task_id, trace_id = %task.trace_id))]
    async fn handle(
        &self,
        ctx: &HandlerContext,
        task: &Task,
        _cancellation: CancellationToken,
    ) -> Result<HandlerOutcome, HandlerError> {
        let TaskPayload::CollectResult(payload) = &task.payload else {
            return Err(HandlerError::PayloadInvalid(
                "expected CollectResult payload".into(),
            ));
        };

        let outcome = collect(ctx, payload.execution_id, &payload.result_csv_path, &payload.conclusion_csv_path).await;

        match outcome {
            Ok(any_anomaly) => {
                ctx.result_store
                    .patch_execution_state(payload.execution_id, ExecutionState::Succeeded)
                    .await
                    .map_err(HandlerError::Store)?;
                gate_detector(ctx, payload.execution_id, any_anomaly).await?;
                publish(
                    ctx,
                    task,
                    EventName::CollectResult,
                    serde_json::json!({"execution_id": payload.execution_id, "anomaly_detected": any_anomaly}),
                )
                .await;
                ctx.task_store
                    .patch_state(task.task_id, TaskState::Completed)
                    .await
                    .map_err(HandlerError::Store)?;
                Ok(HandlerOutcome::Completed)
            }
            Err(err) => {
                let _ = ctx
                    .result_store
                    .patch_execution_state(payload.execution_id, ExecutionState::Failed)
                    .await;
                publish(
                    ctx,
                    task,
                    EventName::CollectResult,
                    serde_json::json!({"execution_id": payload.execution_id, "error": err.to_string()}),
                )
                .await;
                ctx.task_store
                    .patch_state(task.task_id, TaskState::Error)
                    .await
                    .map_err(HandlerError::Store)?;
                Err(err)
            }
        }
    }
}

/// Parses both CSVs and persists their rows; returns whether any row in
/// `conclusion.csv` flagged an anomaly.
async fn collect(
    ctx: &HandlerContext,
    execution_id: Uuid,
    result_path: &str,
    conclusion_path: &str,
) -> Result<bool, HandlerError> {
    let result_text = tokio::fs::read_to_string(result_path)
        .await
        .map_err(|e| HandlerError::PayloadInvalid(format!("reading {result_path}: {e}")))?;
    let conclusion_text = tokio::fs::read_to_string(conclusion_path)
        .await
        .map_err(|e| HandlerError::PayloadInvalid(format!("reading {conclusion_path}: {e}")))?;

    let granularity_rows = parse_granularity_csv(&result_text, execution_id)?;
    let detector_rows = parse_conclusion_csv(&conclusion_text, execution_id)?;
    let any_anomaly = detector_rows
        .iter()
        .any(|row| row.anomaly_detected == Some(true));

    ctx.result_store
        .save_granularity_results(granularity_rows)
        .await
        .map_err(HandlerError::Store)?;
    ctx.result_store
        .save_detector_results(detector_rows)
        .await
        .map_err(HandlerError::Store)?;

    Ok(any_anomaly)
}

fn parse_granularity_csv(text: &str, execution_id: Uuid) -> Result<Vec<GranularityResult>, HandlerError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(text.as_bytes());
    validate_headers(&mut reader, &RESULT_HEADERS, "result.csv")?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| HandlerError::PayloadInvalid(format!("malformed result.csv row: {e}")))?;
        let granularity = record.get(0).unwrap_or_default().to_string();
        let metric = record.get(1).unwrap_or_default().to_string();
        let raw_value = record.get(2).unwrap_or_default().trim();
        let value = if raw_value.is_empty() {
            None
        } else {
            Some(raw_value.parse::<f64>().map_err(|e| {
                HandlerError::PayloadInvalid(format!("non-numeric value {raw_value:?} in result.csv: {e}"))
            })?)
        };
        rows.push(GranularityResult {
            execution_id,
            granularity,
            metric,
            value,
        });
    }
    Ok(rows)
}

fn parse_conclusion_csv(text: &str, execution_id: Uuid) -> Result<Vec<DetectorResult>, HandlerError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(text.as_bytes());
    validate_headers(&mut reader, &CONCLUSION_HEADERS, "conclusion.csv")?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| HandlerError::PayloadInvalid(format!("malformed conclusion.csv row: {e}")))?;
        let granularity = record.get(0).unwrap_or_default().to_string();
        let raw = record.get(1).unwrap_or_default().trim();
        let anomaly_detected = if raw.is_empty() {
            None
        } else {
            Some(raw.eq_ignore_ascii_case("true")).filter(|_| {
                raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("false")
            })
        };
        if raw_is_malformed(raw) {
            return Err(HandlerError::PayloadInvalid(format!(
                "non-boolean value {raw:?} in conclusion.csv"
            )));
        }
        rows.push(DetectorResult {
            execution_id,
            granularity,
            anomaly_detected,
        });
    }
    Ok(rows)
}

fn raw_is_malformed(raw: &str) -> bool {
    !raw.is_empty() && !raw.eq_ignore_ascii_case("true") && !raw.eq_ignore_ascii_case("false")
}

fn validate_headers<R: std::io::Read>(
    reader: &mut csv::Reader<R>,
    expected: &[&str],
    file_label: &str,
) -> Result<(), HandlerError> {
    let headers = reader
        .headers()
        .map_err(|e| HandlerError::PayloadInvalid(format!("reading {file_label} headers: {e}")))?;
    if headers.iter().collect::<Vec<_>>() != expected {
        return Err(HandlerError::PayloadInvalid(format!(
            "{file_label} has unexpected headers: {headers:?}, expected {expected:?}"
        )));
    }
    Ok(())
}

/// Gates downstream algorithm execution (§4.8.5, GLOSSARY "Detector"): when
/// the execution that produced these results ran the reserved detector
/// algorithm, its conclusion decides the owning `FaultInjectionRecord`'s
/// terminal state.
async fn gate_detector(ctx: &HandlerContext, execution_id: Uuid, any_anomaly: bool) -> Result<(), HandlerError> {
    let Some(execution) = ctx
        .result_store
        .get_execution(execution_id)
        .await
        .map_err(HandlerError::Store)?
    else {
        return Ok(());
    };
    if execution.image != ctx.config.algo_detector {
        return Ok(());
    }
    let Some(record_id) = execution.fault_injection_record_id else {
        return Ok(());
    };
    let Some(mut record) = ctx
        .fault_injection_store
        .get(record_id)
        .await
        .map_err(HandlerError::Store)?
    else {
        return Ok(());
    };
    record.state = if any_anomaly {
        rca_common::FaultInjectionState::DetectorSuccess
    } else {
        rca_common::FaultInjectionState::DetectorFailed
    };
    ctx.fault_injection_store
        .update(&record)
        .await
        .map_err(HandlerError::Store)?;
    Ok(())
}

async fn publish(ctx: &HandlerContext, task: &Task, name: EventName, payload: serde_json::Value) {
    let event = DomainEvent::new(task.task_id, task.task_type().as_str(), name, payload)
        .with_site(file!(), line!(), "collect_result");
    let _ = ctx.events.publish(task.trace_id, event).await;
}
