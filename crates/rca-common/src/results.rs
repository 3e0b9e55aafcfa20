//! Downstream pipeline records (§4.8.4-§4.8.6): `ExecutionResult`, the
//! granularity/detector rows parsed from `CollectResult`, and `Container`.
//! These mirror `FaultInjectionRecord`'s shape: a handler creates the row
//! with an initial state, and either a later handler or a C9 callback
//! patches it to a terminal state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Initial,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub fault_injection_record_id: Option<Uuid>,
    pub image: String,
    pub tag: String,
    pub dataset: String,
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
}

/// One row parsed out of `result.csv` for a given `execution_id` (§4.8.5).
/// `value = None` realizes the "empty cell ⇒ absent" null semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GranularityResult {
    pub execution_id: Uuid,
    pub granularity: String,
    pub metric: String,
    pub value: Option<f64>,
}

/// One row parsed out of `conclusion.csv`: whether the detector algorithm
/// flagged an anomaly at a given granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorResult {
    pub execution_id: Uuid,
    pub granularity: String,
    pub anomaly_detected: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: Uuid,
    pub image_name: String,
    pub tag: String,
    pub image_digest: String,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_state_round_trips_through_serde() {
        let json = serde_json::to_string(&ExecutionState::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
        let back: ExecutionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ExecutionState::Succeeded);
    }

    #[test]
    fn granularity_result_absent_value_serializes_as_null() {
        let row = GranularityResult {
            execution_id: Uuid::nil(),
            granularity: "p99".into(),
            metric: "latency_ms".into(),
            value: None,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert!(json["value"].is_null());
    }
}
