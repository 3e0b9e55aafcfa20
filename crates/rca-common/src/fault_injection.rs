//! `FaultInjectionRecord` — one injection event persisted for analysis.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lifecycle of one fault-injection record, driven entirely by ingress
/// callbacks once the handler has created it with `state = Initial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultInjectionState {
    Initial,
    InjectSuccess,
    InjectFailed,
    BuildSuccess,
    BuildFailed,
    DetectorSuccess,
    DetectorFailed,
}

impl FaultInjectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::InjectSuccess => "inject_success",
            Self::InjectFailed => "inject_failed",
            Self::BuildSuccess => "build_success",
            Self::BuildFailed => "build_failed",
            Self::DetectorSuccess => "detector_success",
            Self::DetectorFailed => "detector_failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "initial" => Ok(Self::Initial),
            "inject_success" => Ok(Self::InjectSuccess),
            "inject_failed" => Ok(Self::InjectFailed),
            "build_success" => Ok(Self::BuildSuccess),
            "build_failed" => Ok(Self::BuildFailed),
            "detector_success" => Ok(Self::DetectorSuccess),
            "detector_failed" => Ok(Self::DetectorFailed),
            other => Err(format!("unknown fault injection state: {other}")),
        }
    }

    /// `InjectFailed`, `BuildFailed`, `DetectorFailed`, `DetectorSuccess` are
    /// terminal outcomes of the record's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InjectFailed | Self::BuildFailed | Self::DetectorSuccess | Self::DetectorFailed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultInjectionRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub fault_type: i32,
    pub display_config: Value,
    pub engine_config: Value,
    pub pre_duration: i64,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub benchmark: String,
    pub injection_name: String,
    pub state: FaultInjectionState,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl FaultInjectionRecord {
    /// Canonical digest of `engine_config`, used both as the uniqueness key
    /// for dedup within a pipeline group (§3 invariant) and as an efficient
    /// index in place of hashing the full JSON value on every comparison.
    ///
    /// Serialization must be canonical (sorted keys) for the digest to be
    /// stable regardless of submission order; `serde_json::Value`'s `Map`
    /// is a `BTreeMap` under the `preserve_order` feature being disabled,
    /// so `to_string` already yields sorted-key output here.
    pub fn engine_config_digest(engine_config: &Value) -> String {
        let canonical = engine_config.to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex_encode(&hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}
