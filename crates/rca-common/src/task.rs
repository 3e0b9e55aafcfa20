//! The `Task` aggregate — one scheduled unit of work.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::carrier::Carrier;

/// One of the six task kinds the dispatcher routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    RestartPedestal,
    FaultInjection,
    BuildDatapack,
    RunAlgorithm,
    CollectResult,
    BuildContainer,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RestartPedestal => "restart_pedestal",
            Self::FaultInjection => "fault_injection",
            Self::BuildDatapack => "build_datapack",
            Self::RunAlgorithm => "run_algorithm",
            Self::CollectResult => "collect_result",
            Self::BuildContainer => "build_container",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "restart_pedestal" => Ok(Self::RestartPedestal),
            "fault_injection" => Ok(Self::FaultInjection),
            "build_datapack" => Ok(Self::BuildDatapack),
            "run_algorithm" => Ok(Self::RunAlgorithm),
            "collect_result" => Ok(Self::CollectResult),
            "build_container" => Ok(Self::BuildContainer),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle states a `Task` row moves through. Once a task reaches
/// `Completed`, `Error`, or `Canceled` the row is terminal — no further
/// state write occurs except by batch admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Scheduled,
    Running,
    Rescheduled,
    Completed,
    Error,
    Canceled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Rescheduled => "rescheduled",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "rescheduled" => Ok(Self::Rescheduled),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown task state: {other}")),
        }
    }

    /// Terminal states accept no further writes except by batch admin.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Canceled)
    }
}

/// Handler-level retry configuration, distinct from `restart_attempts`
/// (the resource-contention reschedule counter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_seconds: 30,
        }
    }
}

/// Payload for `RestartPedestal` (§4.8.1). `inject_payload` is carried
/// through verbatim into the `FaultInjection` task submitted on completion;
/// `namespace` inside it is informational until `GetFree` assigns the
/// namespace actually locked for this pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPedestalPayload {
    pub interval_min: i64,
    pub fault_duration_min: i64,
    pub pedestal_ref: String,
    pub helm_values: Value,
    pub benchmark_ref: String,
    pub inject_payload: FaultInjectionPayload,
}

/// Payload for `FaultInjection` (§4.8.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultInjectionPayload {
    pub benchmark: String,
    pub fault_type: i32,
    pub namespace: String,
    pub pre_duration: i64,
    pub display_config: Value,
    pub engine_config: Value,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Payload for `BuildDatapack` (§4.8.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildDatapackPayload {
    pub benchmark: String,
    pub dataset_name: String,
    pub namespace: String,
    pub pre_duration: i64,
    pub service: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Locates the `FaultInjectionRecord` this datapack is built from when
    /// `start_time`/`end_time` are absent from the payload itself.
    #[serde(default)]
    pub fault_injection_record_id: Option<Uuid>,
}

/// Payload for `RunAlgorithm` (§4.8.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAlgorithmPayload {
    pub image: String,
    pub tag: String,
    pub dataset: String,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// `fault_injection_record_id` locates the time window this run reads
    /// from when the payload itself does not carry one.
    #[serde(default)]
    pub fault_injection_record_id: Option<Uuid>,
}

/// Payload for `CollectResult` (§4.8.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectResultPayload {
    pub execution_id: Uuid,
    pub result_csv_path: String,
    pub conclusion_csv_path: String,
}

/// Payload for `BuildContainer` (§4.8.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildContainerPayload {
    pub image_name: String,
    pub tag: String,
    pub source_mount: String,
    pub dockerfile_path: String,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
}

/// `Task.payload` modeled as a tagged variant over per-type structs, per the
/// heterogeneous-payload design note: the variant tag doubles as the
/// persisted `type` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    RestartPedestal(RestartPedestalPayload),
    FaultInjection(FaultInjectionPayload),
    BuildDatapack(BuildDatapackPayload),
    RunAlgorithm(RunAlgorithmPayload),
    CollectResult(CollectResultPayload),
    BuildContainer(BuildContainerPayload),
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::RestartPedestal(_) => TaskType::RestartPedestal,
            Self::FaultInjection(_) => TaskType::FaultInjection,
            Self::BuildDatapack(_) => TaskType::BuildDatapack,
            Self::RunAlgorithm(_) => TaskType::RunAlgorithm,
            Self::CollectResult(_) => TaskType::CollectResult,
            Self::BuildContainer(_) => TaskType::BuildContainer,
        }
    }
}

/// One scheduled unit of work, per §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub group_id: Uuid,
    pub trace_id: Uuid,
    pub payload: TaskPayload,
    pub immediate: bool,
    pub execute_time: i64,
    #[serde(default)]
    pub cron_expr: Option<String>,
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub restart_attempts: u32,
    pub state: TaskState,
    #[serde(default)]
    pub carrier: Carrier,
    pub project_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    /// `Task` in {Running, Rescheduled} holds at most one namespace lock and
    /// at most one rate-limit token; outside those states it never should.
    pub fn can_hold_resources(&self) -> bool {
        matches!(self.state, TaskState::Running | TaskState::Rescheduled)
    }
}
