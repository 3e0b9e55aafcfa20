//! The closed set of event names emitted on `stream:log:{trace_id}` (§6).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum EventName {
    FaultInjectionStarted,
    FaultInjectionCompleted,
    FaultInjectionFailed,
    DatasetBuildSucceed,
    DatasetBuildFailed,
    AlgoRunSucceed,
    AlgoRunFailed,
    ImageBuildSucceed,
    ImageBuildFailed,
    RestartServiceStarted,
    RestartServiceCompleted,
    RestartServiceFailed,
    NoNamespaceAvailable,
    CollectResult,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FaultInjectionStarted => "FaultInjectionStarted",
            Self::FaultInjectionCompleted => "FaultInjectionCompleted",
            Self::FaultInjectionFailed => "FaultInjectionFailed",
            Self::DatasetBuildSucceed => "DatasetBuildSucceed",
            Self::DatasetBuildFailed => "DatasetBuildFailed",
            Self::AlgoRunSucceed => "AlgoRunSucceed",
            Self::AlgoRunFailed => "AlgoRunFailed",
            Self::ImageBuildSucceed => "ImageBuildSucceed",
            Self::ImageBuildFailed => "ImageBuildFailed",
            Self::RestartServiceStarted => "RestartServiceStarted",
            Self::RestartServiceCompleted => "RestartServiceCompleted",
            Self::RestartServiceFailed => "RestartServiceFailed",
            Self::NoNamespaceAvailable => "NoNamespaceAvailable",
            Self::CollectResult => "CollectResult",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry appended to `stream:log:{trace_id}` (§4.10): fields
/// `{task_id, task_type, event_name, payload, file, line, fn}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub task_id: Uuid,
    pub task_type: String,
    pub event_name: EventName,
    pub payload: Value,
    pub file: String,
    pub line: u32,
    pub r#fn: String,
}

impl DomainEvent {
    pub fn new(task_id: Uuid, task_type: &str, event_name: EventName, payload: Value) -> Self {
        Self {
            task_id,
            task_type: task_type.to_string(),
            event_name,
            payload,
            file: String::new(),
            line: 0,
            r#fn: String::new(),
        }
    }

    /// Tags the call site, mirroring the `{file, line, fn}` emission fields
    /// the spec requires for every appended entry.
    pub fn with_site(mut self, file: &str, line: u32, func: &str) -> Self {
        self.file = file.to_string();
        self.line = line;
        self.r#fn = func.to_string();
        self
    }
}

/// Emits a [`DomainEvent`] tagged with the current call site.
#[macro_export]
macro_rules! domain_event {
    ($task_id:expr, $task_type:expr, $event_name:expr, $payload:expr) => {
        $crate::events::DomainEvent::new($task_id, $task_type, $event_name, $payload)
            .with_site(file!(), line!(), concat!(module_path!()))
    };
}
