//! Shared domain types for the RCA experiment controller.
//!
//! This crate has no async runtime dependency and no storage dependency: it
//! is the set of types every other crate in the workspace agrees on, so the
//! wire protocol (`rca-proto`) and the runtime daemon (`rca-runtime`) can
//! both depend on it without pulling in the scheduler's trait seams.

pub mod carrier;
pub mod errors;
pub mod events;
pub mod fault_injection;
pub mod results;
pub mod task;

pub use carrier::Carrier;
pub use errors::{
    BrokerError, DispatchError, HandlerError, NamespaceLockError, RateLimiterError, StoreError,
};
pub use events::EventName;
pub use fault_injection::{FaultInjectionRecord, FaultInjectionState};
pub use results::{ContainerRecord, DetectorResult, ExecutionResult, ExecutionState, GranularityResult};
pub use task::{
    BuildContainerPayload, BuildDatapackPayload, CollectResultPayload, FaultInjectionPayload,
    RestartPedestalPayload, RetryPolicy, RunAlgorithmPayload, Task, TaskPayload, TaskState, TaskType,
};
