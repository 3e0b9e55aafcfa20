//! The persistence-store seam (C1): typed operations over `Task` and
//! `FaultInjectionRecord`. All writes are transactional within a single
//! store call; the scheduler never holds a transaction open across a
//! cluster call, so the trait's methods are each a complete unit of work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rca_common::errors::StoreError;
use rca_common::{
    ContainerRecord, DetectorResult, ExecutionResult, ExecutionState, FaultInjectionRecord,
    GranularityResult, Task, TaskState,
};
use uuid::Uuid;

/// Filters accepted by [`TaskStore::list`], matching the required indexes
/// in §6: by trace, by group, by `(project_id, state)`, by `(type, state)`,
/// by execute-time window.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub trace_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub project_id: Option<String>,
    pub state: Option<TaskState>,
    pub task_type: Option<rca_common::TaskType>,
    pub execute_before: Option<DateTime<Utc>>,
    pub execute_after: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: &Task) -> Result<(), StoreError>;
    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;
    /// Writes a new state, refreshing `updated_at`. Returns `StoreError` if
    /// the row is already terminal and the caller is not batch admin —
    /// callers needing the admin override use [`TaskStore::force_patch_state`].
    async fn patch_state(&self, task_id: Uuid, state: TaskState) -> Result<(), StoreError>;
    async fn force_patch_state(&self, task_id: Uuid, state: TaskState) -> Result<(), StoreError>;
    async fn increment_restart_attempts(&self, task_id: Uuid) -> Result<u32, StoreError>;
}

#[async_trait]
pub trait FaultInjectionStore: Send + Sync {
    /// Fails with `StoreError::AlreadyExists` if `injection_name` collides.
    async fn create(&self, record: &FaultInjectionRecord) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<FaultInjectionRecord>, StoreError>;
    async fn get_by_task(&self, task_id: Uuid) -> Result<Option<FaultInjectionRecord>, StoreError>;
    async fn get_by_injection_name(
        &self,
        injection_name: &str,
    ) -> Result<Option<FaultInjectionRecord>, StoreError>;
    async fn update(&self, record: &FaultInjectionRecord) -> Result<(), StoreError>;
    /// Returns existing digests for records belonging to the pipeline
    /// group, used to enforce the `engine_config` uniqueness invariant at
    /// submit time.
    async fn engine_config_digests_for_group(
        &self,
        group_id: Uuid,
    ) -> Result<Vec<String>, StoreError>;
}

/// Persists the records `RunAlgorithm`, `CollectResult`, and
/// `BuildContainer` produce (§4.8.4-§4.8.6). Kept as one trait rather than
/// three since every real implementation backs it with the same SQLite
/// connection the other stores use.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn create_execution(&self, execution: &ExecutionResult) -> Result<(), StoreError>;
    async fn patch_execution_state(
        &self,
        execution_id: Uuid,
        state: ExecutionState,
    ) -> Result<(), StoreError>;
    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionResult>, StoreError>;

    async fn save_granularity_results(
        &self,
        rows: Vec<GranularityResult>,
    ) -> Result<(), StoreError>;
    async fn save_detector_results(&self, rows: Vec<DetectorResult>) -> Result<(), StoreError>;

    /// Idempotent by `(image_name, tag)`: a second create with the same key
    /// returns `Ok` without inserting a duplicate row (§4.8.6).
    async fn upsert_container(&self, container: &ContainerRecord) -> Result<(), StoreError>;
    async fn get_container_by_name_tag(
        &self,
        image_name: &str,
        tag: &str,
    ) -> Result<Option<ContainerRecord>, StoreError>;
}
