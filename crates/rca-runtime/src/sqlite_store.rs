//! SQLite-backed implementation of the persistence store (C1): `TaskStore`,
//! `FaultInjectionStore`, and `ResultStore` over one connection, matching
//! the required indexes from §6. Every query runs on the blocking thread
//! pool via `spawn_blocking`, since `rusqlite` is synchronous; the mutex
//! around the connection mirrors how a single writer is shared across the
//! worker pool's concurrent executions.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rca_common::errors::StoreError;
use rca_common::{
    ContainerRecord, DetectorResult, ExecutionResult, ExecutionState, FaultInjectionRecord,
    GranularityResult, Task, TaskState, TaskType,
};
use rca_core::store::{FaultInjectionStore, ResultStore, TaskFilter, TaskStore};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    group_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    task_type TEXT NOT NULL,
    state TEXT NOT NULL,
    execute_time INTEGER NOT NULL,
    restart_attempts INTEGER NOT NULL,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_trace ON tasks(trace_id);
CREATE INDEX IF NOT EXISTS idx_tasks_group ON tasks(group_id);
CREATE INDEX IF NOT EXISTS idx_tasks_project_state ON tasks(project_id, state);
CREATE INDEX IF NOT EXISTS idx_tasks_type_state ON tasks(task_type, state);
CREATE INDEX IF NOT EXISTS idx_tasks_execute_time ON tasks(execute_time);

CREATE TABLE IF NOT EXISTS fault_injection_records (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    injection_name TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL,
    start_time TEXT,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fir_task_state ON fault_injection_records(task_id, state);
CREATE INDEX IF NOT EXISTS idx_fir_start_time ON fault_injection_records(start_time);

CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    state TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS granularity_results (
    execution_id TEXT NOT NULL,
    granularity TEXT NOT NULL,
    metric TEXT NOT NULL,
    value REAL
);
CREATE INDEX IF NOT EXISTS idx_granularity_execution ON granularity_results(execution_id);

CREATE TABLE IF NOT EXISTS detector_results (
    execution_id TEXT NOT NULL,
    granularity TEXT NOT NULL,
    anomaly_detected INTEGER
);
CREATE INDEX IF NOT EXISTS idx_detector_execution ON detector_results(execution_id);

CREATE TABLE IF NOT EXISTS containers (
    image_name TEXT NOT NULL,
    tag TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (image_name, tag)
);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (creating if absent) the database at `path` and applies the
    /// schema. `path` of `:memory:` is accepted for tests.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking thread pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poison| poison.into_inner());
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task panicked: {e}")))?
        .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Backend(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Backend(e.to_string()))
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let task_id = task.task_id;
        let trace_id = task.trace_id;
        let group_id = task.group_id;
        let project_id = task.project_id.clone();
        let task_type = task.task_type().as_str();
        let state = task.state.as_str();
        let execute_time = task.execute_time;
        let restart_attempts = task.restart_attempts as i64;
        let body = encode(task)?;
        let updated_at = task.updated_at.to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks
                 (task_id, trace_id, group_id, project_id, task_type, state, execute_time, restart_attempts, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    task_id.to_string(),
                    trace_id.to_string(),
                    group_id.to_string(),
                    project_id,
                    task_type,
                    state,
                    execute_time,
                    restart_attempts,
                    body,
                    updated_at,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|err| match err {
            StoreError::Backend(msg) if msg.contains("UNIQUE constraint failed") => {
                StoreError::AlreadyExists(task_id.to_string())
            }
            other => other,
        })
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let body: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT body FROM tasks WHERE task_id = ?1",
                    params![task_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        body.map(|b| decode(&b)).transpose()
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let filter = filter.clone();
        let bodies: Vec<String> = self
            .with_conn(move |conn| {
                let mut sql = String::from("SELECT body FROM tasks WHERE 1=1");
                let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                if let Some(trace_id) = filter.trace_id {
                    sql.push_str(" AND trace_id = ?");
                    values.push(Box::new(trace_id.to_string()));
                }
                if let Some(group_id) = filter.group_id {
                    sql.push_str(" AND group_id = ?");
                    values.push(Box::new(group_id.to_string()));
                }
                if let Some(project_id) = &filter.project_id {
                    sql.push_str(" AND project_id = ?");
                    values.push(Box::new(project_id.clone()));
                }
                if let Some(state) = filter.state {
                    sql.push_str(" AND state = ?");
                    values.push(Box::new(state.as_str().to_string()));
                }
                if let Some(task_type) = filter.task_type {
                    sql.push_str(" AND task_type = ?");
                    values.push(Box::new(task_type.as_str().to_string()));
                }
                if let Some(before) = filter.execute_before {
                    sql.push_str(" AND execute_time <= ?");
                    values.push(Box::new(before.timestamp()));
                }
                if let Some(after) = filter.execute_after {
                    sql.push_str(" AND execute_time >= ?");
                    values.push(Box::new(after.timestamp()));
                }
                let mut stmt = conn.prepare(&sql)?;
                let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
                let rows = stmt.query_map(refs.as_slice(), |row| row.get::<_, String>(0))?;
                rows.collect()
            })
            .await?;
        bodies.iter().map(|b| decode(b)).collect()
    }

    async fn patch_state(&self, task_id: Uuid, state: TaskState) -> Result<(), StoreError> {
        let current = self
            .get(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        if current.state.is_terminal() {
            return Err(StoreError::Backend(format!(
                "task {task_id} is already terminal"
            )));
        }
        self.force_patch_state(task_id, state).await
    }

    async fn force_patch_state(&self, task_id: Uuid, state: TaskState) -> Result<(), StoreError> {
        let mut task = self
            .get(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        task.state = state;
        task.updated_at = Utc::now();
        let body = encode(&task)?;
        let state_str = state.as_str();
        let updated_at = task.updated_at.to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE tasks SET state = ?1, body = ?2, updated_at = ?3 WHERE task_id = ?4",
                params![state_str, body, updated_at, task_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn increment_restart_attempts(&self, task_id: Uuid) -> Result<u32, StoreError> {
        let mut task = self
            .get(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        task.restart_attempts += 1;
        let attempts = task.restart_attempts;
        let body = encode(&task)?;
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE tasks SET restart_attempts = ?1, body = ?2 WHERE task_id = ?3",
                params![attempts as i64, body, task_id.to_string()],
            )?;
            Ok(())
        })
        .await?;
        Ok(attempts)
    }
}

#[async_trait]
impl FaultInjectionStore for SqliteStore {
    async fn create(&self, record: &FaultInjectionRecord) -> Result<(), StoreError> {
        let id = record.id;
        let task_id = record.task_id;
        let injection_name = record.injection_name.clone();
        let state = record.state.as_str();
        let start_time = record.start_time.map(|t| t.to_rfc3339());
        let body = encode(record)?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO fault_injection_records
                 (id, task_id, injection_name, state, start_time, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    task_id.to_string(),
                    injection_name,
                    state,
                    start_time,
                    body,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|err| match err {
            StoreError::Backend(msg) if msg.contains("UNIQUE constraint failed") => {
                StoreError::AlreadyExists(record.injection_name.clone())
            }
            other => other,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<FaultInjectionRecord>, StoreError> {
        let body: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT body FROM fault_injection_records WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        body.map(|b| decode(&b)).transpose()
    }

    async fn get_by_task(&self, task_id: Uuid) -> Result<Option<FaultInjectionRecord>, StoreError> {
        let body: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT body FROM fault_injection_records WHERE task_id = ?1",
                    params![task_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        body.map(|b| decode(&b)).transpose()
    }

    async fn get_by_injection_name(
        &self,
        injection_name: &str,
    ) -> Result<Option<FaultInjectionRecord>, StoreError> {
        let injection_name = injection_name.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT body FROM fault_injection_records WHERE injection_name = ?1",
                    params![injection_name],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        body.map(|b| decode(&b)).transpose()
    }

    async fn update(&self, record: &FaultInjectionRecord) -> Result<(), StoreError> {
        let id = record.id;
        let state = record.state.as_str();
        let start_time = record.start_time.map(|t| t.to_rfc3339());
        let body = encode(record)?;
        let changed = self
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE fault_injection_records SET state = ?1, start_time = ?2, body = ?3 WHERE id = ?4",
                    params![state, start_time, body, id.to_string()],
                )
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(record.id.to_string()));
        }
        Ok(())
    }

    async fn engine_config_digests_for_group(&self, group_id: Uuid) -> Result<Vec<String>, StoreError> {
        let bodies: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT fir.body FROM fault_injection_records fir
                     JOIN tasks t ON t.task_id = fir.task_id
                     WHERE t.group_id = ?1",
                )?;
                let rows = stmt.query_map(params![group_id.to_string()], |row| row.get::<_, String>(0))?;
                rows.collect()
            })
            .await?;
        bodies
            .iter()
            .map(|b| decode::<FaultInjectionRecord>(b))
            .map(|r| r.map(|record| FaultInjectionRecord::engine_config_digest(&record.engine_config)))
            .collect()
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn create_execution(&self, execution: &ExecutionResult) -> Result<(), StoreError> {
        let id = execution.id;
        let task_id = execution.task_id;
        let state = state_str(execution.state);
        let body = encode(execution)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO executions (id, task_id, state, body) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), task_id.to_string(), state, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn patch_execution_state(
        &self,
        execution_id: Uuid,
        state: ExecutionState,
    ) -> Result<(), StoreError> {
        let mut execution = self
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;
        execution.state = state;
        let body = encode(&execution)?;
        let state_col = state_str(state);
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE executions SET state = ?1, body = ?2 WHERE id = ?3",
                params![state_col, body, execution_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionResult>, StoreError> {
        let body: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT body FROM executions WHERE id = ?1",
                    params![execution_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        body.map(|b| decode(&b)).transpose()
    }

    async fn save_granularity_results(&self, rows: Vec<GranularityResult>) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for row in &rows {
                tx.execute(
                    "INSERT INTO granularity_results (execution_id, granularity, metric, value)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![row.execution_id.to_string(), row.granularity, row.metric, row.value],
                )?;
            }
            tx.commit()
        })
        .await
    }

    async fn save_detector_results(&self, rows: Vec<DetectorResult>) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for row in &rows {
                tx.execute(
                    "INSERT INTO detector_results (execution_id, granularity, anomaly_detected)
                     VALUES (?1, ?2, ?3)",
                    params![row.execution_id.to_string(), row.granularity, row.anomaly_detected],
                )?;
            }
            tx.commit()
        })
        .await
    }

    async fn upsert_container(&self, container: &ContainerRecord) -> Result<(), StoreError> {
        let image_name = container.image_name.clone();
        let tag = container.tag.clone();
        let body = encode(container)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO containers (image_name, tag, body) VALUES (?1, ?2, ?3)",
                params![image_name, tag, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_container_by_name_tag(
        &self,
        image_name: &str,
        tag: &str,
    ) -> Result<Option<ContainerRecord>, StoreError> {
        let image_name = image_name.to_string();
        let tag = tag.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT body FROM containers WHERE image_name = ?1 AND tag = ?2",
                    params![image_name, tag],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        body.map(|b| decode(&b)).transpose()
    }
}

fn state_str(state: ExecutionState) -> &'static str {
    match state {
        ExecutionState::Initial => "initial",
        ExecutionState::Succeeded => "succeeded",
        ExecutionState::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rca_common::{CollectResultPayload, RetryPolicy, TaskPayload};

    fn sample_task() -> Task {
        let now = Utc::now();
        Task {
            task_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            payload: TaskPayload::CollectResult(CollectResultPayload {
                execution_id: Uuid::new_v4(),
                result_csv_path: "result.csv".into(),
                conclusion_csv_path: "conclusion.csv".into(),
            }),
            immediate: true,
            execute_time: now.timestamp(),
            cron_expr: None,
            retry_policy: RetryPolicy::default(),
            restart_attempts: 0,
            state: TaskState::Pending,
            carrier: Default::default(),
            project_id: "proj".into(),
            user_id: "user".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = SqliteStore::open(Path::new(":memory:")).unwrap();
        let task = sample_task();
        store.create(&task).await.unwrap();
        let fetched = store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.task_id, task.task_id);
        assert_eq!(fetched.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn duplicate_create_reports_already_exists() {
        let store = SqliteStore::open(Path::new(":memory:")).unwrap();
        let task = sample_task();
        store.create(&task).await.unwrap();
        let err = store.create(&task).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn patch_state_rejects_writes_to_terminal_rows() {
        let store = SqliteStore::open(Path::new(":memory:")).unwrap();
        let task = sample_task();
        store.create(&task).await.unwrap();
        store.patch_state(task.task_id, TaskState::Completed).await.unwrap();
        let err = store.patch_state(task.task_id, TaskState::Error).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let store = SqliteStore::open(Path::new(":memory:")).unwrap();
        let mut a = sample_task();
        let b = sample_task();
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        store.force_patch_state(a.task_id, TaskState::Completed).await.unwrap();
        a.state = TaskState::Completed;

        let filter = TaskFilter {
            state: Some(TaskState::Completed),
            ..Default::default()
        };
        let rows = store.list(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_id, a.task_id);
    }

    #[tokio::test]
    async fn container_upsert_is_idempotent_by_name_and_tag() {
        let store = SqliteStore::open(Path::new(":memory:")).unwrap();
        let container = ContainerRecord {
            id: Uuid::new_v4(),
            image_name: "detector".into(),
            tag: "latest".into(),
            image_digest: "sha256:abc".into(),
            build_args: Default::default(),
            created_at: Utc::now(),
        };
        store.upsert_container(&container).await.unwrap();
        store.upsert_container(&container).await.unwrap();
        let fetched = store
            .get_container_by_name_tag("detector", "latest")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.image_digest, "sha256:abc");
    }

    #[tokio::test]
    async fn engine_config_digests_for_group_joins_through_task_ownership() {
        let store = SqliteStore::open(Path::new(":memory:")).unwrap();
        let task = sample_task();
        store.create(&task).await.unwrap();

        let record = FaultInjectionRecord {
            id: Uuid::new_v4(),
            task_id: task.task_id,
            fault_type: 1,
            display_config: serde_json::json!({}),
            engine_config: serde_json::json!({"fault_type": 1}),
            pre_duration: 10,
            start_time: None,
            end_time: None,
            benchmark: "bench".into(),
            injection_name: "bench-ts0-abcdef12".into(),
            state: rca_common::FaultInjectionState::Initial,
            labels: Default::default(),
        };
        FaultInjectionStore::create(&store, &record).await.unwrap();

        let digests = store
            .engine_config_digests_for_group(task.group_id)
            .await
            .unwrap();
        assert_eq!(
            digests,
            vec![FaultInjectionRecord::engine_config_digest(&record.engine_config)]
        );
    }
}
