//! Task store & queues (C5): submit/cancel, ready+delayed queues, cron
//! rescheduling, dead-letter, per-task index.

use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use rca_common::errors::{BrokerError, StoreError};
use rca_common::{Task, TaskState};
use std::str::FromStr;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::broker::{BrokerOps, QueueName};
use crate::store::{FaultInjectionStore, TaskStore};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("serialization failure: {0}")]
    Serde(String),
}

pub struct TaskQueues {
    broker: Arc<dyn BrokerOps>,
    store: Arc<dyn TaskStore>,
}

/// Result of [`TaskQueues::submit_fault_injection_batch`]: the ids that were
/// actually enqueued and how many were dropped as `engine_config` duplicates.
#[derive(Debug, Clone, Default)]
pub struct BatchSubmitOutcome {
    pub submitted: Vec<Uuid>,
    pub duplicated_count: usize,
}

fn engine_config_of(task: &Task) -> Option<&serde_json::Value> {
    match &task.payload {
        rca_common::TaskPayload::FaultInjection(payload) => Some(&payload.engine_config),
        rca_common::TaskPayload::RestartPedestal(payload) => {
            Some(&payload.inject_payload.engine_config)
        }
        _ => None,
    }
}

fn encode(task: &Task) -> Result<Vec<u8>, QueueError> {
    serde_json::to_vec(task).map_err(|e| QueueError::Serde(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Task, QueueError> {
    serde_json::from_slice(bytes).map_err(|e| QueueError::Serde(e.to_string()))
}

impl TaskQueues {
    pub fn new(broker: Arc<dyn BrokerOps>, store: Arc<dyn TaskStore>) -> Self {
        Self { broker, store }
    }

    /// Submit (§4.5): persist the row first, enqueue second, so a crash
    /// between the two steps leaves an orphan `Pending` row (cleaned up by
    /// a reaper) but never a queued-but-unknown task.
    #[instrument(skip(self, task), fields(task_id = %task.task_id, trace_id = %task.trace_id))]
    pub async fn submit(&self, mut task: Task) -> Result<Uuid, QueueError> {
        task.state = TaskState::Pending;
        self.store.create(&task).await?;

        let task_id = task.task_id;
        let bytes = encode(&task)?;
        if task.immediate {
            self.broker.ready_push(task_id, bytes).await?;
        } else {
            let score = if let Some(cron_expr) = task.cron_expr.as_deref() {
                next_cron_fire(cron_expr, task.execute_time).unwrap_or(task.execute_time)
            } else {
                task.execute_time
            };
            self.broker.delayed_add(task_id, score, bytes).await?;
        }
        Ok(task_id)
    }

    /// Submits a batch of tasks carrying `FaultInjection` payloads (directly,
    /// or nested inside a `RestartPedestal.inject_payload`), enforcing the
    /// `engine_config` uniqueness invariant (§3, testable property 5, S6):
    /// duplicates within the batch and duplicates against already-persisted
    /// records for the task's pipeline group are dropped before enqueue.
    #[instrument(skip(self, tasks, fault_injection_store))]
    pub async fn submit_fault_injection_batch(
        &self,
        tasks: Vec<Task>,
        fault_injection_store: &dyn FaultInjectionStore,
    ) -> Result<BatchSubmitOutcome, QueueError> {
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut submitted = Vec::new();
        let mut duplicated_count = 0usize;

        for task in tasks {
            let Some(engine_config) = engine_config_of(&task) else {
                submitted.push(self.submit(task).await?);
                continue;
            };
            let digest = rca_common::FaultInjectionRecord::engine_config_digest(engine_config);

            let existing = fault_injection_store
                .engine_config_digests_for_group(task.group_id)
                .await?;
            if seen.contains(&digest) || existing.contains(&digest) {
                duplicated_count += 1;
                continue;
            }
            seen.insert(digest);
            submitted.push(self.submit(task).await?);
        }

        Ok(BatchSubmitOutcome {
            submitted,
            duplicated_count,
        })
    }

    /// Scheduler tick (§4.5): atomically moves due `delayed` entries into
    /// `ready`. Cron tasks get their next occurrence recomputed and
    /// re-scheduled at tick time, not at dispatch, per the design note in
    /// §9 — a crashed process never loses a future cron occurrence because
    /// the still-scheduled entry survives in `delayed`.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<usize, QueueError> {
        let now = Utc::now().timestamp();
        let due = self.broker.delayed_move_due(now).await?;
        let moved = due.len();
        for (task_id, bytes) in due {
            let task = match decode(&bytes) {
                Ok(task) => task,
                Err(err) => {
                    warn!(%task_id, %err, "malformed delayed task payload, dead-lettering");
                    self.broker.dead_add(task_id, now, bytes).await?;
                    continue;
                }
            };
            if let Some(cron_expr) = task.cron_expr.as_deref() {
                match next_cron_fire(cron_expr, now) {
                    Some(next) => {
                        let mut rescheduled = task.clone();
                        rescheduled.execute_time = next;
                        let rebytes = encode(&rescheduled)?;
                        self.broker.delayed_add(task_id, next, rebytes).await?;
                    }
                    None => {
                        warn!(%task_id, cron_expr, "unparseable cron expression, dead-lettering");
                        self.broker.dead_add(task_id, now, bytes).await?;
                    }
                }
            }
        }
        Ok(moved)
    }

    /// Reschedules the very same task (as opposed to submitting a fresh
    /// one) after resource contention (§4.8.1, §9): bumps
    /// `restart_attempts`, marks the row `Rescheduled`, and re-enqueues it
    /// into `delayed` at `now + delay_seconds`.
    #[instrument(skip(self, task), fields(task_id = %task.task_id))]
    pub async fn reschedule(&self, task: &mut Task, delay_seconds: i64) -> Result<(), QueueError> {
        task.restart_attempts = self.store.increment_restart_attempts(task.task_id).await?;
        self.store
            .patch_state(task.task_id, TaskState::Rescheduled)
            .await?;
        task.state = TaskState::Rescheduled;
        task.execute_time = Utc::now().timestamp() + delay_seconds;
        let bytes = encode(task)?;
        self.broker
            .delayed_add(task.task_id, task.execute_time, bytes)
            .await?;
        Ok(())
    }

    /// Cancel(task_id) (§4.5): removes the task from whichever queue its
    /// index entry names and clears the index. The in-process cancellation
    /// hook for a currently running task is invoked by the worker pool,
    /// which owns the cancellation-handle registry (§4.6).
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool, QueueError> {
        let queue = self.broker.index_get(task_id).await?;
        let removed = match queue {
            Some(QueueName::Ready) => self.broker.ready_remove(task_id).await?,
            Some(QueueName::Delayed) => self.broker.delayed_remove(task_id).await?,
            Some(QueueName::Dead) => self.broker.dead_remove(task_id).await?,
            None => false,
        };
        if removed {
            self.broker.index_remove(task_id).await?;
        }
        // Cancel on an already-completed task is a no-op, never an error.
        if let Ok(Some(existing)) = self.store.get(task_id).await
            && !existing.state.is_terminal()
        {
            let _ = self.store.patch_state(task_id, TaskState::Canceled).await;
            let _ = self
                .broker
                .status_set(task_id, TaskState::Canceled.as_str(), "canceled")
                .await;
        }
        Ok(removed)
    }
}

fn next_cron_fire(cron_expr: &str, after_epoch: i64) -> Option<i64> {
    let schedule = Schedule::from_str(cron_expr).ok()?;
    let after = chrono::DateTime::<Utc>::from_timestamp(after_epoch, 0)?;
    schedule.after(&after).next().map(|dt| dt.timestamp())
}
