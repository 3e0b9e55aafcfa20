//! Worker pool (C6): bounded concurrent consumption of `ready`, retry with
//! backoff, per-task cancellation, panic recovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use rca_common::errors::DispatchError;
use rca_common::{Task, TaskState};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::broker::BrokerOps;
use crate::config::PipelineConfig;
use crate::dispatcher::{Dispatcher, HandlerOutcome};
use crate::handlers::HandlerContext;

/// How long a single `BRPOP`-equivalent wait blocks before the loop checks
/// shutdown again (§5: "the worker loop's BRPOP suspends with a bounded
/// timeout").
const READY_POP_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff between failed attempts at the global counter (§4.6: "if
/// over-limit, sleep briefly and retry").
const COUNTER_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Releases one concurrency permit on drop so a panic or early return in
/// the execution path can never leak a slot (SPEC_FULL §4.6).
struct ConcurrencyPermit {
    broker: Arc<dyn BrokerOps>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        let broker = self.broker.clone();
        tokio::spawn(async move {
            if let Err(err) = broker.concurrency_release().await {
                warn!(%err, "failed to release concurrency permit");
            }
        });
    }
}

/// Per-task cancellation handles (§4.6, §5). Lost on restart by design —
/// global state that must survive lives in C2, not here.
#[derive(Default)]
struct CancellationRegistry {
    handles: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancellationRegistry {
    fn register(&self, task_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.handles.lock().unwrap().insert(task_id, token.clone());
        token
    }

    fn unregister(&self, task_id: Uuid) {
        self.handles.lock().unwrap().remove(&task_id);
    }

    /// Used by a Cancel(task_id) caller to signal a currently running task;
    /// a no-op if the task isn't running here (best-effort across restarts).
    pub fn cancel(&self, task_id: Uuid) -> bool {
        if let Some(token) = self.handles.lock().unwrap().get(&task_id) {
            token.cancel();
            true
        } else {
            false
        }
    }
}

pub struct WorkerPool {
    broker: Arc<dyn BrokerOps>,
    dispatcher: Arc<Dispatcher>,
    ctx: Arc<HandlerContext>,
    pool_size: usize,
    max_concurrency: u32,
    cancellations: Arc<CancellationRegistry>,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn BrokerOps>,
        dispatcher: Arc<Dispatcher>,
        ctx: Arc<HandlerContext>,
        config: &PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            dispatcher,
            ctx,
            pool_size: config.worker_pool_size,
            max_concurrency: config.worker_pool_size as u32,
            cancellations: Arc::new(CancellationRegistry::default()),
        })
    }

    /// Signals the in-process cancellation handle for a running task, if
    /// this process happens to be running it (§4.5's Cancel also calls this).
    pub fn cancel_running(&self, task_id: Uuid) -> bool {
        self.cancellations.cancel(task_id)
    }

    /// Runs `pool_size` worker loops until `shutdown` fires, then waits for
    /// in-flight executions to drain.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut handles = Vec::with_capacity(self.pool_size);
        for worker_index in 0..self.pool_size {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_index, shutdown).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[instrument(skip(self, shutdown), fields(worker_index))]
    async fn worker_loop(self: Arc<Self>, worker_index: usize, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let permit = tokio::select! {
                permit = self.acquire_permit() => permit,
                _ = shutdown.cancelled() => return,
            };

            match self.broker.ready_pop_blocking(READY_POP_TIMEOUT).await {
                Ok(Some((task_id, bytes))) => {
                    let pool = self.clone();
                    tokio::spawn(async move {
                        pool.execute(task_id, bytes, permit).await;
                    });
                }
                Ok(None) => drop(permit),
                Err(err) => {
                    warn!(%err, "ready_pop_blocking failed");
                    drop(permit);
                    tokio::time::sleep(COUNTER_RETRY_BACKOFF).await;
                }
            }
        }
    }

    async fn acquire_permit(&self) -> ConcurrencyPermit {
        loop {
            match self.broker.concurrency_try_acquire(self.max_concurrency).await {
                Ok(true) => {
                    return ConcurrencyPermit {
                        broker: self.broker.clone(),
                    };
                }
                Ok(false) => tokio::time::sleep(COUNTER_RETRY_BACKOFF).await,
                Err(err) => {
                    warn!(%err, "concurrency counter unavailable");
                    tokio::time::sleep(COUNTER_RETRY_BACKOFF).await;
                }
            }
        }
    }

    /// One popped task's full lifecycle: register cancellation, dispatch
    /// with retry-with-backoff, then dead-letter or report completion.
    /// `_permit` is held for the duration so the global counter reflects
    /// this execution until it exits by any path (success, panic via the
    /// `Drop` release, or cancellation).
    #[instrument(skip(self, bytes, _permit), fields(task_id = %task_id))]
    async fn execute(self: Arc<Self>, task_id: Uuid, bytes: Vec<u8>, _permit: ConcurrencyPermit) {
        let mut task: Task = match serde_json::from_slice(&bytes) {
            Ok(task) => task,
            Err(err) => {
                warn!(%task_id, %err, "malformed ready-queue payload, dead-lettering");
                let now = chrono::Utc::now().timestamp();
                let _ = self.broker.dead_add(task_id, now, bytes).await;
                return;
            }
        };

        let cancellation = self.cancellations.register(task_id);
        let _ = self
            .ctx
            .task_store
            .patch_state(task_id, TaskState::Running)
            .await;
        let _ = self.broker.status_set(task_id, TaskState::Running.as_str(), "").await;

        let outcome = self.dispatch_with_retry(&task, cancellation.clone()).await;

        match outcome {
            ExecutionOutcome::Completed => {
                let _ = self.ctx.task_store.patch_state(task_id, TaskState::Completed).await;
                let _ = self
                    .broker
                    .status_set(task_id, TaskState::Completed.as_str(), "")
                    .await;
                info!(%task_id, "task completed");
            }
            ExecutionOutcome::Detached => {
                // The handler already left the task row in `Running` and
                // created the cluster resource that will eventually drive
                // it to its terminal state via the ingress callback (§4.9).
                // Overwriting it here would make that later `patch_state`
                // call hit the terminal guard.
                info!(%task_id, "task detached, awaiting cluster callback");
            }
            ExecutionOutcome::Rescheduled => {
                // The handler itself re-enqueued the task (namespace busy or
                // no token available); nothing further to do here.
                info!(%task_id, "task rescheduled by handler");
            }
            ExecutionOutcome::Canceled => {
                let _ = self.ctx.task_store.patch_state(task_id, TaskState::Canceled).await;
                let _ = self
                    .broker
                    .status_set(task_id, TaskState::Canceled.as_str(), "canceled")
                    .await;
                info!(%task_id, "task canceled");
            }
            ExecutionOutcome::Failed(reason) => {
                let _ = self.ctx.task_store.patch_state(task_id, TaskState::Error).await;
                // Publish the status update before dead-lettering so a
                // subscriber reading the status mirror never observes a
                // dead-lettered task that still reports its prior state.
                let _ = self.broker.status_set(task_id, TaskState::Error.as_str(), &reason).await;
                task.state = TaskState::Error;
                let now = chrono::Utc::now().timestamp();
                let backoff = crate::handlers::reschedule_backoff_seconds(
                    task.restart_attempts,
                    Duration::from_secs(300),
                );
                let bytes = serde_json::to_vec(&task).unwrap_or_default();
                let _ = self.broker.dead_add(task_id, now + backoff, bytes).await;
                warn!(%task_id, reason, "task dead-lettered after exhausting retries");
            }
        }

        self.cancellations.unregister(task_id);
    }

    /// Retries `dispatch` per `task.retry_policy` until success, a
    /// non-retryable outcome, or exhaustion. Cancellation short-circuits
    /// immediately regardless of remaining attempts.
    async fn dispatch_with_retry(&self, task: &Task, cancellation: CancellationToken) -> ExecutionOutcome {
        let max_attempts = task.retry_policy.max_attempts.max(1);
        let backoff = Duration::from_secs(task.retry_policy.backoff_seconds);

        for attempt in 0..max_attempts {
            if cancellation.is_cancelled() {
                return ExecutionOutcome::Canceled;
            }

            let result = std::panic::AssertUnwindSafe(
                self.dispatcher.dispatch(&self.ctx, task, cancellation.clone()),
            )
            .catch_unwind()
            .await;

            match result {
                Ok(Ok(HandlerOutcome::Completed)) => return ExecutionOutcome::Completed,
                Ok(Ok(HandlerOutcome::Detached)) => return ExecutionOutcome::Detached,
                Ok(Ok(HandlerOutcome::Rescheduled)) => return ExecutionOutcome::Rescheduled,
                Ok(Err(DispatchError::Handler(handler_err))) if is_cancellation(&handler_err) => {
                    return ExecutionOutcome::Canceled;
                }
                Ok(Err(err)) => {
                    warn!(task_id = %task.task_id, attempt, %err, "dispatch attempt failed");
                    if attempt + 1 >= max_attempts {
                        return ExecutionOutcome::Failed(err.to_string());
                    }
                }
                Err(panic) => {
                    let message = panic_message(&panic);
                    warn!(task_id = %task.task_id, attempt, message, "handler panicked, recovered");
                    if attempt + 1 >= max_attempts {
                        return ExecutionOutcome::Failed(format!("panic: {message}"));
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancellation.cancelled() => return ExecutionOutcome::Canceled,
            }
        }

        ExecutionOutcome::Failed("retries exhausted".into())
    }
}

fn is_cancellation(err: &rca_common::errors::HandlerError) -> bool {
    matches!(err, rca_common::errors::HandlerError::Canceled)
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

enum ExecutionOutcome {
    Completed,
    Detached,
    Rescheduled,
    Canceled,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fakes::{RecordingBuilderClient, RecordingClusterGateway};
    use crate::config::PipelineConfig;
    use crate::dispatcher::{Dispatcher, TaskHandler};
    use crate::events::StreamEventSink;
    use crate::memory::InMemoryBroker;
    use crate::namespace_lock::NamespaceLockManager;
    use crate::queues::TaskQueues;
    use crate::rate_limiter::RateLimiter;
    use crate::store::memory::{InMemoryFaultInjectionStore, InMemoryResultStore, InMemoryTaskStore};
    use crate::store::TaskStore;
    use async_trait::async_trait;
    use rca_common::errors::HandlerError;
    use rca_common::{CollectResultPayload, RetryPolicy, TaskPayload, TaskType};

    struct AlwaysCompletes;

    #[async_trait]
    impl TaskHandler for AlwaysCompletes {
        async fn handle(
            &self,
            _ctx: &HandlerContext,
            _task: &Task,
            _cancellation: CancellationToken,
        ) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::Completed)
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl TaskHandler for AlwaysFails {
        async fn handle(
            &self,
            _ctx: &HandlerContext,
            _task: &Task,
            _cancellation: CancellationToken,
        ) -> Result<HandlerOutcome, HandlerError> {
            Err(HandlerError::PayloadInvalid("always fails".into()))
        }
    }

    struct AlwaysDetaches;

    #[async_trait]
    impl TaskHandler for AlwaysDetaches {
        async fn handle(
            &self,
            ctx: &HandlerContext,
            task: &Task,
            _cancellation: CancellationToken,
        ) -> Result<HandlerOutcome, HandlerError> {
            // Mirrors the cluster-backed handlers (FaultInjection,
            // BuildDatapack, RunAlgorithm): leave the row Running and wait
            // for a later ingress callback to drive the terminal state.
            ctx.task_store
                .patch_state(task.task_id, TaskState::Running)
                .await
                .map_err(HandlerError::Store)?;
            Ok(HandlerOutcome::Detached)
        }
    }

    /// Fails on its first invocation (as if the cluster rejected the
    /// resource create), succeeds on the second. Used to verify a retry
    /// after a handler-side failure doesn't trip the store's terminal
    /// guard (the bug this module's fix addresses).
    struct FailsOnceThenDetaches {
        attempts: std::sync::atomic::AtomicU32,
    }

    impl Default for FailsOnceThenDetaches {
        fn default() -> Self {
            Self {
                attempts: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl TaskHandler for FailsOnceThenDetaches {
        async fn handle(
            &self,
            ctx: &HandlerContext,
            task: &Task,
            _cancellation: CancellationToken,
        ) -> Result<HandlerOutcome, HandlerError> {
            if self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                return Err(HandlerError::ClusterRejected("transient".into()));
            }
            ctx.task_store
                .patch_state(task.task_id, TaskState::Running)
                .await
                .map_err(HandlerError::Store)?;
            Ok(HandlerOutcome::Detached)
        }
    }

    fn sample_task() -> Task {
        let now = chrono::Utc::now();
        Task {
            task_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            payload: TaskPayload::CollectResult(CollectResultPayload {
                execution_id: Uuid::new_v4(),
                result_csv_path: "r.csv".into(),
                conclusion_csv_path: "c.csv".into(),
            }),
            immediate: true,
            execute_time: now.timestamp(),
            cron_expr: None,
            retry_policy: RetryPolicy {
                max_attempts: 2,
                backoff_seconds: 0,
            },
            restart_attempts: 0,
            state: TaskState::Pending,
            carrier: Default::default(),
            project_id: "p".into(),
            user_id: "u".into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn pool_with_handler(
        handler: Arc<dyn TaskHandler>,
    ) -> (Arc<WorkerPool>, Arc<InMemoryBroker>, Arc<dyn TaskStore>) {
        let broker = Arc::new(InMemoryBroker::default());
        let broker_dyn: Arc<dyn BrokerOps> = broker.clone();
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::default());

        let mut dispatcher = Dispatcher::new();
        dispatcher.register(TaskType::CollectResult, handler);

        let config = PipelineConfig::default();
        let ctx = Arc::new(HandlerContext {
            namespace_lock: Arc::new(NamespaceLockManager::new(broker_dyn.clone())),
            rate_limiter: Arc::new(RateLimiter::new(broker_dyn.clone(), 5)),
            task_store: task_store.clone(),
            fault_injection_store: Arc::new(InMemoryFaultInjectionStore::default()),
            result_store: Arc::new(InMemoryResultStore::default()),
            queues: Arc::new(TaskQueues::new(broker_dyn.clone(), task_store.clone())),
            cluster: Arc::new(RecordingClusterGateway::default()),
            builder: Arc::new(RecordingBuilderClient::default()),
            events: Arc::new(StreamEventSink::new(broker_dyn.clone())),
            config: Arc::new(config.clone()),
        });

        let pool = WorkerPool::new(broker_dyn, Arc::new(dispatcher), ctx, &config);
        (pool, broker, task_store)
    }

    #[tokio::test]
    async fn successful_task_is_marked_completed() {
        let (pool, broker, task_store) = pool_with_handler(Arc::new(AlwaysCompletes));
        let task = sample_task();
        task_store.create(&task).await.unwrap();
        let bytes = serde_json::to_vec(&task).unwrap();
        broker.ready_push(task.task_id, bytes).await.unwrap();

        let permit = pool.acquire_permit().await;
        let (popped_id, popped_bytes) = broker
            .ready_pop_blocking(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped_id, task.task_id);
        pool.clone().execute(popped_id, popped_bytes, permit).await;

        let stored = task_store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letters_the_task() {
        let (pool, broker, task_store) = pool_with_handler(Arc::new(AlwaysFails));
        let task = sample_task();
        task_store.create(&task).await.unwrap();
        let bytes = serde_json::to_vec(&task).unwrap();
        broker.ready_push(task.task_id, bytes).await.unwrap();

        let permit = pool.acquire_permit().await;
        let (popped_id, popped_bytes) = broker
            .ready_pop_blocking(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        pool.clone().execute(popped_id, popped_bytes, permit).await;

        let stored = task_store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Error);
        assert_eq!(
            broker.index_get(task.task_id).await.unwrap(),
            Some(crate::broker::QueueName::Dead)
        );
    }

    #[tokio::test]
    async fn detached_task_stays_running_not_overwritten_to_completed() {
        let (pool, broker, task_store) = pool_with_handler(Arc::new(AlwaysDetaches));
        let task = sample_task();
        task_store.create(&task).await.unwrap();
        let bytes = serde_json::to_vec(&task).unwrap();
        broker.ready_push(task.task_id, bytes).await.unwrap();

        let permit = pool.acquire_permit().await;
        let (popped_id, popped_bytes) = broker
            .ready_pop_blocking(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        pool.clone().execute(popped_id, popped_bytes, permit).await;

        // The worker must not patch this to Completed: a detached task's
        // terminal transition belongs to a later cluster-event callback,
        // which still needs the row to be non-terminal when it arrives.
        let stored = task_store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Running);

        // The callback's own patch_state call must still succeed.
        task_store
            .patch_state(task.task_id, TaskState::Completed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retry_after_handler_failure_does_not_hit_terminal_guard() {
        let (pool, broker, task_store) =
            pool_with_handler(Arc::new(FailsOnceThenDetaches::default()));
        let mut task = sample_task();
        task.retry_policy = RetryPolicy {
            max_attempts: 2,
            backoff_seconds: 0,
        };
        task_store.create(&task).await.unwrap();
        let bytes = serde_json::to_vec(&task).unwrap();
        broker.ready_push(task.task_id, bytes).await.unwrap();

        let permit = pool.acquire_permit().await;
        let (popped_id, popped_bytes) = broker
            .ready_pop_blocking(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        pool.clone().execute(popped_id, popped_bytes, permit).await;

        // The first attempt's failure must not have marked the row
        // terminal — otherwise the retry's own patch_state(Running) would
        // fail and the whole task would be wrongly dead-lettered despite
        // the second attempt actually succeeding.
        let stored = task_store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Running);
    }

    #[tokio::test]
    async fn cancellation_registry_signals_running_task() {
        let registry = CancellationRegistry::default();
        let task_id = Uuid::new_v4();
        let token = registry.register(task_id);
        assert!(!token.is_cancelled());
        assert!(registry.cancel(task_id));
        assert!(token.is_cancelled());
        assert!(!registry.cancel(Uuid::new_v4()));
    }
}
