//! The `BrokerOps` seam (C2): every primitive the core needs from a
//! Redis-class store — blocking-pop lists, scored sets, hashes, sets,
//! monotonic-id streams, and the atomicity of the operations the spec calls
//! "scripts". Any store offering these primitives is acceptable; the
//! runtime crate backs this trait with `redis`, tests back it with the
//! in-memory implementation in [`crate::memory`].

use std::time::Duration;

use async_trait::async_trait;
use rca_common::errors::BrokerError;
use uuid::Uuid;

/// Which queue a task currently sits in, mirroring the `task:index` hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Ready,
    Delayed,
    Dead,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Delayed => "delayed",
            Self::Dead => "dead",
        }
    }
}

/// Outcome of a namespace `CheckAndLock` attempt (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsLockOutcome {
    /// No prior record, or the prior record had expired: lock acquired.
    Locked,
    /// The caller already held this namespace; the window was extended.
    Extended,
    /// Another trace holds a live lock.
    Busy,
    /// The namespace has been administratively disabled.
    Disabled,
}

impl NsLockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Locked | Self::Extended)
    }
}

/// One entry read back off a stream, alongside its server-assigned id.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait BrokerOps: Send + Sync {
    // -- concurrency counter (§4.6, `task:concurrency_lock`) --
    /// Atomically increments the shared counter iff it is below `max`;
    /// returns whether the permit was granted.
    async fn concurrency_try_acquire(&self, max: u32) -> Result<bool, BrokerError>;
    async fn concurrency_release(&self) -> Result<(), BrokerError>;

    // -- ready / delayed / dead queues + index (§4.5, §6) --
    async fn ready_push(&self, task_id: Uuid, bytes: Vec<u8>) -> Result<(), BrokerError>;
    async fn ready_pop_blocking(
        &self,
        timeout: Duration,
    ) -> Result<Option<(Uuid, Vec<u8>)>, BrokerError>;
    /// Removes a task from `ready` by id if still present (used by Cancel).
    async fn ready_remove(&self, task_id: Uuid) -> Result<bool, BrokerError>;

    async fn delayed_add(
        &self,
        task_id: Uuid,
        score: i64,
        bytes: Vec<u8>,
    ) -> Result<(), BrokerError>;
    async fn delayed_remove(&self, task_id: Uuid) -> Result<bool, BrokerError>;
    /// Atomically moves every `delayed` entry with score <= `now` into
    /// `ready`, updating the index for each. Returns the moved task ids and
    /// bytes so the caller can recompute cron next-fire times.
    async fn delayed_move_due(&self, now: i64) -> Result<Vec<(Uuid, Vec<u8>)>, BrokerError>;

    async fn dead_add(&self, task_id: Uuid, score: i64, bytes: Vec<u8>) -> Result<(), BrokerError>;
    async fn dead_remove(&self, task_id: Uuid) -> Result<bool, BrokerError>;

    async fn index_set(&self, task_id: Uuid, queue: QueueName) -> Result<(), BrokerError>;
    async fn index_get(&self, task_id: Uuid) -> Result<Option<QueueName>, BrokerError>;
    async fn index_remove(&self, task_id: Uuid) -> Result<(), BrokerError>;

    // -- status mirror (`task:{id}:status`) --
    async fn status_set(&self, task_id: Uuid, state: &str, message: &str)
    -> Result<(), BrokerError>;
    async fn status_get(&self, task_id: Uuid) -> Result<Option<(String, String)>, BrokerError>;

    // -- namespace lock manager state (§4.3, `ns:{name}`, `namespaces`) --
    async fn ns_check_and_lock(
        &self,
        namespace: &str,
        wanted_end_time: i64,
        trace_id: Uuid,
        now: i64,
    ) -> Result<NsLockOutcome, BrokerError>;
    async fn ns_release(&self, namespace: &str, trace_id: Uuid) -> Result<(), BrokerError>;
    async fn ns_set_status(&self, namespace: &str, enabled: bool) -> Result<(), BrokerError>;
    async fn ns_register(&self, namespace: &str) -> Result<(), BrokerError>;
    /// Namespaces registered under `prefix`, in a deterministic order.
    async fn ns_known_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError>;

    // -- rate limiter token set (§4.4, `restart_service_tokens`) --
    async fn token_acquire(
        &self,
        holder: &str,
        max: u32,
        ttl: Duration,
    ) -> Result<bool, BrokerError>;
    async fn token_release(&self, holder: &str) -> Result<(), BrokerError>;
    async fn token_count(&self) -> Result<u32, BrokerError>;

    // -- event stream (§4.10, `stream:log:{trace_id}`) --
    async fn stream_append(&self, trace_id: Uuid, bytes: Vec<u8>) -> Result<String, BrokerError>;
    async fn stream_range(
        &self,
        trace_id: Uuid,
        after_id: Option<&str>,
    ) -> Result<Vec<StreamEntry>, BrokerError>;
    async fn stream_trim_before(&self, trace_id: Uuid, min_id: &str) -> Result<(), BrokerError>;
}
