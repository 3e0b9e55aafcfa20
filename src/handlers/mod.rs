//! Pipeline executor (C8): one handler per task kind, each implementing
//! [`crate::dispatcher::TaskHandler`].

pub mod build_container;
pub mod build_datapack;
pub mod collect_result;
pub mod fault_injection;
pub mod restart_pedestal;
pub mod run_algorithm;

use std::sync::Arc;

use rand::Rng;
use tracing::instrument;
use uuid::Uuid;

use crate::cluster::{BuilderClient, ClusterGateway};
use crate::config::PipelineConfig;
use crate::events::EventSink;
use crate::namespace_lock::NamespaceLockManager;
use crate::queues::TaskQueues;
use crate::rate_limiter::RateLimiter;
use crate::store::{FaultInjectionStore, ResultStore, TaskStore};

/// Shared dependencies every handler needs: the resource managers, the
/// stores, the outbound queue (to submit the next pipeline stage), the
/// external collaborators (cluster, builder), the event sink, and
/// configuration.
pub struct HandlerContext {
    pub namespace_lock: Arc<NamespaceLockManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub task_store: Arc<dyn TaskStore>,
    pub fault_injection_store: Arc<dyn FaultInjectionStore>,
    pub result_store: Arc<dyn ResultStore>,
    pub queues: Arc<TaskQueues>,
    pub cluster: Arc<dyn ClusterGateway>,
    pub builder: Arc<dyn BuilderClient>,
    pub events: Arc<dyn EventSink>,
    pub config: Arc<PipelineConfig>,
}

/// Randomized exponential backoff for resource-contention reschedules
/// (§9): factor in `[0.3, 1.0]`, capped at `config.reschedule_backoff_cap`.
#[instrument(skip_all, fields(attempt))]
pub fn reschedule_backoff_seconds(attempt: u32, cap: std::time::Duration) -> i64 {
    let base = 2f64.powi(attempt.min(10) as i32);
    let factor: f64 = rand::thread_rng().gen_range(0.3..=1.0);
    let seconds = (base * factor).min(cap.as_secs_f64());
    seconds.round() as i64
}

/// Builds the injection name used to correlate cluster callbacks, derived
/// deterministically from inputs per §4.8.2.
pub fn derive_injection_name(benchmark: &str, namespace: &str, task_id: Uuid) -> String {
    format!("{benchmark}-{namespace}-{}", &task_id.simple().to_string()[..8])
}

#[cfg(test)]
impl HandlerContext {
    pub fn for_test() -> Self {
        use crate::cluster::fakes::{RecordingBuilderClient, RecordingClusterGateway};
        use crate::events::StreamEventSink;
        use crate::memory::InMemoryBroker;
        use crate::store::memory::{InMemoryFaultInjectionStore, InMemoryResultStore, InMemoryTaskStore};

        let broker: Arc<dyn crate::broker::BrokerOps> = Arc::new(InMemoryBroker::default());
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::default());
        Self {
            namespace_lock: Arc::new(NamespaceLockManager::new(broker.clone())),
            rate_limiter: Arc::new(RateLimiter::new(broker.clone(), 5)),
            task_store: task_store.clone(),
            fault_injection_store: Arc::new(InMemoryFaultInjectionStore::default()),
            result_store: Arc::new(InMemoryResultStore::default()),
            queues: Arc::new(TaskQueues::new(broker.clone(), task_store)),
            cluster: Arc::new(RecordingClusterGateway::default()),
            builder: Arc::new(RecordingBuilderClient::default()),
            events: Arc::new(StreamEventSink::new(broker)),
            config: Arc::new(PipelineConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reschedule_backoff_is_bounded_by_cap() {
        let cap = std::time::Duration::from_secs(300);
        for attempt in 0..20 {
            let backoff = reschedule_backoff_seconds(attempt, cap);
            assert!(backoff <= 300);
            assert!(backoff >= 0);
        }
    }

    #[test]
    fn injection_name_is_deterministic_for_same_task_id() {
        let task_id = Uuid::new_v4();
        let a = derive_injection_name("ts-cb", "ts0", task_id);
        let b = derive_injection_name("ts-cb", "ts0", task_id);
        assert_eq!(a, b);
    }
}
