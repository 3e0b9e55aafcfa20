//! Event stream fan-out (C10): appends structured domain events keyed by
//! trace, supports historical-then-tail replay for subscribers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rca_common::errors::BrokerError;
pub use rca_common::events::{DomainEvent, EventName};
use tracing::instrument;
use uuid::Uuid;

use crate::broker::BrokerOps;

/// Default retention window for `stream:log:{trace_id}` entries (§4.10).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, trace_id: Uuid, event: DomainEvent) -> Result<String, BrokerError>;
    async fn replay_then_tail(
        &self,
        trace_id: Uuid,
        after_id: Option<&str>,
    ) -> Result<Vec<(String, DomainEvent)>, BrokerError>;
}

pub struct StreamEventSink {
    broker: Arc<dyn BrokerOps>,
    retention: Duration,
}

impl StreamEventSink {
    pub fn new(broker: Arc<dyn BrokerOps>) -> Self {
        Self {
            broker,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Trims entries older than the retention window, keyed by the
    /// stream's own monotonic id scheme rather than wall-clock time stored
    /// in the entry, since the in-memory and Redis backings both expose
    /// trim-before-id rather than trim-before-timestamp.
    pub async fn trim_retention(&self, trace_id: Uuid, now: DateTime<Utc>) -> Result<(), BrokerError> {
        let cutoff_ms = (now - chrono::Duration::from_std(self.retention).unwrap_or_default())
            .timestamp_millis()
            .max(0) as u64;
        let min_id = format!("{cutoff_ms:020}-0");
        self.broker.stream_trim_before(trace_id, &min_id).await
    }
}

#[async_trait]
impl EventSink for StreamEventSink {
    #[instrument(skip(self, event), fields(trace_id = %trace_id, event_name = %event.event_name))]
    async fn publish(&self, trace_id: Uuid, event: DomainEvent) -> Result<String, BrokerError> {
        let bytes = serde_json::to_vec(&event)
            .map_err(|e| BrokerError::Backend(format!("event encode failure: {e}")))?;
        self.broker.stream_append(trace_id, bytes).await
    }

    #[instrument(skip(self), fields(trace_id = %trace_id))]
    async fn replay_then_tail(
        &self,
        trace_id: Uuid,
        after_id: Option<&str>,
    ) -> Result<Vec<(String, DomainEvent)>, BrokerError> {
        let entries = self.broker.stream_range(trace_id, after_id).await?;
        entries
            .into_iter()
            .map(|entry| {
                let event: DomainEvent = serde_json::from_slice(&entry.bytes)
                    .map_err(|e| BrokerError::Backend(format!("event decode failure: {e}")))?;
                Ok((entry.id, event))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;

    fn sample_event(task_id: Uuid, name: EventName) -> DomainEvent {
        DomainEvent::new(task_id, "fault_injection", name, serde_json::json!({}))
    }

    #[tokio::test]
    async fn replay_then_tail_respects_after_id_and_ordering() {
        let sink = StreamEventSink::new(Arc::new(InMemoryBroker::default()));
        let trace_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();

        let id1 = sink
            .publish(trace_id, sample_event(task_id, EventName::FaultInjectionStarted))
            .await
            .unwrap();
        let _id2 = sink
            .publish(
                trace_id,
                sample_event(task_id, EventName::FaultInjectionCompleted),
            )
            .await
            .unwrap();

        let all = sink.replay_then_tail(trace_id, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1.event_name, EventName::FaultInjectionStarted);
        assert_eq!(all[1].1.event_name, EventName::FaultInjectionCompleted);

        let after_first = sink.replay_then_tail(trace_id, Some(&id1)).await.unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].1.event_name, EventName::FaultInjectionCompleted);
    }

    #[tokio::test]
    async fn pipeline_ordering_invariant_dataset_build_after_fault_injection() {
        let sink = StreamEventSink::new(Arc::new(InMemoryBroker::default()));
        let trace_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();

        sink.publish(
            trace_id,
            sample_event(task_id, EventName::FaultInjectionCompleted),
        )
        .await
        .unwrap();
        sink.publish(trace_id, sample_event(task_id, EventName::DatasetBuildSucceed))
            .await
            .unwrap();

        let all = sink.replay_then_tail(trace_id, None).await.unwrap();
        let fault_idx = all
            .iter()
            .position(|(_, e)| e.event_name == EventName::FaultInjectionCompleted)
            .unwrap();
        let build_idx = all
            .iter()
            .position(|(_, e)| e.event_name == EventName::DatasetBuildSucceed)
            .unwrap();
        assert!(build_idx > fault_idx);
    }
}
