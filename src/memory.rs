//! In-memory [`BrokerOps`] backing for unit and end-to-end tests. Mirrors
//! the Redis-backed keyspace shape from §6 one-for-one, using a single
//! `tokio::sync::Mutex` over the whole state so every operation is
//! trivially atomic — the property the real implementation gets from Lua
//! scripts, this one gets from holding the lock for the operation's
//! duration.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rca_common::errors::BrokerError;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::broker::{BrokerOps, NsLockOutcome, QueueName, StreamEntry};

#[derive(Debug, Clone)]
struct NsRecord {
    trace_id: Uuid,
    end_time: i64,
    enabled: bool,
}

#[derive(Default)]
struct State {
    concurrency: u32,
    ready: Vec<(Uuid, Vec<u8>)>,
    delayed: BTreeMap<i64, Vec<(Uuid, Vec<u8>)>>,
    dead: BTreeMap<i64, Vec<(Uuid, Vec<u8>)>>,
    index: HashMap<Uuid, QueueName>,
    status: HashMap<Uuid, (String, String)>,
    namespaces: HashMap<String, NsRecord>,
    known_namespaces: HashSet<String>,
    tokens: HashMap<String, Instant>,
    streams: HashMap<Uuid, Vec<(u64, Vec<u8>)>>,
    next_stream_id: HashMap<Uuid, u64>,
}

pub struct InMemoryBroker {
    state: Mutex<State>,
    max_concurrency: u32,
}

impl InMemoryBroker {
    pub fn new(max_concurrency: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_concurrency,
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(20)
    }
}

fn format_id(seq: u64) -> String {
    format!("{seq:020}-0")
}

#[async_trait]
impl BrokerOps for InMemoryBroker {
    async fn concurrency_try_acquire(&self, max: u32) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        if state.concurrency >= max.min(self.max_concurrency) {
            return Ok(false);
        }
        state.concurrency += 1;
        Ok(true)
    }

    async fn concurrency_release(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.concurrency = state.concurrency.saturating_sub(1);
        Ok(())
    }

    async fn ready_push(&self, task_id: Uuid, bytes: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ready.insert(0, (task_id, bytes));
        state.index.insert(task_id, QueueName::Ready);
        Ok(())
    }

    async fn ready_pop_blocking(
        &self,
        timeout: Duration,
    ) -> Result<Option<(Uuid, Vec<u8>)>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some((task_id, bytes)) = state.ready.pop() {
                    state.index.remove(&task_id);
                    return Ok(Some((task_id, bytes)));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn ready_remove(&self, task_id: Uuid) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        let before = state.ready.len();
        state.ready.retain(|(id, _)| *id != task_id);
        let removed = state.ready.len() != before;
        if removed {
            state.index.remove(&task_id);
        }
        Ok(removed)
    }

    async fn delayed_add(
        &self,
        task_id: Uuid,
        score: i64,
        bytes: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.delayed.entry(score).or_default().push((task_id, bytes));
        state.index.insert(task_id, QueueName::Delayed);
        Ok(())
    }

    async fn delayed_remove(&self, task_id: Uuid) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        let mut removed = false;
        for bucket in state.delayed.values_mut() {
            let before = bucket.len();
            bucket.retain(|(id, _)| *id != task_id);
            if bucket.len() != before {
                removed = true;
            }
        }
        state.delayed.retain(|_, bucket| !bucket.is_empty());
        if removed {
            state.index.remove(&task_id);
        }
        Ok(removed)
    }

    async fn delayed_move_due(&self, now: i64) -> Result<Vec<(Uuid, Vec<u8>)>, BrokerError> {
        let mut state = self.state.lock().await;
        let due_scores: Vec<i64> = state
            .delayed
            .range(..=now)
            .map(|(score, _)| *score)
            .collect();
        let mut moved = Vec::new();
        for score in due_scores {
            if let Some(bucket) = state.delayed.remove(&score) {
                for (task_id, bytes) in bucket {
                    state.ready.insert(0, (task_id, bytes.clone()));
                    state.index.insert(task_id, QueueName::Ready);
                    moved.push((task_id, bytes));
                }
            }
        }
        Ok(moved)
    }

    async fn dead_add(&self, task_id: Uuid, score: i64, bytes: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.dead.entry(score).or_default().push((task_id, bytes));
        state.index.insert(task_id, QueueName::Dead);
        Ok(())
    }

    async fn dead_remove(&self, task_id: Uuid) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        let mut removed = false;
        for bucket in state.dead.values_mut() {
            let before = bucket.len();
            bucket.retain(|(id, _)| *id != task_id);
            if bucket.len() != before {
                removed = true;
            }
        }
        state.dead.retain(|_, bucket| !bucket.is_empty());
        if removed {
            state.index.remove(&task_id);
        }
        Ok(removed)
    }

    async fn index_set(&self, task_id: Uuid, queue: QueueName) -> Result<(), BrokerError> {
        self.state.lock().await.index.insert(task_id, queue);
        Ok(())
    }

    async fn index_get(&self, task_id: Uuid) -> Result<Option<QueueName>, BrokerError> {
        Ok(self.state.lock().await.index.get(&task_id).copied())
    }

    async fn index_remove(&self, task_id: Uuid) -> Result<(), BrokerError> {
        self.state.lock().await.index.remove(&task_id);
        Ok(())
    }

    async fn status_set(
        &self,
        task_id: Uuid,
        state: &str,
        message: &str,
    ) -> Result<(), BrokerError> {
        self.state
            .lock()
            .await
            .status
            .insert(task_id, (state.to_string(), message.to_string()));
        Ok(())
    }

    async fn status_get(&self, task_id: Uuid) -> Result<Option<(String, String)>, BrokerError> {
        Ok(self.state.lock().await.status.get(&task_id).cloned())
    }

    async fn ns_check_and_lock(
        &self,
        namespace: &str,
        wanted_end_time: i64,
        trace_id: Uuid,
        now: i64,
    ) -> Result<NsLockOutcome, BrokerError> {
        let mut state = self.state.lock().await;
        state.known_namespaces.insert(namespace.to_string());
        match state.namespaces.get(namespace) {
            Some(rec) if !rec.enabled => Ok(NsLockOutcome::Disabled),
            Some(rec) if rec.trace_id == trace_id => {
                state.namespaces.insert(
                    namespace.to_string(),
                    NsRecord {
                        trace_id,
                        end_time: wanted_end_time,
                        enabled: true,
                    },
                );
                Ok(NsLockOutcome::Extended)
            }
            Some(rec) if rec.end_time > now => Ok(NsLockOutcome::Busy),
            _ => {
                state.namespaces.insert(
                    namespace.to_string(),
                    NsRecord {
                        trace_id,
                        end_time: wanted_end_time,
                        enabled: true,
                    },
                );
                Ok(NsLockOutcome::Locked)
            }
        }
    }

    async fn ns_release(&self, namespace: &str, trace_id: Uuid) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if let Some(rec) = state.namespaces.get(namespace)
            && rec.trace_id == trace_id
        {
            state.namespaces.remove(namespace);
        }
        Ok(())
    }

    async fn ns_set_status(&self, namespace: &str, enabled: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.known_namespaces.insert(namespace.to_string());
        if let Some(rec) = state.namespaces.get_mut(namespace) {
            rec.enabled = enabled;
        } else {
            state.namespaces.insert(
                namespace.to_string(),
                NsRecord {
                    trace_id: Uuid::nil(),
                    end_time: 0,
                    enabled,
                },
            );
        }
        Ok(())
    }

    async fn ns_register(&self, namespace: &str) -> Result<(), BrokerError> {
        self.state
            .lock()
            .await
            .known_namespaces
            .insert(namespace.to_string());
        Ok(())
    }

    async fn ns_known_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .known_namespaces
            .iter()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn token_acquire(
        &self,
        holder: &str,
        max: u32,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.tokens.retain(|_, expiry| *expiry > now);
        if state.tokens.len() as u32 >= max {
            return Ok(false);
        }
        state.tokens.insert(holder.to_string(), now + ttl);
        Ok(true)
    }

    async fn token_release(&self, holder: &str) -> Result<(), BrokerError> {
        self.state.lock().await.tokens.remove(holder);
        Ok(())
    }

    async fn token_count(&self) -> Result<u32, BrokerError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.tokens.retain(|_, expiry| *expiry > now);
        Ok(state.tokens.len() as u32)
    }

    async fn stream_append(&self, trace_id: Uuid, bytes: Vec<u8>) -> Result<String, BrokerError> {
        let mut state = self.state.lock().await;
        let seq = state.next_stream_id.entry(trace_id).or_insert(0);
        *seq += 1;
        let id = *seq;
        state.streams.entry(trace_id).or_default().push((id, bytes));
        Ok(format_id(id))
    }

    async fn stream_range(
        &self,
        trace_id: Uuid,
        after_id: Option<&str>,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let state = self.state.lock().await;
        let after: u64 = after_id
            .and_then(|id| id.split('-').next())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let entries = state
            .streams
            .get(&trace_id)
            .into_iter()
            .flatten()
            .filter(|(id, _)| *id > after)
            .map(|(id, bytes)| StreamEntry {
                id: format_id(*id),
                bytes: bytes.clone(),
            })
            .collect();
        Ok(entries)
    }

    async fn stream_trim_before(&self, trace_id: Uuid, min_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let min: u64 = min_id.split('-').next().and_then(|s| s.parse().ok()).unwrap_or(0);
        if let Some(entries) = state.streams.get_mut(&trace_id) {
            entries.retain(|(id, _)| *id >= min);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrency_counter_respects_max() {
        let broker = InMemoryBroker::new(2);
        assert!(broker.concurrency_try_acquire(2).await.unwrap());
        assert!(broker.concurrency_try_acquire(2).await.unwrap());
        assert!(!broker.concurrency_try_acquire(2).await.unwrap());
        broker.concurrency_release().await.unwrap();
        assert!(broker.concurrency_try_acquire(2).await.unwrap());
    }

    #[tokio::test]
    async fn ready_push_pop_is_fifo_for_single_consumer() {
        let broker = InMemoryBroker::default();
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        broker.ready_push(id1, b"one".to_vec()).await.unwrap();
        broker.ready_push(id2, b"two".to_vec()).await.unwrap();
        let (first, _) = broker
            .ready_pop_blocking(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, id1);
    }

    #[tokio::test]
    async fn delayed_move_due_only_moves_entries_at_or_before_now() {
        let broker = InMemoryBroker::default();
        let early = Uuid::new_v4();
        let late = Uuid::new_v4();
        broker.delayed_add(early, 100, b"early".to_vec()).await.unwrap();
        broker.delayed_add(late, 200, b"late".to_vec()).await.unwrap();

        let moved = broker.delayed_move_due(150).await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].0, early);
        assert_eq!(broker.index_get(late).await.unwrap(), Some(QueueName::Delayed));
        assert_eq!(broker.index_get(early).await.unwrap(), Some(QueueName::Ready));
    }

    #[tokio::test]
    async fn namespace_lock_busy_then_release_then_lockable() {
        let broker = InMemoryBroker::default();
        let trace_a = Uuid::new_v4();
        let trace_b = Uuid::new_v4();

        let first = broker
            .ns_check_and_lock("ts0", 1_000, trace_a, 0)
            .await
            .unwrap();
        assert_eq!(first, NsLockOutcome::Locked);

        let second = broker
            .ns_check_and_lock("ts0", 1_000, trace_b, 1)
            .await
            .unwrap();
        assert_eq!(second, NsLockOutcome::Busy);

        broker.ns_release("ts0", trace_a).await.unwrap();

        let third = broker
            .ns_check_and_lock("ts0", 1_000, trace_b, 2)
            .await
            .unwrap();
        assert_eq!(third, NsLockOutcome::Locked);
    }

    #[tokio::test]
    async fn disabled_namespace_always_fails() {
        let broker = InMemoryBroker::default();
        broker.ns_set_status("ts0", false).await.unwrap();
        let outcome = broker
            .ns_check_and_lock("ts0", 1_000, Uuid::new_v4(), 0)
            .await
            .unwrap();
        assert_eq!(outcome, NsLockOutcome::Disabled);
    }

    #[tokio::test]
    async fn token_acquire_respects_max_and_ttl() {
        let broker = InMemoryBroker::default();
        assert!(broker.token_acquire("t1", 1, Duration::from_millis(20)).await.unwrap());
        assert!(!broker.token_acquire("t2", 1, Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(broker.token_acquire("t2", 1, Duration::from_millis(20)).await.unwrap());
    }

    #[tokio::test]
    async fn stream_ids_are_monotonic_and_range_respects_after_id() {
        let broker = InMemoryBroker::default();
        let trace_id = Uuid::new_v4();
        let id1 = broker.stream_append(trace_id, b"a".to_vec()).await.unwrap();
        let _id2 = broker.stream_append(trace_id, b"b".to_vec()).await.unwrap();

        let all = broker.stream_range(trace_id, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let after_first = broker.stream_range(trace_id, Some(&id1)).await.unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].bytes, b"b");
    }
}
