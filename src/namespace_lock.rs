//! Namespace lock manager (C3): mutual exclusion plus a time-window
//! reservation over a fixed fleet of cluster namespaces.

use std::sync::Arc;

use chrono::Utc;
use rca_common::errors::NamespaceLockError;
use tracing::instrument;
use uuid::Uuid;

use crate::broker::{BrokerOps, NsLockOutcome};

pub struct NamespaceLockManager {
    broker: Arc<dyn BrokerOps>,
}

impl NamespaceLockManager {
    pub fn new(broker: Arc<dyn BrokerOps>) -> Self {
        Self { broker }
    }

    /// `CheckAndLock(namespace, wanted_end_time, trace_id)` (§4.3). Disabled
    /// namespaces always fail; a live lock held by another trace fails with
    /// `NamespaceBusy`; the caller's own lock is extended in place.
    #[instrument(skip(self), fields(namespace, trace_id = %trace_id))]
    pub async fn check_and_lock(
        &self,
        namespace: &str,
        wanted_end_time_epoch: i64,
        trace_id: Uuid,
    ) -> Result<(), NamespaceLockError> {
        let now = Utc::now().timestamp();
        match self
            .broker
            .ns_check_and_lock(namespace, wanted_end_time_epoch, trace_id, now)
            .await?
        {
            NsLockOutcome::Locked | NsLockOutcome::Extended => Ok(()),
            NsLockOutcome::Busy | NsLockOutcome::Disabled => {
                Err(NamespaceLockError::NamespaceBusy)
            }
        }
    }

    /// `GetFree(prefix, wanted_end_time, trace_id)` (§4.3). Scans the
    /// prefix family in a deterministic order and returns the first
    /// namespace that can be locked; an empty string means none are free,
    /// which is not an error.
    #[instrument(skip(self), fields(prefix, trace_id = %trace_id))]
    pub async fn get_free(
        &self,
        prefix: &str,
        wanted_end_time_epoch: i64,
        trace_id: Uuid,
    ) -> Result<Option<String>, NamespaceLockError> {
        let candidates = self.broker.ns_known_with_prefix(prefix).await?;
        let now = Utc::now().timestamp();
        for namespace in candidates {
            let outcome = self
                .broker
                .ns_check_and_lock(&namespace, wanted_end_time_epoch, trace_id, now)
                .await?;
            if outcome.is_acquired() {
                return Ok(Some(namespace));
            }
        }
        Ok(None)
    }

    /// `Release(namespace, trace_id)` — only clears the lock if the stored
    /// `trace_id` matches; idempotent no-op otherwise.
    #[instrument(skip(self), fields(namespace, trace_id = %trace_id))]
    pub async fn release(&self, namespace: &str, trace_id: Uuid) -> Result<(), NamespaceLockError> {
        self.broker.ns_release(namespace, trace_id).await?;
        Ok(())
    }

    /// `SetStatus(namespace, Enabled|Disabled)` — admin control.
    pub async fn set_status(&self, namespace: &str, enabled: bool) -> Result<(), NamespaceLockError> {
        self.broker.ns_set_status(namespace, enabled).await?;
        Ok(())
    }

    /// Admin registration of a namespace into the known fleet so it
    /// participates in `GetFree` prefix scans.
    pub async fn register(&self, namespace: &str) -> Result<(), NamespaceLockError> {
        self.broker.ns_register(namespace).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;

    fn manager() -> NamespaceLockManager {
        NamespaceLockManager::new(Arc::new(InMemoryBroker::default()))
    }

    #[tokio::test]
    async fn get_free_returns_none_when_all_held() {
        let mgr = manager();
        mgr.register("ts-0").await.unwrap();
        mgr.register("ts-1").await.unwrap();
        let trace_a = Uuid::new_v4();
        let trace_b = Uuid::new_v4();

        mgr.check_and_lock("ts-0", 1_000_000_000, trace_a).await.unwrap();
        mgr.check_and_lock("ts-1", 1_000_000_000, trace_a).await.unwrap();

        let free = mgr.get_free("ts-", 1_000_000_000, trace_b).await.unwrap();
        assert_eq!(free, None);
    }

    #[tokio::test]
    async fn get_free_returns_first_available_in_deterministic_order() {
        let mgr = manager();
        mgr.register("ts-0").await.unwrap();
        mgr.register("ts-1").await.unwrap();
        let trace_a = Uuid::new_v4();
        let trace_b = Uuid::new_v4();

        mgr.check_and_lock("ts-0", 1_000_000_000, trace_a).await.unwrap();

        let free = mgr.get_free("ts-", 1_000_000_000, trace_b).await.unwrap();
        assert_eq!(free, Some("ts-1".to_string()));
    }

    #[tokio::test]
    async fn release_is_noop_if_caller_does_not_hold_the_lock() {
        let mgr = manager();
        let trace_a = Uuid::new_v4();
        let trace_b = Uuid::new_v4();
        mgr.check_and_lock("ts-0", 1_000_000_000, trace_a).await.unwrap();

        mgr.release("ts-0", trace_b).await.unwrap();

        let err = mgr
            .check_and_lock("ts-0", 1_000_000_000, trace_b)
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceLockError::NamespaceBusy));
    }

    #[tokio::test]
    async fn disabled_namespace_fails_check_and_lock() {
        let mgr = manager();
        mgr.set_status("ts-0", false).await.unwrap();
        let err = mgr
            .check_and_lock("ts-0", 1_000_000_000, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceLockError::NamespaceBusy));
    }
}
