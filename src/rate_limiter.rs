//! Rate limiter (C4): a counted-set limiter specific to restart-pedestal
//! tasks, backed by C2 so the budget is shared across controller replicas.

use std::sync::Arc;
use std::time::Duration;

use rca_common::errors::RateLimiterError;
use tracing::instrument;
use uuid::Uuid;

use crate::broker::BrokerOps;

/// TTL on an acquired token, preventing a permanent leak if the process
/// holding it crashes before releasing (§4.4).
pub const TOKEN_TTL: Duration = Duration::from_secs(600);

pub struct RateLimiter {
    broker: Arc<dyn BrokerOps>,
    max_concurrent: u32,
}

impl RateLimiter {
    pub fn new(broker: Arc<dyn BrokerOps>, max_concurrent: u32) -> Self {
        Self {
            broker,
            max_concurrent,
        }
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn acquire(&self, task_id: Uuid) -> Result<bool, RateLimiterError> {
        Ok(self
            .broker
            .token_acquire(&task_id.to_string(), self.max_concurrent, TOKEN_TTL)
            .await?)
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn release(&self, task_id: Uuid) -> Result<(), RateLimiterError> {
        self.broker.token_release(&task_id.to_string()).await?;
        Ok(())
    }

    /// Polls `acquire` with a bounded duration; returns `false` on timeout
    /// rather than erroring, per §4.4's `WaitForToken`.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn wait_for_token(
        &self,
        task_id: Uuid,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool, RateLimiterError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.acquire(task_id).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;

    #[tokio::test]
    async fn acquire_respects_max_concurrent() {
        let limiter = RateLimiter::new(Arc::new(InMemoryBroker::default()), 1);
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        assert!(limiter.acquire(t1).await.unwrap());
        assert!(!limiter.acquire(t2).await.unwrap());
        limiter.release(t1).await.unwrap();
        assert!(limiter.acquire(t2).await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_token_times_out_under_saturation() {
        let limiter = RateLimiter::new(Arc::new(InMemoryBroker::default()), 1);
        let holder = Uuid::new_v4();
        limiter.acquire(holder).await.unwrap();

        let waiter = Uuid::new_v4();
        let acquired = limiter
            .wait_for_token(waiter, Duration::from_millis(30), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!acquired);
    }
}
