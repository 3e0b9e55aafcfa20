//! Typed error hierarchy for the RCA experiment controller.
//!
//! One enum per subsystem boundary, each realizing a subset of the ten
//! error kinds from §7. Library crates never return `anyhow::Error`; the
//! runtime binary is the only place context gets flattened into it.

use thiserror::Error;

/// Errors from the persistence store (C1).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid payload: {0}")]
    PayloadInvalid(String),

    #[error("store error: {0}")]
    Backend(String),
}

/// Errors from the message broker & KV store (C2).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker error: {0}")]
    Backend(String),

    #[error("operation timed out")]
    Timeout,
}

/// Errors from the namespace lock manager (C3).
#[derive(Debug, Error)]
pub enum NamespaceLockError {
    #[error("namespace busy")]
    NamespaceBusy,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors from the rate limiter (C4).
#[derive(Debug, Error)]
pub enum RateLimiterError {
    #[error("no token available")]
    TokenUnavailable,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors surfaced by a `TaskHandler` (C7/C8).
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    PayloadInvalid(String),

    #[error("namespace busy")]
    NamespaceBusy,

    #[error("no token available")]
    TokenUnavailable,

    #[error("cluster rejected the request: {0}")]
    ClusterRejected(String),

    #[error("builder error: {0}")]
    BuilderError(String),

    #[error("canceled")]
    Canceled,

    #[error("timed out")]
    Timeout,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<NamespaceLockError> for HandlerError {
    fn from(err: NamespaceLockError) -> Self {
        match err {
            NamespaceLockError::NamespaceBusy => HandlerError::NamespaceBusy,
            NamespaceLockError::Broker(b) => HandlerError::Broker(b),
        }
    }
}

impl From<RateLimiterError> for HandlerError {
    fn from(err: RateLimiterError) -> Self {
        match err {
            RateLimiterError::TokenUnavailable => HandlerError::TokenUnavailable,
            RateLimiterError::Broker(b) => HandlerError::Broker(b),
        }
    }
}

/// Errors from the dispatcher (C7) itself, as distinct from a handler's own
/// `HandlerError`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_lock_error_converts_to_handler_error() {
        let err: HandlerError = NamespaceLockError::NamespaceBusy.into();
        assert!(matches!(err, HandlerError::NamespaceBusy));
    }

    #[test]
    fn rate_limiter_error_converts_to_handler_error() {
        let err: HandlerError = RateLimiterError::TokenUnavailable.into();
        assert!(matches!(err, HandlerError::TokenUnavailable));
    }

    #[test]
    fn dispatch_error_wraps_handler_error() {
        let err: DispatchError = HandlerError::Canceled.into();
        match err {
            DispatchError::Handler(HandlerError::Canceled) => {}
            other => panic!("expected Handler(Canceled), got {other:?}"),
        }
    }

    #[test]
    fn store_error_display_carries_message() {
        let err = StoreError::NotFound("task xyz".into());
        assert!(err.to_string().contains("task xyz"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::NotFound("x".into()));
        assert_std_error(&BrokerError::Timeout);
        assert_std_error(&NamespaceLockError::NamespaceBusy);
        assert_std_error(&RateLimiterError::TokenUnavailable);
        assert_std_error(&HandlerError::Canceled);
        assert_std_error(&DispatchError::UnknownTaskType("x".into()));
    }
}
