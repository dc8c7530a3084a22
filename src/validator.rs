//! Validating candidate proxies against the real target.
//!
//! A proxy that merely connects is not good enough: the target blocks many
//! of them. Validation therefore runs the actual fetch operation against a
//! known-good resource through the candidate.

use crate::proxy::{ExecutionPath, ProxyAddress};
use crate::retry::FetchOperation;
use crate::session::SessionFactory;

use async_trait::async_trait;
use governor::{clock::DefaultClock, middleware::NoOpMiddleware, state::{InMemoryState, NotKeyed}, Quota, RateLimiter};
use log::debug;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether a candidate proxy is usable.
#[async_trait]
pub trait ProxyValidator: Send + Sync {
    async fn validate(&self, address: &ProxyAddress) -> bool;
}

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Validates a proxy by running `operation` through it once.
///
/// Any failure, transient or permanent, rejects the proxy. There are no
/// retries within a validation.
pub struct OperationValidator<O> {
    operation: O,
    sessions: Arc<SessionFactory>,
    timeout: Duration,
    limiter: Arc<Limiter>,
}

impl<O: FetchOperation> OperationValidator<O> {
    /// Create a validator allowing at most `max_per_second` validations per second.
    pub fn new(operation: O, sessions: Arc<SessionFactory>, timeout: Duration, max_per_second: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(max_per_second).unwrap_or(NonZeroU32::MIN));
        Self {
            operation,
            sessions,
            timeout,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }
}

#[async_trait]
impl<O: FetchOperation> ProxyValidator for OperationValidator<O> {
    async fn validate(&self, address: &ProxyAddress) -> bool {
        self.limiter.until_ready().await;

        let path = ExecutionPath::Proxy(address.clone());
        let ctx = match self.sessions.context_for(&path).await {
            Ok(ctx) => ctx,
            Err(e) => {
                debug!("Cannot build client for {}: {}", address, e);
                return false;
            }
        };

        match tokio::time::timeout(self.timeout, self.operation.execute(&ctx)).await {
            Ok(Ok(_)) => {
                debug!("Proxy {} passed validation", address);
                true
            }
            Ok(Err(failure)) => {
                debug!("Proxy {} failed validation: {}", address, failure);
                false
            }
            Err(_) => {
                debug!("Proxy {} timed out during validation", address);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::error::{FetchFailure, PermanentCause};
    use crate::session::AttemptContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Outcome {
        result: Result<(), FetchFailure>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FetchOperation for Outcome {
        type Output = ();

        async fn execute(&self, ctx: &AttemptContext) -> Result<(), FetchFailure> {
            assert!(!ctx.path().is_direct());
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn validator(result: Result<(), FetchFailure>) -> OperationValidator<Outcome> {
        let config = FetchConfig::default();
        OperationValidator::new(
            Outcome { result, calls: AtomicUsize::new(0) },
            Arc::new(SessionFactory::with_loader(&config, None)),
            Duration::from_millis(200),
            100,
        )
    }

    #[tokio::test]
    async fn successful_operation_accepts_proxy() {
        let v = validator(Ok(()));
        assert!(v.validate(&"10.0.0.1:8080".parse().unwrap()).await);
        assert_eq!(v.operation.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn any_failure_rejects_proxy_without_retrying() {
        let v = validator(Err(FetchFailure::Permanent(PermanentCause::Disabled)));
        assert!(!v.validate(&"10.0.0.1:8080".parse().unwrap()).await);
        assert_eq!(v.operation.calls.load(Ordering::SeqCst), 1);
    }
}
