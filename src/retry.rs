//! Retrying a fetch across ready proxies and a final direct attempt.

use crate::error::{AggregatedFailure, FetchFailure, PathFailure, RetryError, TransientCause};
use crate::pool::ProxyPool;
use crate::proxy::ExecutionPath;
use crate::session::{AttemptContext, SessionFactory};

use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// A fetch that can be attempted through any execution path.
///
/// Implementations tag failures as transient (blame the path) or permanent
/// (blame the target) at the point they observe them.
#[async_trait]
pub trait FetchOperation: Send + Sync {
    type Output: Send;

    /// Run the fetch once using the attempt's isolated context.
    async fn execute(&self, ctx: &AttemptContext) -> Result<Self::Output, FetchFailure>;
}

/// The ordered execution paths of one request: ready proxies first, direct last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    paths: Vec<ExecutionPath>,
}

impl RetryPlan {
    /// Draw up to `max_attempts - 1` proxies from the pool and append the direct path.
    ///
    /// The plan is never padded: a pool with fewer proxies yields a shorter plan.
    pub fn build(pool: &ProxyPool, max_attempts: usize) -> Self {
        let wanted = max_attempts.saturating_sub(1);
        let mut paths: Vec<ExecutionPath> = pool
            .take_n(wanted)
            .into_iter()
            .map(ExecutionPath::Proxy)
            .collect();
        if paths.len() < wanted {
            pool.request_refill();
        }
        paths.push(ExecutionPath::Direct);
        Self { paths }
    }

    pub fn paths(&self) -> &[ExecutionPath] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Executes fetch operations with proxy rotation and direct fallback.
pub struct RetryOrchestrator {
    pool: Arc<ProxyPool>,
    sessions: Arc<SessionFactory>,
    max_attempts: usize,
    attempt_timeout: Duration,
}

impl RetryOrchestrator {
    pub fn new(
        pool: Arc<ProxyPool>,
        sessions: Arc<SessionFactory>,
        max_attempts: usize,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            sessions,
            max_attempts: max_attempts.max(1),
            attempt_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run `operation` with the configured number of attempts.
    pub async fn execute<O: FetchOperation>(&self, operation: &O) -> Result<O::Output, RetryError> {
        self.execute_with_retry(operation, self.max_attempts).await
    }

    /// Run `operation` once per path of a fresh retry plan until one succeeds
    /// or the target reports a permanent failure.
    pub async fn execute_with_retry<O: FetchOperation>(
        &self,
        operation: &O,
        max_attempts: usize,
    ) -> Result<O::Output, RetryError> {
        let plan = RetryPlan::build(&self.pool, max_attempts);
        let total = plan.len();
        let mut failures = Vec::with_capacity(total);

        for (i, path) in plan.paths.into_iter().enumerate() {
            info!("Fetching via {} (attempt {}/{})", path, i + 1, total);

            let outcome = match self.sessions.context_for(&path).await {
                Ok(ctx) => match tokio::time::timeout(self.attempt_timeout, operation.execute(&ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchFailure::Transient(TransientCause::Timeout)),
                },
                Err(e) => Err(FetchFailure::Transient(TransientCause::Session(e.to_string()))),
            };

            let cause = match outcome {
                Ok(output) => return Ok(output),
                Err(FetchFailure::Permanent(cause)) => {
                    warn!("Permanent failure via {}: {}", path, cause);
                    return Err(RetryError::Permanent { path, cause });
                }
                Err(FetchFailure::Transient(cause)) => cause,
            };

            warn!("Attempt {}/{} via {} failed: {}", i + 1, total, path, cause);
            if let Some(addr) = path.proxy() {
                self.pool.mark_failed(addr);
            }
            failures.push(PathFailure { path, cause });
        }

        Err(RetryError::Exhausted(AggregatedFailure { failures }))
    }
}
