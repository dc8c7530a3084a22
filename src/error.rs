//! Error types for the resilient-fetch crate.
//!
//! Failures of a single fetch attempt are tagged where they are observed:
//! [`FetchFailure::Transient`] blames the execution path, [`FetchFailure::Permanent`]
//! blames the target resource. The retry orchestrator only ever looks at the tag.

use crate::proxy::ExecutionPath;

use std::fmt;
use thiserror::Error;

/// A target-specific condition that no other execution path can change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermanentCause {
    /// The target resource does not exist.
    #[error("resource not found")]
    NotFound,
    /// The target resource was withdrawn, made private or is otherwise unplayable.
    #[error("resource unavailable: {0}")]
    Unavailable(String),
    /// The target exists but has the requested result disabled.
    #[error("results disabled for this resource")]
    Disabled,
    /// The target exists but has no result to offer.
    #[error("no result available")]
    NoResult,
}

/// A path-specific failure; another proxy (or the direct path) may succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransientCause {
    #[error("attempt timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    /// The target answered, but refused or throttled this path.
    #[error("blocked by target: {0}")]
    Blocked(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The attempt context (client, proxy) could not be built.
    #[error("session setup failed: {0}")]
    Session(String),
    #[error("{0}")]
    Other(String),
}

impl TransientCause {
    /// Whether the target actively refused or throttled the path.
    pub fn is_blocking(&self) -> bool {
        matches!(self, TransientCause::Blocked(_))
            || matches!(self, TransientCause::Status(403) | TransientCause::Status(429))
    }
}

impl From<reqwest::Error> for TransientCause {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransientCause::Timeout
        } else if err.is_connect() {
            TransientCause::Connect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            TransientCause::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            TransientCause::Status(status.as_u16())
        } else {
            TransientCause::Other(err.to_string())
        }
    }
}

/// The failure half of a fetch attempt's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    #[error("transient failure: {0}")]
    Transient(TransientCause),
    #[error("permanent failure: {0}")]
    Permanent(PermanentCause),
}

impl FetchFailure {
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchFailure::Permanent(_))
    }
}

impl From<TransientCause> for FetchFailure {
    fn from(cause: TransientCause) -> Self {
        FetchFailure::Transient(cause)
    }
}

impl From<PermanentCause> for FetchFailure {
    fn from(cause: PermanentCause) -> Self {
        FetchFailure::Permanent(cause)
    }
}

impl From<reqwest::Error> for FetchFailure {
    fn from(err: reqwest::Error) -> Self {
        FetchFailure::Transient(err.into())
    }
}

/// One failed attempt of a retry plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFailure {
    pub path: ExecutionPath,
    pub cause: TransientCause,
}

/// Every path of a retry plan failed transiently.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregatedFailure {
    /// Per-path failures in the order the paths were attempted.
    pub failures: Vec<PathFailure>,
}

impl AggregatedFailure {
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// True when the target blocked or throttled every attempted path.
    pub fn all_blocked(&self) -> bool {
        !self.failures.is_empty() && self.failures.iter().all(|f| f.cause.is_blocking())
    }
}

impl fmt::Display for AggregatedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all {} execution paths failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{} -> {}", sep, failure.path, failure.cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregatedFailure {}

/// Error returned by the retry orchestrator.
#[derive(Debug, Clone, Error)]
pub enum RetryError {
    /// The target itself refused; remaining paths were not tried.
    #[error("permanent failure via {path}: {cause}")]
    Permanent {
        path: ExecutionPath,
        cause: PermanentCause,
    },
    #[error(transparent)]
    Exhausted(AggregatedFailure),
}

/// A single proxy list source could not be read.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("source answered with status {0}")]
    Status(u16),
    #[error("cannot read file: {0}")]
    Io(#[from] std::io::Error),
}

/// Session material could not be loaded.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot read cookie file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cookie value is not a valid header: {0}")]
    InvalidHeader(String),
}

/// The input is neither a YouTube URL nor a bare video id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid YouTube URL or video id: {0}")]
pub struct InvalidVideoId(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyAddress;

    fn proxy(addr: &str) -> ExecutionPath {
        ExecutionPath::Proxy(addr.parse::<ProxyAddress>().unwrap())
    }

    #[test]
    fn all_blocked_requires_every_path_blocked() {
        let mut agg = AggregatedFailure {
            failures: vec![
                PathFailure {
                    path: proxy("1.1.1.1:80"),
                    cause: TransientCause::Status(429),
                },
                PathFailure {
                    path: ExecutionPath::Direct,
                    cause: TransientCause::Blocked("captcha".into()),
                },
            ],
        };
        assert!(agg.all_blocked());

        agg.failures.push(PathFailure {
            path: proxy("2.2.2.2:80"),
            cause: TransientCause::Timeout,
        });
        assert!(!agg.all_blocked());
        assert!(!AggregatedFailure::default().all_blocked());
    }

    #[test]
    fn aggregated_failure_lists_paths() {
        let agg = AggregatedFailure {
            failures: vec![
                PathFailure {
                    path: proxy("1.1.1.1:80"),
                    cause: TransientCause::Timeout,
                },
                PathFailure {
                    path: ExecutionPath::Direct,
                    cause: TransientCause::Status(503),
                },
            ],
        };
        assert_eq!(
            agg.to_string(),
            "all 2 execution paths failed: 1.1.1.1:80 -> attempt timed out; direct -> unexpected status 503"
        );
    }
}
