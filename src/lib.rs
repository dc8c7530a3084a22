//! # resilient-fetch
//!
//! A self-maintaining pool of free proxies and a retry orchestrator for
//! fetches against a target that blocks or throttles direct requests.
//!
//! A background maintainer fetches candidate proxies from plain-text lists,
//! validates them by running the real fetch against a known-good resource, and
//! keeps a bounded ready pool topped up. Each fetch is tried through a few ready
//! proxies and finally directly; failures that blame the path evict the proxy
//! and move on, failures that blame the target stop immediately.

pub mod config;
pub mod error;
pub mod maintainer;
pub mod middleware;
pub mod pool;
pub mod proxy;
pub mod retry;
pub mod service;
pub mod session;
pub mod source;
pub mod validator;
pub mod youtube;

pub use config::{FetchConfig, FetchConfigBuilder};
pub use error::{AggregatedFailure, FetchFailure, PathFailure, PermanentCause, RetryError, TransientCause};
pub use maintainer::{MaintainerHandle, PoolMaintainer};
pub use middleware::ProxyPoolMiddleware;
pub use pool::{PoolStats, ProxyPool};
pub use proxy::{ExecutionPath, ProxyAddress, ProxyScheme};
pub use retry::{FetchOperation, RetryOrchestrator, RetryPlan};
pub use service::FetchService;
pub use session::{AttemptContext, CookieFileLoader, SessionFactory, SessionLoader, SessionMaterial};
pub use source::{CandidateSource, SourceAggregator};
pub use validator::{OperationValidator, ProxyValidator};
pub use youtube::{extract_video_id, select_track, CaptionTrack, CaptionTrackProbe, TrackChoice, Transcript, TranscriptFetch};
