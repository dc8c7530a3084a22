//! Wiring of the pool, its maintainer and the orchestrator.

use crate::config::FetchConfig;
use crate::maintainer::{MaintainerHandle, PoolMaintainer};
use crate::middleware::ProxyPoolMiddleware;
use crate::pool::{PoolStats, ProxyPool};
use crate::retry::RetryOrchestrator;
use crate::session::SessionFactory;
use crate::source::{CandidateSource, SourceAggregator};
use crate::validator::{OperationValidator, ProxyValidator};
use crate::error::InvalidVideoId;
use crate::youtube::TranscriptFetch;

use log::info;
use std::sync::Arc;

/// The process-wide fetch core: one pool, one maintainer, shared orchestrator.
///
/// Construct once at startup and hand out [`FetchService::orchestrator`] or
/// [`FetchService::middleware`] to request handlers.
pub struct FetchService {
    pool: Arc<ProxyPool>,
    orchestrator: Arc<RetryOrchestrator>,
    maintainer: MaintainerHandle,
}

impl FetchService {
    /// Start the service with the default sources, cookie loader and validator.
    ///
    /// Candidates are validated by fetching the transcript of the configured
    /// validation video, the same workflow requests run.
    /// Must be called from within a tokio runtime.
    pub fn start(config: FetchConfig) -> Result<Self, InvalidVideoId> {
        let sessions = Arc::new(SessionFactory::new(&config));
        let source = Arc::new(SourceAggregator::new(config.sources.clone(), config.list_fetch_timeout));
        let validator = Arc::new(OperationValidator::new(
            validation_target(&config)?,
            Arc::clone(&sessions),
            config.validation_timeout,
            config.validations_per_second,
        ));
        Ok(Self::start_with(config, sessions, source, validator))
    }

    /// Start the service with custom collaborators.
    pub fn start_with(
        config: FetchConfig,
        sessions: Arc<SessionFactory>,
        source: Arc<dyn CandidateSource>,
        validator: Arc<dyn ProxyValidator>,
    ) -> Self {
        info!(
            "Starting fetch service: capacity {}, low-water {}, {} attempts, {} sources",
            config.ready_capacity,
            config.low_water_mark,
            config.max_attempts,
            config.sources.len()
        );
        let pool = Arc::new(ProxyPool::new(config.ready_capacity));
        let orchestrator = Arc::new(RetryOrchestrator::new(
            Arc::clone(&pool),
            sessions,
            config.max_attempts,
            config.attempt_timeout,
        ));
        let maintainer = PoolMaintainer::new(Arc::clone(&pool), source, validator, &config).spawn();

        Self {
            pool,
            orchestrator,
            maintainer,
        }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn orchestrator(&self) -> Arc<RetryOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// A reqwest middleware backed by this service's orchestrator.
    pub fn middleware(&self) -> ProxyPoolMiddleware {
        ProxyPoolMiddleware::new(self.orchestrator())
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stop the maintainer and wait for it to exit.
    pub async fn shutdown(self) {
        info!("Shutting down fetch service");
        self.maintainer.shutdown().await;
    }
}

/// The known-good fetch every candidate has to complete.
fn validation_target(config: &FetchConfig) -> Result<TranscriptFetch, InvalidVideoId> {
    TranscriptFetch::new(&config.validation_video_id, None)
}
