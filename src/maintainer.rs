//! Background task keeping the ready pool topped up.

use crate::config::FetchConfig;
use crate::pool::ProxyPool;
use crate::source::CandidateSource;
use crate::validator::ProxyValidator;

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What one maintenance cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Proxies accepted by the validation batch, if one ran.
    pub validated: Option<usize>,
    /// Candidates fetched, if a refresh was due and succeeded.
    pub refreshed: Option<usize>,
}

/// Keeps the pool supplied with candidates and validated proxies.
pub struct PoolMaintainer {
    pool: Arc<ProxyPool>,
    source: Arc<dyn CandidateSource>,
    validator: Arc<dyn ProxyValidator>,
    low_water_mark: usize,
    refresh_interval: Duration,
    batch_size: usize,
    concurrency: usize,
    tick: Duration,
    startup_delay: Duration,
    error_backoff: Duration,
    refill_cooldown: Duration,
}

/// Handle to a running maintainer.
pub struct MaintainerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintainerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown and wait for the loop to exit.
    ///
    /// In-flight validations are bounded by their own timeouts.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Pool maintainer ended abnormally: {}", e);
        }
    }
}

impl PoolMaintainer {
    pub fn new(
        pool: Arc<ProxyPool>,
        source: Arc<dyn CandidateSource>,
        validator: Arc<dyn ProxyValidator>,
        config: &FetchConfig,
    ) -> Self {
        Self {
            pool,
            source,
            validator,
            low_water_mark: config.low_water_mark,
            refresh_interval: config.refresh_interval,
            batch_size: config.validation_batch_size,
            concurrency: config.validation_concurrency,
            tick: config.maintenance_interval,
            startup_delay: config.startup_delay,
            error_backoff: config.error_backoff,
            refill_cooldown: config.refill_cooldown,
        }
    }

    /// Start the maintainer loop on the current tokio runtime.
    pub fn spawn(self) -> MaintainerHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::new(self).run(rx));
        MaintainerHandle { shutdown, task }
    }

    fn refresh_due(&self) -> bool {
        match self.pool.last_fetch() {
            Some(at) => at.elapsed() >= self.refresh_interval,
            None => true,
        }
    }

    /// Fetch a new raw candidate list. A total source failure leaves the pool untouched.
    pub async fn refresh_candidates(&self) -> Option<usize> {
        let candidates = self.source.fetch_candidates().await;
        let count = candidates.len();
        if self.pool.replace_candidates(candidates) {
            info!("Raw proxy list refreshed with {} candidates", count);
            Some(count)
        } else {
            warn!("Proxy list refresh returned nothing, keeping previous candidates");
            None
        }
    }

    /// Validate a batch when the ready pool is below its low-water mark.
    pub async fn top_up(&self) -> Option<usize> {
        let ready = self.pool.ready_len();
        if ready >= self.low_water_mark {
            return None;
        }
        debug!("Ready pool at {} (low-water {}), validating", ready, self.low_water_mark);
        self.pool
            .validate_batch(self.validator.as_ref(), self.batch_size, self.concurrency)
            .await
            .map(|report| report.accepted)
    }

    /// One steady-state maintenance cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let validated = self.top_up().await;
        let refreshed = if self.refresh_due() {
            self.refresh_candidates().await
        } else {
            None
        };
        CycleReport { validated, refreshed }
    }

    async fn startup_cycle(&self) -> CycleReport {
        let refreshed = self.refresh_candidates().await;
        let validated = self.top_up().await;
        CycleReport { validated, refreshed }
    }

    /// Run a cycle as its own task so a panic is contained and reported.
    async fn guarded(self: &Arc<Self>, startup: bool) -> bool {
        let this = Arc::clone(self);
        let cycle = tokio::spawn(async move {
            if startup {
                this.startup_cycle().await
            } else {
                this.run_cycle().await
            }
        });
        match cycle.await {
            Ok(report) => {
                let stats = self.pool.stats();
                info!(
                    "Proxy pool status: {} ready, {} raw, {} failed ({:?})",
                    stats.ready, stats.raw, stats.failed, report
                );
                true
            }
            Err(e) => {
                error!("Pool maintenance cycle crashed, backing off: {}", e);
                false
            }
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Pool maintainer starting in {:?}", self.startup_delay);
        let mut delay = self.startup_delay;
        let mut startup = true;
        let mut last_cycle = Instant::now();

        loop {
            // requests arriving within the cooldown are held, not dropped
            let refill = async {
                tokio::time::sleep_until(last_cycle + self.refill_cooldown).await;
                self.pool.refill_requested().await
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = refill, if !startup => {
                    debug!("Refill requested, running maintenance early");
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            delay = if self.guarded(startup).await {
                self.tick
            } else {
                self.error_backoff
            };
            last_cycle = Instant::now();
            startup = false;
        }
        info!("Pool maintainer stopped");
    }
}
