//! Core proxy pool implementation.
//!
//! `ProxyPool` owns the process-wide pool state. Each field group sits behind
//! its own lock, and no lock is ever held across an `.await`, so request
//! handlers rotating the ready queue never wait on a validation batch.

use crate::proxy::ProxyAddress;
use crate::validator::ProxyValidator;

use futures::stream::{self, StreamExt};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Result of offering a validated proxy to the ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Added,
    AlreadyReady,
    Full,
}

/// Bounded rotating queue of validated proxies. Insertion order is rotation order.
#[derive(Debug)]
struct ReadyQueue {
    entries: VecDeque<ProxyAddress>,
    capacity: usize,
}

impl ReadyQueue {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, addr: &ProxyAddress) -> bool {
        self.entries.contains(addr)
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    fn push(&mut self, addr: ProxyAddress) -> PushOutcome {
        if self.contains(&addr) {
            PushOutcome::AlreadyReady
        } else if self.is_full() {
            PushOutcome::Full
        } else {
            self.entries.push_back(addr);
            PushOutcome::Added
        }
    }

    /// Move up to `n` entries from the head to the tail, returning them in order.
    fn rotate(&mut self, n: usize) -> Vec<ProxyAddress> {
        let n = n.min(self.entries.len());
        let mut taken = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(addr) = self.entries.pop_front() {
                self.entries.push_back(addr.clone());
                taken.push(addr);
            }
        }
        taken
    }

    fn remove(&mut self, addr: &ProxyAddress) -> bool {
        match self.entries.iter().position(|a| a == addr) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// Read-only snapshot of the pool for operational visibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub ready: usize,
    pub raw: usize,
    pub failed: usize,
    /// Seconds since the last successful raw-list fetch, if any.
    pub secs_since_fetch: Option<u64>,
    pub validating: bool,
}

/// Outcome of one validation batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub sampled: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// The failed set had to be reset to find untried candidates.
    pub failed_reset: bool,
}

/// A pool of validated proxies plus the candidates they are drawn from.
pub struct ProxyPool {
    ready: Mutex<ReadyQueue>,
    failed: Mutex<HashSet<ProxyAddress>>,
    raw: RwLock<Arc<HashSet<ProxyAddress>>>,
    last_fetch: Mutex<Option<Instant>>,
    validating: AtomicBool,
    refill: Notify,
}

/// Clears the validation flag when a batch ends, however it ends.
struct ValidationGuard<'a>(&'a AtomicBool);

impl Drop for ValidationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ProxyPool {
    /// Create an empty pool whose ready queue holds at most `capacity` proxies.
    pub fn new(capacity: usize) -> Self {
        Self {
            ready: Mutex::new(ReadyQueue::new(capacity.max(1))),
            failed: Mutex::new(HashSet::new()),
            raw: RwLock::new(Arc::new(HashSet::new())),
            last_fetch: Mutex::new(None),
            validating: AtomicBool::new(false),
            refill: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ready.lock().capacity
    }

    pub fn ready_len(&self) -> usize {
        self.ready.lock().entries.len()
    }

    /// Current ready queue in rotation order.
    pub fn ready_snapshot(&self) -> Vec<ProxyAddress> {
        self.ready.lock().entries.iter().cloned().collect()
    }

    pub fn is_failed(&self, addr: &ProxyAddress) -> bool {
        self.failed.lock().contains(addr)
    }

    /// Rotate the head proxy to the tail and return it.
    ///
    /// Returns `None` on an empty pool; callers should `request_refill` rather than wait.
    pub fn take(&self) -> Option<ProxyAddress> {
        self.ready.lock().rotate(1).pop()
    }

    /// Rotate up to `n` distinct proxies, returning them in rotation order.
    pub fn take_n(&self, n: usize) -> Vec<ProxyAddress> {
        self.ready.lock().rotate(n)
    }

    /// Remove `addr` from the ready queue if present. Idempotent.
    pub fn evict(&self, addr: &ProxyAddress) -> bool {
        self.ready.lock().remove(addr)
    }

    /// Evict `addr` and remember it as failed until the next raw-list refresh.
    pub fn mark_failed(&self, addr: &ProxyAddress) {
        // lock order: ready, then failed
        let mut ready = self.ready.lock();
        let mut failed = self.failed.lock();
        ready.remove(addr);
        failed.insert(addr.clone());
    }

    /// Offer a validated proxy to the ready queue.
    pub fn push_ready(&self, addr: ProxyAddress) -> PushOutcome {
        let mut ready = self.ready.lock();
        let mut failed = self.failed.lock();
        let outcome = ready.push(addr.clone());
        if outcome == PushOutcome::Added {
            failed.remove(&addr);
        }
        outcome
    }

    /// Replace the raw candidate set wholesale and clear the failed set.
    ///
    /// An empty set is a no-op: the pool keeps its previous state. Returns whether
    /// the candidates were replaced.
    pub fn replace_candidates(&self, candidates: HashSet<ProxyAddress>) -> bool {
        if candidates.is_empty() {
            return false;
        }
        *self.raw.write() = Arc::new(candidates);
        self.failed.lock().clear();
        *self.last_fetch.lock() = Some(Instant::now());
        true
    }

    /// Time of the last successful raw-list fetch.
    pub fn last_fetch(&self) -> Option<Instant> {
        *self.last_fetch.lock()
    }

    /// Ask the maintainer to run a cycle early. Never blocks.
    pub fn request_refill(&self) {
        self.refill.notify_one();
    }

    /// Resolves once someone called `request_refill`.
    pub async fn refill_requested(&self) {
        self.refill.notified().await;
    }

    pub fn is_validating(&self) -> bool {
        self.validating.load(Ordering::Acquire)
    }

    /// Pick up to `n` random candidates that are neither ready nor failed.
    ///
    /// When no untried candidate is left the failed set is reset and the
    /// previously failed candidates become eligible again.
    fn sample_untried(&self, n: usize) -> (Vec<ProxyAddress>, bool) {
        let raw = Arc::clone(&*self.raw.read());
        let ready = self.ready.lock();
        let mut failed = self.failed.lock();

        let mut rng = rand::rng();
        let sample = raw
            .iter()
            .filter(|a| !ready.contains(a) && !failed.contains(*a))
            .cloned()
            .choose_multiple(&mut rng, n);
        if !sample.is_empty() || failed.is_empty() {
            return (sample, false);
        }

        failed.clear();
        let sample = raw
            .iter()
            .filter(|a| !ready.contains(a))
            .cloned()
            .choose_multiple(&mut rng, n);
        (sample, true)
    }

    /// Validate up to `batch_size` untried candidates and move them into the
    /// ready or failed set.
    ///
    /// At most one batch runs at a time; a concurrent call returns `None`
    /// immediately.
    pub async fn validate_batch(
        &self,
        validator: &dyn ProxyValidator,
        batch_size: usize,
        concurrency: usize,
    ) -> Option<BatchReport> {
        if self
            .validating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Validation batch already running, skipping");
            return None;
        }
        let _guard = ValidationGuard(&self.validating);

        let mut report = BatchReport::default();
        let free_slots = {
            let ready = self.ready.lock();
            ready.capacity.saturating_sub(ready.entries.len())
        };
        if free_slots == 0 {
            return Some(report);
        }

        let (sample, failed_reset) = self.sample_untried(batch_size);
        report.sampled = sample.len();
        report.failed_reset = failed_reset;
        if failed_reset {
            info!("All candidates tried, giving previously failed proxies another chance");
        }
        if sample.is_empty() {
            return Some(report);
        }
        info!("Validating {} candidate proxies", sample.len());

        let mut results = stream::iter(sample)
            .map(move |addr| async move {
                let ok = validator.validate(&addr).await;
                (addr, ok)
            })
            .buffer_unordered(concurrency.max(1));

        while let Some((addr, ok)) = results.next().await {
            if ok {
                match self.push_ready(addr) {
                    PushOutcome::Added | PushOutcome::AlreadyReady => report.accepted += 1,
                    PushOutcome::Full => break,
                }
                if self.ready.lock().is_full() {
                    break;
                }
            } else {
                self.mark_failed(&addr);
                report.rejected += 1;
            }
        }

        info!(
            "Validation batch completed: {} accepted, {} rejected, {} ready",
            report.accepted,
            report.rejected,
            self.ready_len()
        );
        Some(report)
    }

    /// Snapshot of pool sizes. Each field is read under its own short lock.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            ready: self.ready_len(),
            raw: self.raw.read().len(),
            failed: self.failed.lock().len(),
            secs_since_fetch: self.last_fetch().map(|t| t.elapsed().as_secs()),
            validating: self.is_validating(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    fn addr(s: &str) -> ProxyAddress {
        s.parse().unwrap()
    }

    fn addrs(list: &[&str]) -> Vec<ProxyAddress> {
        list.iter().map(|s| addr(s)).collect()
    }

    fn candidates(n: usize) -> HashSet<ProxyAddress> {
        (1..=n).map(|i| addr(&format!("10.0.0.{}:8080", i))).collect()
    }

    fn assert_disjoint(pool: &ProxyPool) {
        for a in pool.ready_snapshot() {
            assert!(!pool.is_failed(&a), "{} is both ready and failed", a);
        }
    }

    /// Accepts addresses whose last octet is even.
    struct EvenValidator {
        calls: AtomicUsize,
    }

    impl EvenValidator {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl ProxyValidator for EvenValidator {
        async fn validate(&self, address: &ProxyAddress) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let host = address.as_str().split(':').next().unwrap();
            let last: u32 = host.rsplit('.').next().unwrap().parse().unwrap();
            last % 2 == 0
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl ProxyValidator for AcceptAll {
        async fn validate(&self, _address: &ProxyAddress) -> bool {
            true
        }
    }

    #[test]
    fn take_n_rotates_in_call_order() {
        let pool = ProxyPool::new(5);
        for a in addrs(&["1.1.1.1:80", "2.2.2.2:80", "3.3.3.3:80"]) {
            pool.push_ready(a);
        }

        assert_eq!(pool.take_n(2), addrs(&["1.1.1.1:80", "2.2.2.2:80"]));
        assert_eq!(pool.ready_snapshot(), addrs(&["3.3.3.3:80", "1.1.1.1:80", "2.2.2.2:80"]));
    }

    #[test]
    fn take_n_never_exceeds_pool_size_or_repeats() {
        let pool = ProxyPool::new(5);
        pool.push_ready(addr("1.1.1.1:80"));
        pool.push_ready(addr("2.2.2.2:80"));

        let taken = pool.take_n(10);
        assert_eq!(taken.len(), 2);
        assert_ne!(taken[0], taken[1]);
        assert!(pool.take_n(0).is_empty());
    }

    #[test]
    fn take_on_empty_pool_returns_none() {
        let pool = ProxyPool::new(3);
        assert_eq!(pool.take(), None);
        pool.push_ready(addr("1.1.1.1:80"));
        pool.push_ready(addr("2.2.2.2:80"));
        assert_eq!(pool.take(), Some(addr("1.1.1.1:80")));
        assert_eq!(pool.take(), Some(addr("2.2.2.2:80")));
        assert_eq!(pool.take(), Some(addr("1.1.1.1:80")));
    }

    #[test]
    fn ready_queue_respects_capacity_and_dedups() {
        let pool = ProxyPool::new(3);
        let mut outcomes = Vec::new();
        for i in 0..10 {
            outcomes.push(pool.push_ready(addr(&format!("10.0.0.{}:80", i))));
            assert!(pool.ready_len() <= 3);
        }
        assert_eq!(outcomes.iter().filter(|o| **o == PushOutcome::Added).count(), 3);
        assert_eq!(pool.push_ready(addr("10.0.0.0:80")), PushOutcome::AlreadyReady);
    }

    #[test]
    fn evict_is_idempotent() {
        let pool = ProxyPool::new(5);
        for a in addrs(&["1.1.1.1:80", "2.2.2.2:80", "3.3.3.3:80"]) {
            pool.push_ready(a);
        }

        assert!(pool.evict(&addr("2.2.2.2:80")));
        let once = pool.ready_snapshot();
        assert!(!pool.evict(&addr("2.2.2.2:80")));
        assert_eq!(pool.ready_snapshot(), once);
        assert_eq!(once, addrs(&["1.1.1.1:80", "3.3.3.3:80"]));
    }

    #[test]
    fn ready_and_failed_stay_disjoint() {
        let pool = ProxyPool::new(5);
        let a = addr("1.1.1.1:80");

        pool.push_ready(a.clone());
        assert_disjoint(&pool);
        pool.mark_failed(&a);
        assert_disjoint(&pool);
        assert!(pool.is_failed(&a));
        pool.push_ready(a.clone());
        assert_disjoint(&pool);
        assert!(!pool.is_failed(&a));
    }

    #[test]
    fn empty_refresh_is_a_noop() {
        let pool = ProxyPool::new(5);
        assert!(pool.replace_candidates(candidates(4)));
        pool.mark_failed(&addr("10.0.0.1:8080"));
        let fetched_at = pool.last_fetch();

        assert!(!pool.replace_candidates(HashSet::new()));

        let stats = pool.stats();
        assert_eq!(stats.raw, 4);
        assert_eq!(stats.failed, 1);
        assert_eq!(pool.last_fetch(), fetched_at);
    }

    #[test]
    fn refresh_replaces_candidates_and_clears_failed() {
        let pool = ProxyPool::new(5);
        pool.replace_candidates(candidates(4));
        pool.mark_failed(&addr("10.0.0.1:8080"));

        assert!(pool.replace_candidates(candidates(2)));
        let stats = pool.stats();
        assert_eq!(stats.raw, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.secs_since_fetch, Some(0));
    }

    #[tokio::test]
    async fn batch_routes_results_to_ready_and_failed() {
        let pool = ProxyPool::new(30);
        pool.replace_candidates(candidates(10));
        let validator = EvenValidator::new();

        let report = pool.validate_batch(&validator, 30, 4).await.unwrap();

        assert_eq!(report.sampled, 10);
        assert_eq!(report.accepted, 5);
        assert_eq!(report.rejected, 5);
        assert_eq!(pool.stats().failed, 5);
        assert_eq!(pool.ready_len(), 5);
        assert_disjoint(&pool);
        assert!(!pool.is_validating());
    }

    #[tokio::test]
    async fn batch_attempts_only_remaining_untried_candidates() {
        let pool = ProxyPool::new(30);
        pool.replace_candidates(candidates(5));
        let validator = EvenValidator::new();

        let report = pool.validate_batch(&validator, 30, 1).await.unwrap();

        assert_eq!(report.sampled, 5);
        assert_eq!(validator.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn batch_resets_failed_set_once_untried_pool_is_exhausted() {
        let pool = ProxyPool::new(30);
        pool.replace_candidates(candidates(4));
        let validator = EvenValidator::new();

        pool.validate_batch(&validator, 30, 2).await.unwrap();
        assert_eq!(pool.stats().failed, 2);

        // only the two odd (failed) candidates are left
        let report = pool.validate_batch(&validator, 30, 2).await.unwrap();
        assert!(report.failed_reset);
        assert_eq!(report.sampled, 2);
        assert_eq!(report.rejected, 2);
        assert_eq!(pool.ready_len(), 2);
        assert_disjoint(&pool);
    }

    #[tokio::test]
    async fn batch_stops_once_ready_queue_is_full() {
        let pool = ProxyPool::new(3);
        pool.replace_candidates(candidates(20));

        let report = pool.validate_batch(&AcceptAll, 20, 1).await.unwrap();

        assert_eq!(report.accepted, 3);
        assert_eq!(pool.ready_len(), 3);

        let report = pool.validate_batch(&AcceptAll, 20, 1).await.unwrap();
        assert_eq!(report.sampled, 0);
    }

    #[tokio::test]
    async fn only_one_batch_runs_at_a_time() {
        struct Gated(Arc<Semaphore>);

        #[async_trait]
        impl ProxyValidator for Gated {
            async fn validate(&self, _address: &ProxyAddress) -> bool {
                self.0.acquire().await.unwrap().forget();
                true
            }
        }

        let pool = Arc::new(ProxyPool::new(5));
        pool.replace_candidates(candidates(2));
        let gate = Arc::new(Semaphore::new(0));

        let running = {
            let pool = Arc::clone(&pool);
            let validator = Gated(Arc::clone(&gate));
            tokio::spawn(async move { pool.validate_batch(&validator, 2, 1).await })
        };
        while !pool.is_validating() {
            tokio::task::yield_now().await;
        }

        assert!(pool.validate_batch(&AcceptAll, 2, 1).await.is_none());
        // rotation is not blocked by the running batch
        assert_eq!(pool.take(), None);

        gate.add_permits(2);
        let report = running.await.unwrap().unwrap();
        assert_eq!(report.accepted, 2);
        assert!(!pool.is_validating());
    }
}
