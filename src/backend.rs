//! Bucket backends.
//!
//! A [`Backend`] owns bucket state and applies [`crate::bucket::take_token`] to it
//! atomically per key. Two implementations exist:
//! - [`LocalBackend`]: one mutex-guarded map per process; cannot fail.
//! - [`crate::remote::RemoteBackend`]: one server-side script per call against a shared
//!   store; fails with [`LimiterError`] when the store is unreachable.

use crate::bucket::{BucketOutcome, BucketState};
use crate::clock::{Clock, MonotonicClock};
use crate::error::LimiterError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// Storage and atomicity for bucket state.
///
/// For a single key, implementations must make every `take` consistent with some serial
/// order of the calls: two callers may never both act on the same pre-decrement count.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Refill the bucket at `key` and try to take one token from it.
    ///
    /// Unknown keys start full. `Ok` carries the decision; `Err` means no decision was
    /// reached and must not be read as either "allowed" or "denied".
    async fn take(
        &self,
        key: &str,
        capacity: u32,
        window: Duration,
    ) -> Result<BucketOutcome, LimiterError>;

    /// Short label for logs.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<B> Backend for Arc<B>
where
    B: Backend + ?Sized,
{
    async fn take(
        &self,
        key: &str,
        capacity: u32,
        window: Duration,
    ) -> Result<BucketOutcome, LimiterError> {
        (**self).take(key, capacity, window).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// In-process bucket map behind one mutex.
///
/// Clones share the same map. The lock is held only for a hash lookup and
/// [`BucketState::take`], so a single lock is enough.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    buckets: Arc<Mutex<HashMap<String, BucketState>>>,
    clock: Arc<dyn Clock>,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::default())
    }

    /// Use a specific clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { buckets: Arc::new(Mutex::new(HashMap::new())), clock: Arc::new(clock) }
    }

    // A panic while holding the lock cannot leave a half-written BucketState behind:
    // `take` computes the outcome before assigning any field.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, BucketState>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Synchronous admission attempt; the async [`Backend::take`] delegates here.
    pub fn take_now(&self, key: &str, capacity: u32, window: Duration) -> BucketOutcome {
        let now = self.clock.now_millis();
        let mut buckets = self.lock();
        match buckets.get_mut(key) {
            Some(state) => state.take(capacity, window, now),
            None => {
                let mut state = BucketState::full(capacity, window, now);
                let outcome = state.take(capacity, window, now);
                buckets.insert(key.to_owned(), state);
                outcome
            }
        }
    }

    /// Number of buckets currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no bucket is held.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every bucket that has refilled to capacity. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|_, state| !state.is_replenished(now));
        let swept = before - buckets.len();
        if swept > 0 {
            tracing::debug!(target: "tollgate::local", swept, remaining = buckets.len(), "swept idle buckets");
        }
        swept
    }

    /// Run [`sweep`](Self::sweep) every `interval` on the current tokio runtime.
    ///
    /// The task holds a weak reference and exits once every clone of this backend has
    /// been dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let buckets: Weak<Mutex<HashMap<String, BucketState>>> = Arc::downgrade(&self.buckets);
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(buckets) = buckets.upgrade() else {
                    break;
                };
                LocalBackend { buckets, clock: clock.clone() }.sweep();
            }
        })
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn take(
        &self,
        key: &str,
        capacity: u32,
        window: Duration,
    ) -> Result<BucketOutcome, LimiterError> {
        Ok(self.take_now(key, capacity, window))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn first_request_seeds_full_bucket() {
        let backend = LocalBackend::with_clock(ManualClock::default());
        let out = backend.take_now("api:ip:1.2.3.4", 100, MINUTE);
        assert!(out.allowed);
        assert_eq!(out.remaining(), 99);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn keys_are_independent() {
        let backend = LocalBackend::with_clock(ManualClock::default());
        assert!(backend.take_now("a", 1, MINUTE).allowed);
        assert!(!backend.take_now("a", 1, MINUTE).allowed);
        assert!(backend.take_now("b", 1, MINUTE).allowed);
    }

    #[test]
    fn refills_after_window() {
        let clock = ManualClock::default();
        let backend = LocalBackend::with_clock(clock.clone());
        for _ in 0..10 {
            assert!(backend.take_now("k", 10, MINUTE).allowed);
        }
        assert!(!backend.take_now("k", 10, MINUTE).allowed);

        clock.advance(MINUTE);
        let admitted = (0..15).filter(|_| backend.take_now("k", 10, MINUTE).allowed).count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn sweep_drops_only_replenished_buckets() {
        let clock = ManualClock::default();
        let backend = LocalBackend::with_clock(clock.clone());
        backend.take_now("drained", 1, MINUTE);
        clock.advance(Duration::from_secs(30));
        backend.take_now("fresh", 1, MINUTE);

        clock.advance(Duration::from_secs(30));
        assert_eq!(backend.sweep(), 1);
        assert_eq!(backend.len(), 1);

        // a swept key behaves exactly like a replenished one
        assert!(backend.take_now("drained", 1, MINUTE).allowed);
    }

    #[test]
    fn clones_share_buckets() {
        let backend = LocalBackend::with_clock(ManualClock::default());
        let other = backend.clone();
        assert!(backend.take_now("k", 1, MINUTE).allowed);
        assert!(!other.take_now("k", 1, MINUTE).allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_overspend() {
        let backend = LocalBackend::with_clock(ManualClock::default());
        let capacity = 25;
        let barrier = Arc::new(tokio::sync::Barrier::new(100));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let backend = backend.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                backend.take("shared", capacity, MINUTE).await.unwrap().allowed
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, capacity as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_and_stops_with_backend() {
        let clock = ManualClock::default();
        let backend = LocalBackend::with_clock(clock.clone());
        backend.take_now("k", 1, MINUTE);
        let handle = backend.spawn_sweeper(Duration::from_secs(10));

        clock.advance(MINUTE);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(backend.is_empty());

        drop(backend);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(handle.is_finished());
    }
}
