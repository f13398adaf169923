//! Shared-store backend.
//!
//! Reading bucket fields, computing in the caller and writing them back takes two round
//! trips, and two callers that interleave between them both spend the same token. So
//! the whole refill-and-take runs inside the store as one [`BucketScript`], submitted
//! through [`AtomicBucketStore`]. The backend keeps no bucket state of its own.
//!
//! Stores:
//! - [`RedisStore`] (feature `redis-store`): a Lua script run with `EVALSHA`.
//! - [`SharedMemoryStore`]: an in-process store with the same atomic contract, for tests
//!   and single-host setups that still want several limiter instances to share quota.

use crate::backend::Backend;
use crate::bucket::{BucketOutcome, BucketState};
use crate::clock::{Clock, SystemClock};
use crate::error::LimiterError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default bound on one store round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

/// Everything the store needs to run one bucket operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketScript {
    /// Fully prefixed store key.
    pub key: String,
    pub capacity: u32,
    pub window: Duration,
    /// Caller's clock reading (ms since the Unix epoch for fleet-wide stores).
    pub now_ms: u64,
    /// Expiry to set on the key after the write.
    pub ttl: Duration,
}

impl BucketScript {
    /// Idle keys expire after two windows; by then the bucket is full again.
    pub fn ttl_for(window: Duration) -> Duration {
        let secs = window.as_secs() + u64::from(window.subsec_nanos() > 0);
        Duration::from_secs(secs.saturating_mul(2).max(1))
    }
}

/// A store that can run one bucket operation indivisibly.
///
/// Implementations must read, compute and write without letting any other client's
/// operation on the same key run in between.
#[async_trait]
pub trait AtomicBucketStore: Send + Sync + std::fmt::Debug {
    /// Run the operation. Exactly one round trip; errors mean no decision.
    async fn eval_bucket(&self, script: &BucketScript) -> Result<BucketOutcome, LimiterError>;
}

#[async_trait]
impl<S> AtomicBucketStore for Arc<S>
where
    S: AtomicBucketStore + ?Sized,
{
    async fn eval_bucket(&self, script: &BucketScript) -> Result<BucketOutcome, LimiterError> {
        (**self).eval_bucket(script).await
    }
}

/// Backend that delegates every decision to an [`AtomicBucketStore`].
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    store: Arc<dyn AtomicBucketStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    key_prefix: Option<String>,
}

impl RemoteBackend {
    /// Wall clock, [`DEFAULT_TIMEOUT`], no key prefix.
    pub fn new<S: AtomicBucketStore + 'static>(store: S) -> Self {
        Self {
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
            timeout: DEFAULT_TIMEOUT,
            key_prefix: None,
        }
    }

    /// Bound each round trip. A zero bound is raised to one millisecond.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    /// Namespace store keys as `<prefix>:<key>`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.key_prefix = if prefix.is_empty() { None } else { Some(prefix) };
        self
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Configured round-trip bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn store_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_owned(),
        }
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn take(
        &self,
        key: &str,
        capacity: u32,
        window: Duration,
    ) -> Result<BucketOutcome, LimiterError> {
        let script = BucketScript {
            key: self.store_key(key),
            capacity,
            window,
            now_ms: self.clock.now_millis(),
            ttl: BucketScript::ttl_for(window),
        };
        match tokio::time::timeout(self.timeout, self.store.eval_bucket(&script)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => {
                tracing::warn!(target: "tollgate::remote", key = %script.key, error = %err, "bucket script failed");
                Err(err)
            }
            Err(_) => {
                tracing::warn!(target: "tollgate::remote", key = %script.key, timeout = ?self.timeout, "bucket script timed out");
                Err(LimiterError::Timeout { timeout: self.timeout })
            }
        }
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at_ms: u64,
}

/// Expired entries are purged at most this often, measured on the script clock.
const PURGE_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Default)]
struct StoreData {
    buckets: HashMap<String, StoredBucket>,
    next_purge_ms: u64,
}

impl StoreData {
    fn purge(&mut self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, stored| stored.expires_at_ms > now_ms);
        self.next_purge_ms = now_ms.saturating_add(PURGE_INTERVAL_MS);
        before - self.buckets.len()
    }
}

/// In-process [`AtomicBucketStore`].
///
/// Clones share the same data, so several [`RemoteBackend`]s built over clones of one
/// store behave like several processes sharing one Redis. Expiry follows the script's
/// clock reading: an expired key reads as absent, and expired keys are dropped from the
/// map at most once per second of script time.
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryStore {
    data: Arc<Mutex<StoreData>>,
}

impl SharedMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stored keys, sorted. May include expired keys not yet purged.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().buckets.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop every key whose TTL has passed at `now_ms`. Returns how many were dropped.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        self.lock().purge(now_ms)
    }
}

#[async_trait]
impl AtomicBucketStore for SharedMemoryStore {
    async fn eval_bucket(&self, script: &BucketScript) -> Result<BucketOutcome, LimiterError> {
        let mut guard = self.lock();
        if script.now_ms >= guard.next_purge_ms {
            let purged = guard.purge(script.now_ms);
            if purged > 0 {
                tracing::debug!(target: "tollgate::remote", purged, remaining = guard.buckets.len(), "purged expired buckets");
            }
        }
        let live = guard
            .buckets
            .get(&script.key)
            .filter(|stored| stored.expires_at_ms > script.now_ms)
            .map(|stored| stored.state);
        let mut state = live
            .unwrap_or_else(|| BucketState::full(script.capacity, script.window, script.now_ms));
        let outcome = state.take(script.capacity, script.window, script.now_ms);
        let ttl_ms = u64::try_from(script.ttl.as_millis()).unwrap_or(u64::MAX);
        guard.buckets.insert(
            script.key.clone(),
            StoredBucket { state, expires_at_ms: script.now_ms.saturating_add(ttl_ms) },
        );
        Ok(outcome)
    }
}

#[cfg(feature = "redis-store")]
pub use redis_store::{RedisStore, TOKEN_BUCKET_LUA};

#[cfg(feature = "redis-store")]
mod redis_store {
    use super::{AtomicBucketStore, BucketScript};
    use crate::bucket::BucketOutcome;
    use crate::error::LimiterError;
    use async_trait::async_trait;

    /// Server-side port of [`crate::bucket::take_token`].
    ///
    /// `KEYS[1]` bucket hash; `ARGV` = capacity, window (ms), now (ms), ttl (s).
    /// Returns `{allowed, tokens}` with tokens as a string so fractions survive the
    /// integer reply conversion.
    pub const TOKEN_BUCKET_LUA: &str = r#"
local capacity = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local fields = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill_ms')
local tokens = tonumber(fields[1])
local last = tonumber(fields[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end

local elapsed = now - last
if elapsed < 0 then
  elapsed = 0
end
if window_ms <= 0 then
  tokens = capacity
else
  tokens = math.min(capacity, tokens + (elapsed / window_ms) * capacity)
end
if tokens < 0 then
  tokens = 0
end

local allowed = 0
if tokens >= 1 then
  allowed = 1
  tokens = tokens - 1
end
if now > last then
  last = now
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill_ms', tostring(last))
redis.call('EXPIRE', KEYS[1], ttl)
return {allowed, tostring(tokens)}
"#;

    /// Redis-backed [`AtomicBucketStore`].
    ///
    /// Uses a [`redis::aio::ConnectionManager`], which reconnects on its own; calls
    /// made while it is disconnected fail with [`LimiterError::BackendUnavailable`].
    #[derive(Clone)]
    pub struct RedisStore {
        conn: redis::aio::ConnectionManager,
        script: redis::Script,
    }

    impl std::fmt::Debug for RedisStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisStore").field("script", &self.script.get_hash()).finish()
        }
    }

    impl RedisStore {
        /// Open a managed connection to `address` (e.g. `redis://127.0.0.1/`).
        pub async fn connect(address: &str) -> Result<Self, redis::RedisError> {
            let client = redis::Client::open(address)?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            Ok(Self { conn, script: redis::Script::new(TOKEN_BUCKET_LUA) })
        }
    }

    #[async_trait]
    impl AtomicBucketStore for RedisStore {
        async fn eval_bucket(&self, script: &BucketScript) -> Result<BucketOutcome, LimiterError> {
            let mut conn = self.conn.clone();
            let window_ms = u64::try_from(script.window.as_millis()).unwrap_or(u64::MAX);
            let (allowed, tokens): (i64, String) = self
                .script
                .key(&script.key)
                .arg(script.capacity)
                .arg(window_ms)
                .arg(script.now_ms)
                .arg(script.ttl.as_secs())
                .invoke_async(&mut conn)
                .await
                .map_err(LimiterError::unavailable)?;
            let tokens: f64 = tokens.parse().map_err(|_| {
                LimiterError::unavailable(format!("unexpected token count {tokens:?} from script"))
            })?;
            Ok(BucketOutcome { allowed: allowed == 1, tokens, refilled_at: script.now_ms })
        }
    }
}
