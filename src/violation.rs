//! Violation records and the sinks that receive them.
//!
//! Every denial produces a [`ViolationRecord`]. Storage and querying belong to whoever
//! implements the sink; the middleware only hands records over and never waits on, or
//! fails because of, a sink.
//!
//! A sink is a `tower::Service<ViolationRecord>` so sinks compose with ordinary tower
//! combinators:
//!
//! ```rust
//! use tollgate::violation::{ViolationRecord, ViolationSink};
//! use tower::Service;
//! use futures::future::BoxFuture;
//! use std::task::{Context, Poll};
//!
//! #[derive(Clone)]
//! struct StderrSink;
//!
//! impl Service<ViolationRecord> for StderrSink {
//!     type Response = ();
//!     type Error = std::convert::Infallible;
//!     type Future = BoxFuture<'static, Result<(), Self::Error>>;
//!
//!     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
//!         Poll::Ready(Ok(()))
//!     }
//!
//!     fn call(&mut self, record: ViolationRecord) -> Self::Future {
//!         eprintln!("{record}");
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//!
//! impl ViolationSink for StderrSink {
//!     type SinkError = std::convert::Infallible;
//! }
//! ```

use futures::future::BoxFuture;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tower::Service;

/// One denied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationRecord {
    pub scope: String,
    pub identifier: String,
    pub path: String,
    pub method: String,
    pub timestamp: SystemTime,
}

impl ViolationRecord {
    /// Record stamped with the current wall time.
    pub fn now(
        scope: impl Into<String>,
        identifier: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            identifier: identifier.into(),
            path: path.into(),
            method: method.into(),
            timestamp: SystemTime::now(),
        }
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> u128 {
        self.timestamp.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
    }
}

impl fmt::Display for ViolationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rate limit exceeded: {} from {} ({} {})",
            self.scope, self.identifier, self.method, self.path
        )
    }
}

/// A service that consumes violation records.
pub trait ViolationSink:
    Service<ViolationRecord, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `record` if the sink becomes ready; drop it on any error.
pub async fn emit_best_effort<S>(sink: S, record: ViolationRecord)
where
    S: Service<ViolationRecord, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    match sink.ready_oneshot().await {
        Ok(mut ready) => {
            if let Err(err) = ready.call(record).await {
                tracing::debug!(target: "tollgate::violation", error = %err, "violation sink failed; record dropped");
            }
        }
        Err(err) => {
            tracing::debug!(target: "tollgate::violation", error = %err, "violation sink not ready; record dropped");
        }
    }
}

type SinkFuture<E> = BoxFuture<'static, Result<(), E>>;

/// Discards every record.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<ViolationRecord> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _record: ViolationRecord) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl ViolationSink for NullSink {
    type SinkError = Infallible;
}

/// Logs each record through `tracing` at WARN with structured fields.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<ViolationRecord> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: ViolationRecord) -> Self::Future {
        tracing::warn!(
            target: "tollgate::violation",
            scope = %record.scope,
            identifier = %record.identifier,
            path = %record.path,
            method = %record.method,
            "security.rate_limit_violation"
        );
        Box::pin(async { Ok(()) })
    }
}

impl ViolationSink for LogSink {
    type SinkError = Infallible;
}

/// Keeps records in memory, evicting the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ViolationRecord>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Vec<ViolationRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of stored records, oldest first.
    pub fn records(&self) -> Vec<ViolationRecord> {
        self.guard().clone()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Records dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<ViolationRecord> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: ViolationRecord) -> Self::Future {
        let mut guard = self.guard();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(record);
        Box::pin(async { Ok(()) })
    }
}

impl ViolationSink for MemorySink {
    type SinkError = Infallible;
}

/// Hands records to a background task over a bounded channel.
///
/// `call` never waits: when the channel is full the record is counted in
/// [`dropped`](Self::dropped) and discarded. Must be created inside a tokio runtime.
#[derive(Clone, Debug)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<ViolationRecord>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingSink {
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: Service<ViolationRecord, Response = ()> + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            use tower::ServiceExt;
            let mut sink = sink;
            while let Some(record) = rx.recv().await {
                match sink.ready().await {
                    Ok(ready) => {
                        if let Err(err) = ready.call(record).await {
                            tracing::debug!(target: "tollgate::violation", error = %err, "downstream sink failed");
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target: "tollgate::violation", error = %err, "downstream sink not ready");
                    }
                }
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Records discarded because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<ViolationRecord> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: ViolationRecord) -> Self::Future {
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl ViolationSink for NonBlockingSink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(n: usize) -> ViolationRecord {
        ViolationRecord::now("auth", format!("ip:10.0.0.{n}"), "/auth/login", "POST")
    }

    #[derive(Clone, Debug)]
    struct FailingSink;

    #[derive(Debug)]
    struct SinkDown;

    impl fmt::Display for SinkDown {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "sink down")
        }
    }

    impl std::error::Error for SinkDown {}

    impl Service<ViolationRecord> for FailingSink {
        type Response = ();
        type Error = SinkDown;
        type Future = SinkFuture<SinkDown>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _record: ViolationRecord) -> Self::Future {
            Box::pin(async { Err(SinkDown) })
        }
    }

    #[test]
    fn display_mentions_scope_and_identifier() {
        let msg = record(1).to_string();
        assert!(msg.contains("auth"));
        assert!(msg.contains("ip:10.0.0.1"));
        assert!(msg.contains("POST /auth/login"));
    }

    #[tokio::test]
    async fn memory_sink_is_bounded() {
        let mut sink = MemorySink::with_capacity(2);
        for n in 0..3 {
            sink.call(record(n)).await.unwrap();
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.records()[0].identifier, "ip:10.0.0.1");
    }

    #[tokio::test]
    async fn best_effort_swallows_sink_errors() {
        emit_best_effort(FailingSink, record(1)).await;
        emit_best_effort(NullSink, record(2)).await;
        emit_best_effort(LogSink, record(3)).await;
    }

    #[tokio::test]
    async fn non_blocking_sink_forwards_in_background() {
        let memory = MemorySink::new();
        let mut sink = NonBlockingSink::with_capacity(memory.clone(), 8);
        sink.call(record(1)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while memory.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("record forwarded");
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn timestamp_is_after_epoch() {
        assert!(record(1).timestamp_millis() > 0);
    }
}
