#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Scoped token-bucket admission control for tower services.
//!
//! ## Features
//!
//! - **Continuous-refill token buckets**, one per `<scope>:<identifier>` key
//! - **Local backend** for single-process deployments
//! - **Remote backend** that runs the whole read-modify-write as one atomic script in a
//!   shared store, so every instance sees the same buckets
//! - **Named policies** (`"10/min"`) with a guaranteed default scope and whole-registry reloads
//! - **HTTP middleware** returning `429` with `Retry-After`, plus violation sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{PolicyRegistry, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::local(PolicyRegistry::standard());
//!     let check = limiter.check_scope("auth", "ip:203.0.113.9").await.unwrap();
//!     assert!(check.decision.is_allowed());
//! }
//! ```
//!
//! As middleware:
//!
//! ```rust
//! use tollgate::{AdmissionConfig, LogSink};
//! use tower::ServiceBuilder;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), tollgate::ConfigError> {
//! let config = AdmissionConfig::from_json_str(r#"{ "limits": { "global": "500/min" } }"#)?;
//! let layer = config.build_layer(LogSink).await?;
//! let _svc = ServiceBuilder::new().layer(layer).service(tower::service_fn(
//!     |_req: http::Request<String>| async { Ok::<_, std::convert::Infallible>(http::Response::new(String::new())) },
//! ));
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod bucket;
pub mod classify;
pub mod clock;
pub mod config;
pub mod dynamic;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod policy;
pub mod prelude;
pub mod remote;
pub mod violation;

// Re-exports
pub use backend::{Backend, LocalBackend};
pub use bucket::{take_token, BucketOutcome, BucketState};
pub use classify::{IdentityExtractor, ScopeRule, ScopeRules};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{AdmissionConfig, BackendConfig, FailurePolicy};
pub use dynamic::DynamicConfig;
pub use error::{ConfigError, LimiterError};
pub use limiter::{scoped_key, Decision, RateLimiter, ScopeCheck};
pub use middleware::{AdmissionLayer, AdmissionService, X_RATELIMIT_REMAINING};
pub use policy::{PolicyEntry, PolicyRegistry, DEFAULT_SCOPE};
#[cfg(feature = "redis-store")]
pub use remote::RedisStore;
pub use remote::{AtomicBucketStore, BucketScript, RemoteBackend, SharedMemoryStore};
pub use violation::{
    emit_best_effort, LogSink, MemorySink, NonBlockingSink, NullSink, ViolationRecord,
    ViolationSink,
};
