//! Convenient re-exports for common Tollgate types.
pub use crate::{
    backend::{Backend, LocalBackend},
    classify::{IdentityExtractor, ScopeRules},
    config::{AdmissionConfig, FailurePolicy},
    error::{ConfigError, LimiterError},
    limiter::{Decision, RateLimiter},
    middleware::AdmissionLayer,
    policy::{PolicyEntry, PolicyRegistry},
    remote::RemoteBackend,
    violation::{LogSink, ViolationRecord, ViolationSink},
};
