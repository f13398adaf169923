//! The limiter facade.
//!
//! [`RateLimiter`] pairs exactly one [`Backend`] with a [`PolicyRegistry`]. The backend
//! is chosen once at construction; if it fails at request time the error is returned
//! as-is and no other backend is tried.

use crate::backend::{Backend, LocalBackend};
use crate::dynamic::DynamicConfig;
use crate::error::LimiterError;
use crate::policy::{PolicyEntry, PolicyRegistry};
use std::sync::Arc;
use std::time::Duration;

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Whole tokens left after this request.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u64,
    },
    /// The bucket is empty.
    Denied {
        /// How long the caller should wait before retrying (the policy window).
        /// Useful for `Retry-After` headers.
        retry_after: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Outcome of [`RateLimiter::check_scope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeCheck {
    /// Bucket key that was charged (`<scope>:<identifier>`).
    pub key: String,
    /// Policy applied; its `scope` is the default scope when the requested one has no
    /// entry of its own.
    pub policy: PolicyEntry,
    pub decision: Decision,
}

/// Bucket key for an identifier within a scope.
pub fn scoped_key(scope: &str, identifier: &str) -> String {
    format!("{scope}:{identifier}")
}

/// Admission facade: one backend, one reloadable policy registry.
///
/// Cheap to clone; clones share the backend and the registry.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    backend: Arc<dyn Backend>,
    policies: DynamicConfig<PolicyRegistry>,
}

impl RateLimiter {
    pub fn new<B: Backend + 'static>(backend: B, policies: PolicyRegistry) -> Self {
        Self { backend: Arc::new(backend), policies: DynamicConfig::new(policies) }
    }

    /// In-process limiter with a fresh [`LocalBackend`].
    pub fn local(policies: PolicyRegistry) -> Self {
        Self::new(LocalBackend::new(), policies)
    }

    /// Label of the configured backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Snapshot of the active registry.
    pub fn policies(&self) -> Arc<PolicyRegistry> {
        self.policies.get()
    }

    /// Replace the registry as a whole. Checks already in flight finish with the
    /// snapshot they started with. Existing buckets keep their token counts.
    pub fn reload_policies(&self, policies: PolicyRegistry) {
        tracing::info!(target: "tollgate::config", scopes = ?policies.scopes(), "policy registry reloaded");
        self.policies.set(policies);
    }

    /// Charge one token from `key`.
    ///
    /// A denial carries `window` as its retry hint. `Err` means the backend could not
    /// decide.
    pub async fn check(
        &self,
        key: &str,
        capacity: u32,
        window: Duration,
    ) -> Result<Decision, LimiterError> {
        let outcome = self.backend.take(key, capacity, window).await?;
        if outcome.allowed {
            Ok(Decision::Allowed { remaining: outcome.remaining() })
        } else {
            tracing::debug!(target: "tollgate::limiter", key, capacity, ?window, "bucket empty");
            Ok(Decision::Denied { retry_after: window })
        }
    }

    /// Boolean form of [`check`](Self::check).
    pub async fn allow(
        &self,
        key: &str,
        capacity: u32,
        window: Duration,
    ) -> Result<bool, LimiterError> {
        Ok(self.check(key, capacity, window).await?.is_allowed())
    }

    /// Resolve the policy for `scope` and charge `<scope>:<identifier>`.
    pub async fn check_scope(
        &self,
        scope: &str,
        identifier: &str,
    ) -> Result<ScopeCheck, LimiterError> {
        let policy = self.policies.get().lookup(scope).clone();
        let key = scoped_key(scope, identifier);
        let decision = self.check(&key, policy.capacity, policy.window).await?;
        Ok(ScopeCheck { key, policy, decision })
    }
}
