//! Admission configuration.
//!
//! One JSON document describes the backend, the per-scope limits, the routing rules and
//! the identity header. Every field has a default, so `{}` is a complete configuration:
//! local backend, the standard limits and routing, `authorization` as the credential
//! header, fail-closed on backend errors.
//!
//! ```json
//! {
//!   "backend": { "kind": "remote", "address": "redis://127.0.0.1/", "timeout_ms": 250 },
//!   "limits": { "global": "1000/min", "api": "100/min", "auth": "10/min" },
//!   "rules": [ { "prefix": "/api/auth", "scope": "auth" }, { "prefix": "/api", "scope": "api" } ],
//!   "identifier_header": "authorization",
//!   "on_backend_error": "open"
//! }
//! ```

use crate::backend::LocalBackend;
use crate::classify::{IdentityExtractor, ScopeRule, ScopeRules, DEFAULT_PREFIX_LEN};
use crate::error::ConfigError;
use crate::limiter::RateLimiter;
use crate::middleware::AdmissionLayer;
use crate::policy::{PolicyRegistry, DEFAULT_SCOPE};
use crate::violation::{NullSink, ViolationSink};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Bound on establishing the remote store connection at startup.
#[cfg(feature = "redis-store")]
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

fn default_timeout_ms() -> u64 {
    u64::try_from(crate::remote::DEFAULT_TIMEOUT.as_millis()).unwrap_or(250)
}

/// Which backend holds bucket state. Chosen once, at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Buckets live in this process.
    Local {
        /// Drop replenished buckets this often; no sweeping when absent.
        #[serde(default)]
        sweep_interval_secs: Option<u64>,
    },
    /// Buckets live in a shared store.
    Remote {
        /// Store address, e.g. `redis://127.0.0.1:6379/`.
        address: String,
        /// Bound on one round trip.
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        /// Namespace for store keys.
        #[serde(default)]
        key_prefix: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local { sweep_interval_secs: None }
    }
}

/// What the middleware does when the backend cannot decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Forward the request unmetered.
    Open,
    /// Reject the request with `503 Service Unavailable`.
    #[default]
    Closed,
}

/// Complete admission configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    pub backend: BackendConfig,
    /// Scope name to `N/period`.
    pub limits: BTreeMap<String, String>,
    /// Scope whose limit applies when a scope has none; must appear in `limits`.
    pub default_scope: String,
    /// Path prefix rules, first match wins.
    pub rules: Vec<ScopeRule>,
    /// Header trusted as the caller credential; `null` to always use the peer address.
    pub identifier_header: Option<String>,
    /// Characters of the credential kept in the identifier.
    pub identifier_prefix_len: usize,
    pub on_backend_error: FailurePolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        let limits = [("global", "1000/min"), ("api", "100/min"), ("auth", "10/min"), ("upload", "20/min")]
            .into_iter()
            .map(|(scope, spec)| (scope.to_owned(), spec.to_owned()))
            .collect();
        Self {
            backend: BackendConfig::default(),
            limits,
            default_scope: DEFAULT_SCOPE.to_owned(),
            rules: ScopeRules::standard_rules(),
            identifier_header: Some(http::header::AUTHORIZATION.as_str().to_owned()),
            identifier_prefix_len: DEFAULT_PREFIX_LEN,
            on_backend_error: FailurePolicy::default(),
        }
    }
}

impl AdmissionConfig {
    /// Decode a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and decode a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Parse every limit. Fails on the first malformed spec or a missing default.
    pub fn policy_registry(&self) -> Result<PolicyRegistry, ConfigError> {
        let registry = PolicyRegistry::from_specs(&self.limits, self.default_scope.clone())?;
        for rule in &self.rules {
            if !registry.contains(&rule.scope) {
                tracing::warn!(
                    target: "tollgate::config",
                    prefix = %rule.prefix,
                    scope = %rule.scope,
                    default = %self.default_scope,
                    "rule targets a scope without a limit; the default limit applies"
                );
            }
        }
        Ok(registry)
    }

    pub fn scope_rules(&self) -> ScopeRules {
        ScopeRules::new(self.rules.clone(), self.default_scope.clone())
    }

    pub fn identity(&self) -> Result<IdentityExtractor, ConfigError> {
        match &self.identifier_header {
            Some(name) => IdentityExtractor::with_header(name, self.identifier_prefix_len),
            None => Ok(IdentityExtractor::address_only()),
        }
    }

    /// Build the limiter, connecting to the remote store if one is configured.
    ///
    /// Must run inside a tokio runtime (the local sweeper and the store connection are
    /// spawned on it).
    pub async fn build_limiter(&self) -> Result<RateLimiter, ConfigError> {
        let policies = self.policy_registry()?;
        let limiter = match &self.backend {
            BackendConfig::Local { sweep_interval_secs } => {
                let backend = LocalBackend::new();
                if let Some(secs) = sweep_interval_secs.filter(|secs| *secs > 0) {
                    backend.spawn_sweeper(Duration::from_secs(secs));
                }
                RateLimiter::new(backend, policies)
            }
            BackendConfig::Remote { address, timeout_ms, key_prefix } => {
                let backend = remote_backend(address, *timeout_ms, key_prefix.as_deref()).await?;
                RateLimiter::new(backend, policies)
            }
        };
        tracing::info!(
            target: "tollgate::config",
            backend = limiter.backend_name(),
            scopes = ?limiter.policies().scopes(),
            on_backend_error = ?self.on_backend_error,
            "admission limiter configured"
        );
        Ok(limiter)
    }

    /// Build the middleware layer with violations sent to `sink`.
    pub async fn build_layer<K: ViolationSink>(
        &self,
        sink: K,
    ) -> Result<AdmissionLayer<K>, ConfigError> {
        let identity = self.identity()?;
        let limiter = self.build_limiter().await?;
        Ok(AdmissionLayer::new(limiter)
            .with_rules(self.scope_rules())
            .with_identity(identity)
            .with_failure_policy(self.on_backend_error)
            .with_sink(sink))
    }

    /// [`build_layer`](Self::build_layer) discarding violations.
    pub async fn build_default_layer(&self) -> Result<AdmissionLayer<NullSink>, ConfigError> {
        self.build_layer(NullSink).await
    }
}

#[cfg(feature = "redis-store")]
async fn remote_backend(
    address: &str,
    timeout_ms: u64,
    key_prefix: Option<&str>,
) -> Result<crate::remote::RemoteBackend, ConfigError> {
    let connect_error = |reason: String| ConfigError::Connect { address: address.to_owned(), reason };
    let store = tokio::time::timeout(CONNECT_TIMEOUT, crate::remote::RedisStore::connect(address))
        .await
        .map_err(|_| connect_error(format!("no connection within {CONNECT_TIMEOUT:?}")))?
        .map_err(|err| connect_error(err.to_string()))?;
    let mut backend = crate::remote::RemoteBackend::new(store)
        .with_timeout(Duration::from_millis(timeout_ms.max(1)));
    if let Some(prefix) = key_prefix {
        backend = backend.with_key_prefix(prefix);
    }
    Ok(backend)
}

#[cfg(not(feature = "redis-store"))]
async fn remote_backend(
    address: &str,
    _timeout_ms: u64,
    _key_prefix: Option<&str>,
) -> Result<crate::remote::RemoteBackend, ConfigError> {
    Err(ConfigError::Connect {
        address: address.to_owned(),
        reason: "built without the `redis-store` feature".to_owned(),
    })
}
