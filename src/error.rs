//! Error types for the admission limiter.
//!
//! Two families, split by when they can happen: [`ConfigError`] is raised while loading
//! configuration and is fatal at startup; [`LimiterError`] is raised per request and
//! never means "denied".
use std::time::Duration;

/// Request-time failures of a backend.
///
/// Both variants mean the decision is unknown. Callers pick fail-open or fail-closed
/// explicitly; see [`crate::config::FailurePolicy`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    /// The shared store could not be reached or rejected the script.
    #[error("rate limit backend unavailable: {reason}")]
    BackendUnavailable {
        /// Human-readable cause reported by the store client.
        reason: String,
    },
    /// The round trip did not complete within the configured bound.
    #[error("rate limit backend timed out after {timeout:?}")]
    Timeout {
        /// Bound that was exceeded.
        timeout: Duration,
    },
}

impl LimiterError {
    /// Build a `BackendUnavailable` from any displayable cause.
    pub fn unavailable(reason: impl std::fmt::Display) -> Self {
        Self::BackendUnavailable { reason: reason.to_string() }
    }

    /// Check if this error is due to the round-trip bound.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Machine-readable reason used in rejection bodies and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::Timeout { .. } => "backend_timeout",
        }
    }
}

/// Load-time configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A limit string is not of the form `N/period`.
    #[error("invalid limit spec {spec:?} for scope {scope:?}: {reason}")]
    InvalidPolicySpec {
        /// Scope the limit was declared for.
        scope: String,
        /// Offending text.
        spec: String,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// A policy window must be strictly positive.
    #[error("window for scope {scope:?} must be > 0")]
    InvalidWindow {
        /// Scope the window was declared for.
        scope: String,
    },
    /// The designated default scope has no limit, so unmatched scopes cannot resolve.
    #[error("no policy for scope {scope:?} and no default to fall back to")]
    PolicyNotFound {
        /// Scope that could not be resolved.
        scope: String,
    },
    /// The identifier header is not a valid HTTP header name.
    #[error("invalid identifier header name {name:?}")]
    InvalidHeaderName {
        /// Offending text.
        name: String,
    },
    /// The configuration document could not be decoded.
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    /// The configuration file could not be read.
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// The remote store could not be set up.
    #[error("cannot connect to remote store at {address:?}: {reason}")]
    Connect {
        /// Configured address.
        address: String,
        /// Client error text.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn backend_unavailable_display() {
        let err = LimiterError::unavailable("connection refused");
        let msg = err.to_string();
        assert!(msg.contains("unavailable"));
        assert!(msg.contains("connection refused"));
        assert_eq!(err.reason(), "backend_unavailable");
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_display_and_reason() {
        let err = LimiterError::Timeout { timeout: Duration::from_millis(250) };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("250ms"));
        assert_eq!(err.reason(), "backend_timeout");
    }

    #[test]
    fn invalid_spec_names_scope_and_text() {
        let err = ConfigError::InvalidPolicySpec {
            scope: "api".into(),
            spec: "ten/min".into(),
            reason: "count is not a non-negative integer",
        };
        let msg = err.to_string();
        assert!(msg.contains("api"));
        assert!(msg.contains("ten/min"));
    }

    #[test]
    fn parse_error_keeps_source() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ConfigError::from(json_err);
        assert!(err.source().is_some());
    }
}
