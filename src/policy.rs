//! Scope policies.
//!
//! A scope's limit is written `N/period`, where period is a unit optionally preceded by
//! a count: `100/min`, `10/minute`, `20/30s`, `10000/hour`. The parsed registry is
//! immutable; changing limits means building a new registry and swapping it in whole
//! (see [`crate::limiter::RateLimiter::reload_policies`]).

use crate::error::ConfigError;
use std::collections::HashMap;
use std::time::Duration;

/// Scope used when nothing else matches.
pub const DEFAULT_SCOPE: &str = "global";

/// Admission rule for one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    pub scope: String,
    /// Tokens a bucket holds when full.
    pub capacity: u32,
    /// Time for an empty bucket to refill completely.
    pub window: Duration,
}

impl PolicyEntry {
    /// Validated constructor. The window must be non-zero.
    pub fn new(scope: impl Into<String>, capacity: u32, window: Duration) -> Result<Self, ConfigError> {
        let scope = scope.into();
        if window.is_zero() {
            return Err(ConfigError::InvalidWindow { scope });
        }
        Ok(Self { scope, capacity, window })
    }

    /// Parse an `N/period` spec for `scope`.
    pub fn parse(scope: impl Into<String>, spec: &str) -> Result<Self, ConfigError> {
        let scope = scope.into();
        let invalid = |reason| ConfigError::InvalidPolicySpec {
            scope: scope.clone(),
            spec: spec.to_owned(),
            reason,
        };

        let (count, period) = spec.split_once('/').ok_or_else(|| invalid("expected N/period"))?;
        let capacity: u32 =
            count.trim().parse().map_err(|_| invalid("count is not a non-negative integer"))?;
        let window = parse_period(period.trim()).ok_or_else(|| invalid("unknown period"))?;
        Self::new(scope, capacity, window)
    }

    /// Whole seconds advertised in `Retry-After` (at least 1).
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.window.as_secs() + u64::from(self.window.subsec_nanos() > 0);
        secs.max(1)
    }
}

fn unit_seconds(unit: &str) -> Option<u64> {
    match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => Some(1),
        "m" | "min" | "mins" | "minute" | "minutes" => Some(60),
        "h" | "hr" | "hour" | "hours" => Some(3_600),
        "d" | "day" | "days" => Some(86_400),
        _ => None,
    }
}

fn parse_period(period: &str) -> Option<Duration> {
    let split = period.find(|c: char| !c.is_ascii_digit()).unwrap_or(period.len());
    let (count, unit) = period.split_at(split);
    let count: u64 = if count.is_empty() { 1 } else { count.parse().ok()? };
    let secs = count.checked_mul(unit_seconds(unit.trim())?)?;
    Some(Duration::from_secs(secs))
}

/// Scope name to policy, with a guaranteed default.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    entries: HashMap<String, PolicyEntry>,
    default_scope: String,
}

impl PolicyRegistry {
    /// Build from parsed entries. Fails if `default_scope` has no entry.
    pub fn new(
        entries: impl IntoIterator<Item = PolicyEntry>,
        default_scope: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let default_scope = default_scope.into();
        let entries: HashMap<String, PolicyEntry> =
            entries.into_iter().map(|entry| (entry.scope.clone(), entry)).collect();
        if !entries.contains_key(&default_scope) {
            return Err(ConfigError::PolicyNotFound { scope: default_scope });
        }
        Ok(Self { entries, default_scope })
    }

    /// Parse `(scope, "N/period")` pairs.
    pub fn from_specs<I, K, V>(specs: I, default_scope: impl Into<String>) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let entries = specs
            .into_iter()
            .map(|(scope, spec)| PolicyEntry::parse(scope, spec.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(entries, default_scope)
    }

    /// Default limits: global 1000/min, api 100/min,
    /// auth 10/min, upload 20/min.
    pub fn standard() -> Self {
        let minute = Duration::from_secs(60);
        let entry = |scope: &str, capacity| PolicyEntry {
            scope: scope.to_owned(),
            capacity,
            window: minute,
        };
        let entries = [
            entry(DEFAULT_SCOPE, 1_000),
            entry("api", 100),
            entry("auth", 10),
            entry("upload", 20),
        ];
        Self {
            entries: entries.into_iter().map(|e| (e.scope.clone(), e)).collect(),
            default_scope: DEFAULT_SCOPE.to_owned(),
        }
    }

    /// Policy for `scope`, or the default scope's policy.
    pub fn lookup(&self, scope: &str) -> &PolicyEntry {
        match self.entries.get(scope) {
            Some(entry) => entry,
            // present by construction
            None => &self.entries[&self.default_scope],
        }
    }

    /// True if `scope` has its own entry.
    pub fn contains(&self, scope: &str) -> bool {
        self.entries.contains_key(scope)
    }

    pub fn default_scope(&self) -> &str {
        &self.default_scope
    }

    /// Scope names, sorted.
    pub fn scopes(&self) -> Vec<&str> {
        let mut scopes: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        scopes.sort_unstable();
        scopes
    }
}
