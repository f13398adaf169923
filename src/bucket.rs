//! Token-bucket arithmetic.
//!
//! [`take_token`] is the only place refill and admission are computed. The in-process
//! backend calls it under its lock and the shared-memory store calls it inside its
//! atomic section; the Redis script in [`crate::remote`] is a line-for-line port of it.

use std::time::Duration;

/// Quota record for one bucket key.
///
/// Tokens are fractional because refill is continuous.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens currently available, `0 <= tokens <= capacity`.
    pub tokens: f64,
    /// Maximum tokens the bucket holds under its current policy.
    pub capacity: u32,
    /// Time for `capacity` tokens to fully regenerate.
    pub window: Duration,
    /// Clock reading (ms) of the last recomputation.
    pub last_refill_ms: u64,
}

/// Result of one admission attempt against a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether a token was taken.
    pub allowed: bool,
    /// Tokens left after the attempt.
    pub tokens: f64,
    /// Clock reading to store as the new `last_refill_ms`.
    pub refilled_at: u64,
}

impl BucketOutcome {
    /// Whole tokens left, as advertised in `X-RateLimit-Remaining`.
    pub fn remaining(&self) -> u64 {
        self.tokens.max(0.0).floor() as u64
    }
}

impl BucketState {
    /// A bucket seen for the first time starts full.
    pub fn full(capacity: u32, window: Duration, now_ms: u64) -> Self {
        Self { tokens: f64::from(capacity), capacity, window, last_refill_ms: now_ms }
    }

    /// Run one admission attempt and write the result back into `self`.
    pub fn take(&mut self, capacity: u32, window: Duration, now_ms: u64) -> BucketOutcome {
        let outcome = take_token(self.tokens, self.last_refill_ms, capacity, window, now_ms);
        self.tokens = outcome.tokens;
        self.capacity = capacity;
        self.window = window;
        self.last_refill_ms = outcome.refilled_at;
        outcome
    }

    /// Tokens this bucket would hold at `now_ms` without consuming any.
    pub fn projected(&self, now_ms: u64) -> f64 {
        refill(self.tokens, self.last_refill_ms, self.capacity, self.window, now_ms)
    }

    /// True once refill has brought the bucket back to capacity, at which point it is
    /// indistinguishable from a key that was never seen.
    pub fn is_replenished(&self, now_ms: u64) -> bool {
        self.projected(now_ms) >= f64::from(self.capacity)
    }
}

fn refill(tokens: f64, last_refill_ms: u64, capacity: u32, window: Duration, now_ms: u64) -> f64 {
    let capacity = f64::from(capacity);
    let window_secs = window.as_secs_f64();
    if window_secs <= 0.0 {
        return capacity;
    }
    let elapsed_secs = now_ms.saturating_sub(last_refill_ms) as f64 / 1_000.0;
    let refilled = tokens + (elapsed_secs / window_secs) * capacity;
    refilled.min(capacity)
}

/// Refill a bucket snapshot up to `now_ms` and try to take one token.
///
/// A clock reading older than `last_refill_ms` counts as zero elapsed time and does not
/// move the refill mark backwards. A zero window refills instantly. A zero capacity
/// always denies.
pub fn take_token(
    tokens: f64,
    last_refill_ms: u64,
    capacity: u32,
    window: Duration,
    now_ms: u64,
) -> BucketOutcome {
    let refilled = refill(tokens, last_refill_ms, capacity, window, now_ms).max(0.0);
    let allowed = refilled >= 1.0;
    let tokens = if allowed { refilled - 1.0 } else { refilled };
    BucketOutcome { allowed, tokens, refilled_at: now_ms.max(last_refill_ms) }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn full_bucket_admits_and_decrements() {
        let out = take_token(10.0, 0, 10, MINUTE, 0);
        assert!(out.allowed);
        assert_eq!(out.tokens, 9.0);
        assert_eq!(out.refilled_at, 0);
    }

    #[test]
    fn empty_bucket_denies_without_going_negative() {
        let out = take_token(0.0, 1_000, 10, MINUTE, 1_000);
        assert!(!out.allowed);
        assert_eq!(out.tokens, 0.0);
    }

    #[test]
    fn fractional_token_is_not_enough() {
        // 5.9s of a 60s/10 window refills 0.98 tokens.
        let out = take_token(0.0, 0, 10, MINUTE, 5_900);
        assert!(!out.allowed);
        assert!((out.tokens - 0.983).abs() < 0.001);
        assert_eq!(out.refilled_at, 5_900);
    }

    #[test]
    fn refill_is_clamped_to_capacity() {
        let out = take_token(3.0, 0, 10, MINUTE, 3_600_000);
        assert!(out.allowed);
        assert_eq!(out.tokens, 9.0);
    }

    #[test]
    fn half_window_refills_half_capacity() {
        let out = take_token(0.0, 0, 100, MINUTE, 30_000);
        assert!(out.allowed);
        assert!((out.tokens - 49.0).abs() < 1e-9);
    }

    #[test]
    fn clock_skew_counts_as_zero_elapsed() {
        let out = take_token(0.5, 10_000, 10, MINUTE, 4_000);
        assert!(!out.allowed);
        assert_eq!(out.tokens, 0.5);
        assert_eq!(out.refilled_at, 10_000, "refill mark must not move backwards");
    }

    #[test]
    fn zero_capacity_always_denies() {
        for now in [0, 60_000, 10_000_000] {
            let out = take_token(0.0, 0, 0, MINUTE, now);
            assert!(!out.allowed);
            assert_eq!(out.tokens, 0.0);
        }
    }

    #[test]
    fn zero_window_refills_instantly() {
        let out = take_token(0.0, 0, 3, Duration::ZERO, 0);
        assert!(out.allowed);
        assert_eq!(out.tokens, 2.0);
    }

    #[test]
    fn state_take_writes_back() {
        let mut state = BucketState::full(2, MINUTE, 0);
        assert!(state.take(2, MINUTE, 0).allowed);
        assert!(state.take(2, MINUTE, 0).allowed);
        assert!(!state.take(2, MINUTE, 0).allowed);
        assert_eq!(state.tokens, 0.0);
        assert!(!state.is_replenished(0));
        assert!(state.is_replenished(60_000));
    }

    #[test]
    fn remaining_floors_fractional_tokens() {
        let out = BucketOutcome { allowed: true, tokens: 4.99, refilled_at: 0 };
        assert_eq!(out.remaining(), 4);
    }
}
