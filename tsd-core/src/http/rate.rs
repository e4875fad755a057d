//! GitHub rate limit tracking
//!
//! The tracker is advisory: it only learns from response headers and never
//! counts down in anticipation of requests that are still in flight. The
//! server stays the authority on whether a request is accepted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const HEADER_LIMIT: &str = "x-ratelimit-limit";
const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET: &str = "x-ratelimit-reset";

/// Source of wall-clock time in epoch milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Real system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests and replay
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Snapshot of the upstream quota as last reported
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateState {
    /// Requests allowed per window (0 = unknown)
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Epoch millis at which the window resets
    pub reset: Option<i64>,
    /// Epoch millis of the last observed response
    pub last_update: Option<i64>,
    /// Time until reset at the moment the snapshot was taken
    pub reset_in_millis: u64,
}

impl RateState {
    /// Whether a quota below the maximum is in effect
    pub fn is_limited(&self) -> bool {
        self.limit > 0 && self.remaining < self.limit
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining > 0
    }

    pub fn minutes_to_reset(&self) -> u64 {
        self.reset_in_millis / 1000 / 60
    }

    /// Human readable time to reset (`H:MM:SS`)
    pub fn reset_string(&self) -> String {
        if self.reset_in_millis > 0 {
            let secs = self.reset_in_millis / 1000;
            return format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60);
        }
        if self.limit > 0 {
            return "<limit expired>".to_string();
        }
        "<no known limit>".to_string()
    }
}

impl fmt::Display for RateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.remaining, self.limit)?;
        if self.remaining < self.limit {
            write!(f, " @ {}", self.reset_string())?;
        }
        Ok(())
    }
}

/// Tracks the quota for one upstream client
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    clock: Arc<dyn Clock>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(RateState::default())),
            clock,
        }
    }

    /// Update the quota from response headers (keys lowercased)
    ///
    /// Headers that are absent or unparseable leave the prior value untouched.
    pub fn observe(&self, headers: &BTreeMap<String, String>) {
        let now = self.clock.now_millis();
        let mut state = self.lock();

        if let Some(limit) = parse_header(headers, HEADER_LIMIT) {
            state.limit = limit.max(0) as u64;
        }
        if let Some(remaining) = parse_header(headers, HEADER_REMAINING) {
            state.remaining = remaining.max(0) as u64;
        }
        if let Some(reset) = parse_header(headers, HEADER_RESET) {
            state.reset = Some(reset.saturating_mul(1000));
        }
        state.last_update = Some(now);

        debug!(
            "Rate state: {} of {} (reset {:?})",
            state.remaining, state.limit, state.reset
        );
    }

    /// True iff nothing remains and the reset moment has not passed
    pub fn is_blocked(&self) -> bool {
        let now = self.clock.now_millis();
        let state = self.lock();
        state.remaining == 0 && state.reset.is_some_and(|reset| now < reset)
    }

    /// `max(0, reset - now)`, zero when no reset is known
    pub fn time_to_reset(&self) -> Duration {
        let now = self.clock.now_millis();
        let state = self.lock();
        Duration::from_millis(millis_to_reset(&state, now))
    }

    pub fn snapshot(&self) -> RateState {
        let now = self.clock.now_millis();
        let mut state = self.lock().clone();
        state.reset_in_millis = millis_to_reset(&state, now);
        state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateState> {
        // poisoned or not, the state is plain counters
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn millis_to_reset(state: &RateState, now: i64) -> u64 {
    state
        .reset
        .map(|reset| reset.saturating_sub(now).max(0) as u64)
        .unwrap_or(0)
}

fn parse_header(headers: &BTreeMap<String, String>, name: &str) -> Option<i64> {
    headers.get(name).and_then(|v| v.trim().parse::<i64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        (RateLimiter::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_unknown_state_is_not_blocked() {
        let (rate, _) = limiter();
        assert!(!rate.is_blocked());
        assert_eq!(rate.time_to_reset(), Duration::ZERO);
        assert_eq!(rate.snapshot().reset_string(), "<no known limit>");
    }

    #[test]
    fn test_blocked_until_reset_passes() {
        let (rate, clock) = limiter();
        let reset_secs = (NOW + 5000) / 1000;
        rate.observe(&headers(&[
            ("x-ratelimit-limit", "60"),
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset", &reset_secs.to_string()),
        ]));

        assert!(rate.is_blocked());
        assert!(rate.time_to_reset() <= Duration::from_secs(5));
        assert!(rate.time_to_reset() > Duration::ZERO);

        clock.advance(Duration::from_secs(6));
        assert!(!rate.is_blocked());
        assert_eq!(rate.time_to_reset(), Duration::ZERO);
    }

    #[test]
    fn test_missing_headers_keep_prior_values() {
        let (rate, _) = limiter();
        rate.observe(&headers(&[
            ("x-ratelimit-limit", "5000"),
            ("x-ratelimit-remaining", "4999"),
        ]));
        rate.observe(&headers(&[("x-ratelimit-remaining", "4998")]));
        rate.observe(&headers(&[("x-ratelimit-limit", "garbage")]));

        let snap = rate.snapshot();
        assert_eq!(snap.limit, 5000);
        assert_eq!(snap.remaining, 4998);
        assert!(snap.last_update.is_some());
    }

    #[test]
    fn test_negative_remaining_is_clamped() {
        let (rate, _) = limiter();
        rate.observe(&headers(&[("x-ratelimit-remaining", "-3")]));
        assert_eq!(rate.snapshot().remaining, 0);
    }

    #[test]
    fn test_display_and_helpers() {
        let (rate, _) = limiter();
        let reset_secs = (NOW + 3_725_000) / 1000;
        rate.observe(&headers(&[
            ("x-ratelimit-limit", "60"),
            ("x-ratelimit-remaining", "12"),
            ("x-ratelimit-reset", &reset_secs.to_string()),
        ]));

        let snap = rate.snapshot();
        assert!(snap.is_limited());
        assert!(snap.has_remaining());
        assert_eq!(snap.minutes_to_reset(), 62);
        assert_eq!(snap.to_string(), "12 of 60 @ 1:02:05");
    }
}
