//! Retry primitives for loops that talk to remote, rate-limited APIs.
//!
//! Two building blocks:
//!
//! - [`BackoffPolicy`]: exponential backoff with jitter, used to schedule
//!   the next attempt after a transient failure.
//! - [`RetryTracker`]: a windowed per-key failure budget, used to stop
//!   re-admitting work that keeps failing.
//!
//! # Invariants
//!
//! - Backoff delays grow exponentially up to the cap
//! - A key with no recorded failures is never exhausted
//! - Exhaustion expires once the failure window has passed

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            let range = delay * self.jitter;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// A run of failures for one key, anchored at the first failure.
#[derive(Debug, Clone, Copy)]
struct Streak {
    count: u32,
    opened_at: Instant,
}

impl Streak {
    fn open(now: Instant) -> Self {
        Self {
            count: 0,
            opened_at: now,
        }
    }

    fn is_stale(&self, window: Duration, now: Instant) -> bool {
        now.duration_since(self.opened_at) > window
    }
}

/// Windowed per-key failure budget.
///
/// Each key gets `max_retries` forgiven failures within `window` of the
/// first one; the failure after that reports the key exhausted. A streak
/// older than the window is forgotten, so a key that only fails rarely
/// never exhausts.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_retries: u32,
    window: Duration,
    streaks: HashMap<String, Streak>,
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            streaks: HashMap::new(),
        }
    }

    /// Count a failure against the key's budget.
    ///
    /// Returns true once the budget is spent.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let streak = self
            .streaks
            .entry(key.to_string())
            .and_modify(|s| {
                if s.is_stale(self.window, now) {
                    *s = Streak::open(now);
                }
            })
            .or_insert_with(|| Streak::open(now));
        streak.count += 1;
        streak.count > self.max_retries
    }

    /// Whether the key's budget is currently spent.
    pub fn is_exhausted(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.streaks.get(key) {
            Some(s) if !s.is_stale(self.window, now) => s.count > self.max_retries,
            _ => false,
        }
    }

    /// Forget the key's streak, restoring its full budget. Call on success.
    pub fn clear(&mut self, key: &str) {
        self.streaks.remove(key);
    }

    /// Drop streaks that have aged out of the window.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.streaks.retain(|_, s| !s.is_stale(self.window, now));
    }
}

/// Default attempt budget per key.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
