//! Sliding window rate limiter keyed by subject and operation class
//!
//! Admission is advisory: callers check before acting and decide what to do
//! with a rejection. Windows are pruned lazily on each check; idle subjects
//! are only dropped by an explicit [`RateLimiter::sweep`].

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Result of rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request is allowed
    Allowed {
        /// Remaining requests in window
        remaining: u64,
        /// Time until window resets
        reset_after: Duration,
    },
    /// Rate limit exceeded
    Exceeded {
        /// Current request count
        current: u64,
        /// Maximum allowed
        limit: u64,
        /// Time until oldest request expires
        reset_after: Option<Duration>,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

#[derive(Debug, Default)]
struct RateWindow {
    timestamps: Vec<Instant>,
    last_seen: Option<Instant>,
}

/// Per-subject, per-class sliding window counters
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Admission timestamps per (subject, class)
    windows: Mutex<HashMap<(String, String), RateWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit and record the request if the class budget allows it
    pub fn check_limit(&self, subject: &str, class: &str) -> bool {
        self.check(subject, class).is_allowed()
    }

    /// Check if request is allowed and record it
    pub fn check(&self, subject: &str, class: &str) -> RateLimitResult {
        let rule = self.config.rule_for(class);
        let window = rule.window();
        let now = Instant::now();

        let mut windows = self.windows.lock();
        let entry = windows
            .entry((subject.to_string(), class.to_string()))
            .or_default();

        // Remove expired timestamps
        entry.timestamps.retain(|&t| now.duration_since(t) < window);
        entry.last_seen = Some(now);

        let current = entry.timestamps.len() as u64;

        if current >= rule.requests {
            let reset_after = entry
                .timestamps
                .first()
                .map(|&t| (t + window).saturating_duration_since(now));

            debug!(subject, class, current, limit = rule.requests, "rate limit exceeded");
            RateLimitResult::Exceeded {
                current,
                limit: rule.requests,
                reset_after,
            }
        } else {
            entry.timestamps.push(now);
            RateLimitResult::Allowed {
                remaining: rule.requests - current - 1,
                reset_after: window,
            }
        }
    }

    /// Get current count without recording
    pub fn current_count(&self, subject: &str, class: &str) -> u64 {
        let window = self.config.rule_for(class).window();
        let now = Instant::now();

        self.windows
            .lock()
            .get(&(subject.to_string(), class.to_string()))
            .map(|w| w.timestamps.iter().filter(|&&t| now.duration_since(t) < window).count() as u64)
            .unwrap_or(0)
    }

    /// Drop every window belonging to `subject`
    pub fn clear_user(&self, subject: &str) {
        self.windows.lock().retain(|(s, _), _| s != subject);
    }

    /// Drop windows whose subject has been idle longer than the idle timeout.
    /// Returns the number of windows dropped.
    pub fn sweep(&self) -> usize {
        let idle = self.config.idle_timeout();
        let now = Instant::now();

        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| {
            w.last_seen
                .is_some_and(|seen| now.duration_since(seen) <= idle)
        });

        let dropped = before - windows.len();
        if dropped > 0 {
            debug!(dropped, "swept idle rate limit windows");
        }
        dropped
    }

    /// Number of (subject, class) windows currently tracked
    pub fn tracked_windows(&self) -> usize {
        self.windows.lock().len()
    }
}
