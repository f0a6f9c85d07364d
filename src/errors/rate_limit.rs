//! Per-identity error rate limiting
//!
//! Guards the recovery engine against error storms and probing. Each
//! identity (session id, else subject id, else "anonymous") gets a bounded
//! sliding-window log of error instants; exceeding the threshold inside the
//! window short-circuits recovery with `RateLimited`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Default sliding window: 5 minutes
pub const DEFAULT_WINDOW_SECS: i64 = 300;

/// Errors tolerated inside the window before limiting kicks in
pub const DEFAULT_THRESHOLD: usize = 5;

/// Hard cap on remembered instants per identity
const PER_IDENTITY_CAP: usize = 100;

pub struct ErrorRateLimiter {
    window: Duration,
    threshold: usize,
    entries: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl ErrorRateLimiter {
    #[must_use]
    pub fn new(window_secs: i64, threshold: usize) -> Self {
        Self {
            window: Duration::seconds(window_secs),
            threshold,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Seconds a limited caller should wait before retrying
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        u64::try_from(self.window.num_seconds()).unwrap_or(300)
    }

    /// Record an error for this identity and report whether it is now limited
    ///
    /// The threshold is exclusive: with the default of 5, the sixth error
    /// inside the window is the first limited one.
    pub fn record(&self, identity: &str) -> bool {
        self.record_at(identity, Utc::now())
    }

    /// Timestamped variant of [`record`](Self::record), used by tests to
    /// exercise window boundaries without sleeping
    pub fn record_at(&self, identity: &str, at: DateTime<Utc>) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let log = entries.entry(identity.to_string()).or_default();

        let horizon = at - self.window;
        while log.front().is_some_and(|t| *t <= horizon) {
            log.pop_front();
        }

        log.push_back(at);
        if log.len() > PER_IDENTITY_CAP {
            log.pop_front();
        }

        log.len() > self.threshold
    }

    /// Whether this identity is currently limited, without recording
    #[must_use]
    pub fn is_limited(&self, identity: &str) -> bool {
        self.is_limited_at(identity, Utc::now())
    }

    #[must_use]
    pub fn is_limited_at(&self, identity: &str, at: DateTime<Utc>) -> bool {
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        let horizon = at - self.window;
        entries
            .get(identity)
            .map(|log| log.iter().filter(|t| **t > horizon).count())
            .is_some_and(|count| count > self.threshold)
    }

    /// Drop identities with no instants inside the window
    pub fn prune(&self) {
        let horizon = Utc::now() - self.window;
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, log| log.iter().any(|t| *t > horizon));
        }
    }

    #[must_use]
    pub fn tracked_identities(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

impl Default for ErrorRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SECS, DEFAULT_THRESHOLD)
    }
}
