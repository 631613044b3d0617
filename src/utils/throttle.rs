//! Rate-limited logging for repeating failures.
//!
//! A dead capture device or a stalled collector produces the same error on
//! every read or write; the throttler keeps those down to one log line per
//! interval and key.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

pub struct LogThrottler {
    last_logged: RwLock<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: RwLock::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` when the message keyed by `key` should be logged,
    /// in which case the timestamp for that key is refreshed.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();

        {
            let map = self.last_logged.read();
            if let Some(last) = map.get(key) {
                if now.duration_since(*last) < self.interval {
                    return false;
                }
            }
        }

        let mut map = self.last_logged.write();
        // Re-check: another thread may have logged between the locks
        if let Some(last) = map.get(key) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }
        map.insert(key.to_string(), now);
        true
    }

    /// Forget a key so the next occurrence is logged immediately.
    /// Called when the error condition recovers.
    pub fn clear(&self, key: &str) {
        self.last_logged.write().remove(key);
    }
}

impl Default for LogThrottler {
    /// Five seconds between repeats of the same message.
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`.
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

/// Throttled `tracing::error!`.
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::error!($($arg)*);
        }
    };
}
