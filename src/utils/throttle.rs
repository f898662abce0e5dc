//! Log throttling
//!
//! Retry loops hit the same failure over and over (an unreachable STUN server,
//! a handle that cannot report statistics). These helpers keep such failures
//! to one log record per interval and per key.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Remembers when each key was last logged
pub struct LogThrottler {
    last_logged: Mutex<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` and restarts the interval if `key` may be logged now
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget `key`, so its next failure is logged immediately
    ///
    /// Call this once the failing condition has recovered.
    pub fn clear(&self, key: &str) {
        self.last_logged.lock().remove(key);
    }
}

/// Throttled `tracing::warn!`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

/// Throttled `tracing::error!`
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::error!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(50));
        assert!(throttler.should_log("stun"));
        assert!(!throttler.should_log("stun"));

        std::thread::sleep(Duration::from_millis(80));
        assert!(throttler.should_log("stun"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("stats"));
        assert!(throttler.should_log("stun"));
        assert!(!throttler.should_log("stats"));
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("stats"));
        throttler.clear("stats");
        assert!(throttler.should_log("stats"));
    }
}
