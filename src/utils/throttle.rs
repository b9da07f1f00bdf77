//! Log throttling for conditions that repeat every tick
//!
//! A controller that never appears or a state file that cannot be read
//! fails again on every tick; the first occurrence is logged at full level
//! and repeats are held back until the interval has passed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits how often the same message is emitted
///
/// Owned by the control loop, so no locking; time is passed in to keep it
/// in step with the loop's clock.
#[derive(Debug)]
pub struct LogThrottler {
    last_logged: HashMap<String, Instant>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: HashMap::new(),
            interval,
        }
    }

    /// Whether `key` may be logged at `now`; records the time when it may
    pub fn should_log(&mut self, key: &str, now: Instant) -> bool {
        if let Some(last) = self.last_logged.get(key) {
            if now.saturating_duration_since(*last) < self.interval {
                return false;
            }
        }
        self.last_logged.insert(key.to_string(), now);
        true
    }

    /// Forget `key` once its condition has cleared, so a recurrence is
    /// logged immediately
    pub fn clear(&mut self, key: &str) {
        self.last_logged.remove(key);
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
