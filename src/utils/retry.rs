//! Bounded polling with backoff
//!
//! Every wait in the daemon (controller appearance, driver reload) goes
//! through here so that no path loops without a bound.

use std::time::Duration;

/// Delay schedule between poll attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    /// Same delay every time
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Call `probe` up to `max_attempts` times, sleeping per `backoff` between
/// attempts. Returns the first `Some`.
pub async fn poll_until<T, F>(max_attempts: u32, mut backoff: Backoff, mut probe: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    for attempt in 1..=max_attempts {
        if let Some(value) = probe() {
            return Some(value);
        }
        if attempt < max_attempts {
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
    None
}
