//! Utility modules

pub mod command;
pub mod retry;
pub mod throttle;

pub use command::{run_checked, run_command};
pub use retry::{poll_until, Backoff};
pub use throttle::LogThrottler;
