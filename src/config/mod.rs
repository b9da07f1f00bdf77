//! Daemon configuration
//!
//! Every tunable of the control loop lives here: polling intervals, probe
//! count/timeout, the three reset thresholds, turbo window and grace period,
//! the host subnet, monitored interfaces and the debug toggle.

mod schema;
mod store;

pub use schema::*;
pub use store::{load_config, parse_config, DEFAULT_CONFIG_PATH};
