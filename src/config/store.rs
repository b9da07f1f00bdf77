//! File-backed configuration loading

use std::path::Path;
use tracing::{debug, info};

use super::KeeperConfig;
use crate::error::{AppError, Result};

/// Configuration file read when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/usbnet-keeper/config.toml";

/// Load the configuration
///
/// An explicitly requested file must exist. Without one, the default path is
/// used when present and built-in defaults otherwise. Validation is left to
/// the caller so command-line overrides can be applied first.
pub fn load_config(path: Option<&Path>) -> Result<KeeperConfig> {
    match path {
        Some(path) => read_config_file(path),
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                read_config_file(default_path)
            } else {
                debug!("No config file at {}, using defaults", DEFAULT_CONFIG_PATH);
                Ok(KeeperConfig::default())
            }
        }
    }
}

fn read_config_file(path: &Path) -> Result<KeeperConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config = parse_config(&content)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Parse TOML configuration text; missing keys take their defaults
pub fn parse_config(content: &str) -> Result<KeeperConfig> {
    Ok(toml::from_str(content)?)
}
