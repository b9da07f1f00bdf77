use thiserror::Error;

/// Application-wide error type
///
/// Observation and probe outcomes never surface here; they are carried as
/// `Unknown`/`Unreachable` values. This type covers the failures the control
/// loop has to report and retry: gadget lifecycle, configuration and the
/// persisted state file.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Gadget error: {0}")]
    Gadget(String),

    #[error("No USB Device Controller available after {attempts} driver reload attempt(s)")]
    ControllerUnavailable { attempts: u32 },

    #[error("Command `{program}` failed: {reason}")]
    Command { program: String, reason: String },

    #[error("State file error [{path}]: {reason}")]
    StateFile { path: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the failure is expected to clear on its own (boot-order races,
    /// controller still probing) as opposed to a broken configuration.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::ControllerUnavailable { .. } | AppError::Command { .. } | AppError::Io(_)
        )
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
