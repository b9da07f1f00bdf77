//! Controller driver load/reload

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;
use crate::utils::run_checked;

const MODPROBE: &str = "modprobe";
const MODPROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Loads and reloads the USB device controller driver
#[async_trait]
pub trait ControllerDriver: Send + Sync {
    /// Make sure the driver is loaded; a no-op when it already is
    async fn load(&self) -> Result<()>;

    /// Unload and load the driver again
    async fn reload(&self) -> Result<()>;
}

/// Driver managed with `modprobe`
pub struct ModprobeDriver {
    module: String,
}

impl ModprobeDriver {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
        }
    }
}

#[async_trait]
impl ControllerDriver for ModprobeDriver {
    async fn load(&self) -> Result<()> {
        debug!("Loading controller driver {}", self.module);
        run_checked(MODPROBE, &[self.module.as_str()], MODPROBE_TIMEOUT).await?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        info!("Reloading controller driver {}", self.module);
        // The module may already be gone; only the load has to succeed
        if let Err(e) = run_checked(MODPROBE, &["-r", self.module.as_str()], MODPROBE_TIMEOUT).await {
            debug!("Unloading {} failed: {}", self.module, e);
        }
        self.load().await
    }
}

/// Built-in controller driver; nothing to load
pub struct BuiltinDriver;

#[async_trait]
impl ControllerDriver for BuiltinDriver {
    async fn load(&self) -> Result<()> {
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        debug!("No driver module configured, skipping reload");
        Ok(())
    }
}

/// Driver for `gadget.driver_module`, if any
pub fn driver_from_config(module: Option<&str>) -> Box<dyn ControllerDriver> {
    match module {
        Some(module) => Box::new(ModprobeDriver::new(module)),
        None => Box::new(BuiltinDriver),
    }
}
