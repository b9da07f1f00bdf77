//! USB network gadget functions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::configfs::{create_dir, create_symlink, read_file, remove_dir, remove_file, write_file};
use crate::error::Result;

/// Microsoft OS descriptor compatible ID that makes Windows load its RNDIS driver
const RNDIS_COMPATIBLE_ID: &str = "RNDIS";
const RNDIS_SUB_COMPATIBLE_ID: &str = "5162001";

/// Network function kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetFunctionKind {
    /// CDC-ECM (Linux, macOS, most phones)
    Ecm,
    /// RNDIS (Windows)
    Rndis,
}

impl NetFunctionKind {
    /// configfs function type prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ecm => "ecm",
            Self::Rndis => "rndis",
        }
    }
}

impl fmt::Display for NetFunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// USB Gadget Function trait
pub trait GadgetFunction: Send + Sync {
    /// Function name (e.g., "ecm.usb0")
    fn name(&self) -> &str;

    /// Create function directory and configuration in ConfigFS
    fn create(&self, gadget_path: &Path) -> Result<()>;

    /// Link function to configuration
    fn link(&self, config_path: &Path, gadget_path: &Path) -> Result<()>;

    /// Unlink function from configuration
    fn unlink(&self, config_path: &Path) -> Result<()>;

    /// Cleanup function directory
    fn cleanup(&self, gadget_path: &Path) -> Result<()>;
}

/// Ethernet-over-USB function
#[derive(Debug, Clone)]
pub struct NetFunction {
    kind: NetFunctionKind,
    name: String,
    host_addr: Option<String>,
    dev_addr: Option<String>,
}

impl NetFunction {
    pub fn new(kind: NetFunctionKind, instance: u8) -> Self {
        Self {
            kind,
            name: format!("{}.usb{}", kind, instance),
            host_addr: None,
            dev_addr: None,
        }
    }

    /// Pin the MAC addresses so the host sees the same adapter after a reset
    pub fn with_addresses(mut self, host_addr: Option<String>, dev_addr: Option<String>) -> Self {
        self.host_addr = host_addr;
        self.dev_addr = dev_addr;
        self
    }

    pub fn kind(&self) -> NetFunctionKind {
        self.kind
    }

    fn function_path(&self, gadget_path: &Path) -> PathBuf {
        gadget_path.join("functions").join(self.name())
    }

    /// Network interface the kernel created for this function, once bound
    pub fn ifname(&self, gadget_path: &Path) -> Option<String> {
        read_file(&self.function_path(gadget_path).join("ifname"))
            .ok()
            .filter(|name| !name.is_empty() && name != "(unnamed net_device)")
    }
}

impl GadgetFunction for NetFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, gadget_path: &Path) -> Result<()> {
        let func_path = self.function_path(gadget_path);
        create_dir(&func_path)?;

        if let Some(ref addr) = self.host_addr {
            write_file(&func_path.join("host_addr"), addr)?;
        }
        if let Some(ref addr) = self.dev_addr {
            write_file(&func_path.join("dev_addr"), addr)?;
        }

        if self.kind == NetFunctionKind::Rndis {
            let os_desc = func_path.join("os_desc/interface.rndis");
            create_dir(&os_desc)?;
            write_file(&os_desc.join("compatible_id"), RNDIS_COMPATIBLE_ID)?;
            write_file(&os_desc.join("sub_compatible_id"), RNDIS_SUB_COMPATIBLE_ID)?;
        }

        debug!(
            "Created {} function: {} at {}",
            self.kind,
            self.name(),
            func_path.display()
        );
        Ok(())
    }

    fn link(&self, config_path: &Path, gadget_path: &Path) -> Result<()> {
        let func_path = self.function_path(gadget_path);
        let link_path = config_path.join(self.name());

        if link_path.symlink_metadata().is_err() {
            create_symlink(&func_path, &link_path)?;
            debug!("Linked function {} to config", self.name());
        }
        Ok(())
    }

    fn unlink(&self, config_path: &Path) -> Result<()> {
        remove_file(&config_path.join(self.name()))?;
        debug!("Unlinked function {}", self.name());
        Ok(())
    }

    fn cleanup(&self, gadget_path: &Path) -> Result<()> {
        remove_dir(&self.function_path(gadget_path))?;
        debug!("Cleaned up function {}", self.name());
        Ok(())
    }
}
