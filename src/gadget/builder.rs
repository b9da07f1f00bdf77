//! Gadget descriptor builders
//!
//! The lifecycle manager only needs to create and discard the gadget tree;
//! binding it to a controller stays with the lifecycle. Two builders exist:
//! the built-in configfs one and one that runs an external setup script.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::configfs::{
    create_dir, create_symlink, remove_dir, remove_file, teardown_gadget, write_file,
    USB_BCD_DEVICE, USB_BCD_USB,
};
use super::function::{GadgetFunction, NetFunction, NetFunctionKind};
use crate::config::GadgetConfig;
use crate::error::{AppError, Result};
use crate::utils::run_checked;

/// Deadline for an external setup command
const SETUP_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Vendor code Windows uses to request Microsoft OS descriptors
const OS_DESC_VENDOR_CODE: &str = "0xcd";
const OS_DESC_SIGN: &str = "MSFT100";

/// Creates and removes the gadget's configfs tree
#[async_trait]
pub trait GadgetBuilder: Send + Sync {
    /// Gadget directory in configfs; its `UDC` attribute is the bind control
    fn gadget_path(&self) -> &Path;

    /// Build the gadget tree. On error nothing may be bound.
    async fn configure(&mut self) -> Result<()>;

    /// Remove the gadget tree. Idempotent; the gadget must be unbound.
    async fn discard(&mut self) -> Result<()>;

    /// Network interface names the gadget exposes, once known
    fn interfaces(&self) -> Vec<String> {
        Vec::new()
    }
}

/// USB Gadget device descriptor configuration
#[derive(Debug, Clone)]
pub struct GadgetDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
}

impl GadgetDescriptor {
    pub fn from_config(config: &GadgetConfig) -> Self {
        Self {
            vendor_id: config.vendor_id,
            product_id: config.product_id,
            device_version: USB_BCD_DEVICE,
            manufacturer: config.manufacturer.clone(),
            product: config.product.clone(),
            serial_number: config.serial_number.clone(),
        }
    }
}

/// Built-in configfs gadget with one configuration of network functions
pub struct ConfigfsGadget {
    /// Gadget path in ConfigFS
    gadget_path: PathBuf,
    /// Configuration path
    config_path: PathBuf,
    descriptor: GadgetDescriptor,
    functions: Vec<NetFunction>,
}

impl ConfigfsGadget {
    pub fn new(config: &GadgetConfig) -> Self {
        let gadget_path = config.configfs_path.join(&config.name);
        let config_path = gadget_path.join("configs/c.1");

        let functions = config
            .functions
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                let instance = i as u8;
                NetFunction::new(*kind, instance).with_addresses(
                    config.host_addr.as_deref().and_then(|a| offset_mac(a, instance)),
                    config.dev_addr.as_deref().and_then(|a| offset_mac(a, instance)),
                )
            })
            .collect();

        Self {
            gadget_path,
            config_path,
            descriptor: GadgetDescriptor::from_config(config),
            functions,
        }
    }

    fn configfs_root(&self) -> Option<&Path> {
        self.gadget_path.parent()
    }

    fn needs_os_desc(&self) -> bool {
        self.functions
            .iter()
            .any(|f| f.kind() == NetFunctionKind::Rndis)
    }

    /// Set USB device descriptors
    fn set_device_descriptors(&self) -> Result<()> {
        write_file(
            &self.gadget_path.join("idVendor"),
            &format!("0x{:04x}", self.descriptor.vendor_id),
        )?;
        write_file(
            &self.gadget_path.join("idProduct"),
            &format!("0x{:04x}", self.descriptor.product_id),
        )?;
        write_file(
            &self.gadget_path.join("bcdDevice"),
            &format!("0x{:04x}", self.descriptor.device_version),
        )?;
        write_file(
            &self.gadget_path.join("bcdUSB"),
            &format!("0x{:04x}", USB_BCD_USB),
        )?;
        // Composite device: class defined per interface
        write_file(&self.gadget_path.join("bDeviceClass"), "0x00")?;
        write_file(&self.gadget_path.join("bDeviceSubClass"), "0x00")?;
        write_file(&self.gadget_path.join("bDeviceProtocol"), "0x00")?;
        debug!("Set device descriptors");
        Ok(())
    }

    /// Create USB strings
    fn create_strings(&self) -> Result<()> {
        let strings_path = self.gadget_path.join("strings/0x409");
        create_dir(&strings_path)?;

        write_file(
            &strings_path.join("serialnumber"),
            &self.descriptor.serial_number,
        )?;
        write_file(
            &strings_path.join("manufacturer"),
            &self.descriptor.manufacturer,
        )?;
        write_file(&strings_path.join("product"), &self.descriptor.product)?;
        debug!("Created USB strings");
        Ok(())
    }

    /// Create configuration
    fn create_configuration(&self) -> Result<()> {
        create_dir(&self.config_path)?;

        let strings_path = self.config_path.join("strings/0x409");
        create_dir(&strings_path)?;
        let label = self
            .functions
            .iter()
            .map(|f| f.kind().as_str().to_uppercase())
            .collect::<Vec<_>>()
            .join(" + ");
        write_file(
            &strings_path.join("configuration"),
            &format!("Config 1: {}", label),
        )?;
        write_file(&self.config_path.join("MaxPower"), "250")?;

        debug!("Created configuration c.1");
        Ok(())
    }

    /// Windows only binds RNDIS with Microsoft OS descriptors in place
    fn create_os_desc(&self) -> Result<()> {
        let os_desc = self.gadget_path.join("os_desc");
        create_dir(&os_desc)?;
        write_file(&os_desc.join("use"), "1")?;
        write_file(&os_desc.join("b_vendor_code"), OS_DESC_VENDOR_CODE)?;
        write_file(&os_desc.join("qw_sign"), OS_DESC_SIGN)?;

        let link = os_desc.join("c.1");
        if link.symlink_metadata().is_err() {
            create_symlink(&self.config_path, &link)?;
        }
        debug!("Enabled Microsoft OS descriptors");
        Ok(())
    }
}

#[async_trait]
impl GadgetBuilder for ConfigfsGadget {
    fn gadget_path(&self) -> &Path {
        &self.gadget_path
    }

    async fn configure(&mut self) -> Result<()> {
        info!("Creating USB network gadget at {}", self.gadget_path.display());

        if !self.configfs_root().is_some_and(|root| root.exists()) {
            return Err(AppError::Gadget(
                "ConfigFS not available. Is it mounted at /sys/kernel/config?".to_string(),
            ));
        }

        if self.gadget_path.exists() {
            warn!("Gadget tree already present, rebuilding");
            self.discard().await?;
        }

        create_dir(&self.gadget_path)?;
        self.set_device_descriptors()?;
        self.create_strings()?;
        self.create_configuration()?;

        for func in &self.functions {
            func.create(&self.gadget_path)?;
            func.link(&self.config_path, &self.gadget_path)?;
        }

        if self.needs_os_desc() {
            self.create_os_desc()?;
        }

        info!(
            "USB network gadget configured with {} function(s)",
            self.functions.len()
        );
        Ok(())
    }

    async fn discard(&mut self) -> Result<()> {
        if !self.gadget_path.exists() {
            return Ok(());
        }

        info!("Removing USB network gadget {}", self.gadget_path.display());

        let _ = remove_file(&self.gadget_path.join("os_desc/c.1"));

        for func in self.functions.iter().rev() {
            let _ = func.unlink(&self.config_path);
        }

        let _ = remove_dir(&self.config_path.join("strings/0x409"));
        let _ = remove_dir(&self.config_path);

        for func in self.functions.iter().rev() {
            let _ = func.cleanup(&self.gadget_path);
        }

        let _ = remove_dir(&self.gadget_path.join("strings/0x409"));

        // Leftovers from a differently configured earlier run
        teardown_gadget(&self.gadget_path)
    }

    fn interfaces(&self) -> Vec<String> {
        self.functions
            .iter()
            .filter_map(|f| f.ifname(&self.gadget_path))
            .collect()
    }
}

/// Builder delegating to an external setup command
///
/// The command is expected to create the gadget tree at `gadget_path`
/// without binding it. Removal uses the generic configfs teardown.
pub struct CommandGadget {
    gadget_path: PathBuf,
    command: Vec<String>,
}

impl CommandGadget {
    pub fn new(config: &GadgetConfig) -> Self {
        Self {
            gadget_path: config.configfs_path.join(&config.name),
            command: config.setup_command.clone(),
        }
    }
}

#[async_trait]
impl GadgetBuilder for CommandGadget {
    fn gadget_path(&self) -> &Path {
        &self.gadget_path
    }

    async fn configure(&mut self) -> Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(AppError::Config("gadget.setup_command is empty".to_string()));
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        info!("Running gadget setup command: {}", self.command.join(" "));
        run_checked(program, &args, SETUP_COMMAND_TIMEOUT).await?;

        if !self.gadget_path.exists() {
            return Err(AppError::Gadget(format!(
                "setup command did not create {}",
                self.gadget_path.display()
            )));
        }
        Ok(())
    }

    async fn discard(&mut self) -> Result<()> {
        teardown_gadget(&self.gadget_path)
    }
}

/// Pick the configured builder
pub fn builder_from_config(config: &GadgetConfig) -> Box<dyn GadgetBuilder> {
    if config.setup_command.is_empty() {
        Box::new(ConfigfsGadget::new(config))
    } else {
        Box::new(CommandGadget::new(config))
    }
}

/// Derive a distinct MAC per function instance by bumping the last octet
fn offset_mac(addr: &str, instance: u8) -> Option<String> {
    let mut octets = addr
        .split(':')
        .map(|o| u8::from_str_radix(o, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    if octets.len() != 6 {
        warn!("Ignoring malformed MAC address {:?}", addr);
        return None;
    }
    octets[5] = octets[5].wrapping_add(instance);
    Some(
        octets
            .iter()
            .map(|o| format!("{:02x}", o))
            .collect::<Vec<_>>()
            .join(":"),
    )
}
