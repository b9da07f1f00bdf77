use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::gadget::NetFunctionKind;
use crate::net::Subnet;

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    /// Enable the verbose decision-trace channel
    pub debug: bool,
    /// Control loop settings
    pub monitor: MonitorConfig,
    /// Reachability probing settings
    pub probe: ProbeConfig,
    /// Reset decision thresholds
    pub policy: PolicyConfig,
    /// Kernel status file locations
    pub observer: ObserverConfig,
    /// Gadget lifecycle settings
    pub gadget: GadgetConfig,
    /// Persisted link status
    pub store: StoreConfig,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            debug: false,
            monitor: MonitorConfig::default(),
            probe: ProbeConfig::default(),
            policy: PolicyConfig::default(),
            observer: ObserverConfig::default(),
            gadget: GadgetConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl KeeperConfig {
    /// Reject configurations the control loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.monitor.interfaces.is_empty() {
            return Err(AppError::Config(
                "at least one interface must be monitored".to_string(),
            ));
        }
        if let Some(name) = self.monitor.interfaces.iter().find(|n| !valid_ifname(n)) {
            return Err(AppError::Config(format!("invalid interface name: {:?}", name)));
        }

        let intervals = [
            ("monitor.normal_interval_ms", self.monitor.normal_interval_ms),
            ("monitor.fast_interval_ms", self.monitor.fast_interval_ms),
            ("monitor.short_interval_ms", self.monitor.short_interval_ms),
            ("monitor.suspended_interval_ms", self.monitor.suspended_interval_ms),
            ("monitor.not_bound_retry_ms", self.monitor.not_bound_retry_ms),
            ("probe.timeout_ms", self.probe.timeout_ms),
            ("gadget.controller_poll_ms", self.gadget.controller_poll_ms),
        ];
        for (key, value) in intervals {
            if value == 0 {
                return Err(AppError::Config(format!("{} must be greater than zero", key)));
            }
        }

        let thresholds = [
            ("policy.not_attached_threshold", self.policy.not_attached_threshold),
            ("policy.reconnect_threshold", self.policy.reconnect_threshold),
            ("policy.post_wake_fast_threshold", self.policy.post_wake_fast_threshold),
            ("probe.count", self.probe.count),
        ];
        for (key, value) in thresholds {
            if value == 0 {
                return Err(AppError::Config(format!("{} must be at least 1", key)));
            }
        }

        if self.policy.grace_period_ms >= self.policy.turbo_window_ms {
            return Err(AppError::Config(format!(
                "policy.grace_period_ms ({}) must be shorter than policy.turbo_window_ms ({})",
                self.policy.grace_period_ms, self.policy.turbo_window_ms
            )));
        }

        if self.gadget.functions.is_empty() && self.gadget.setup_command.is_empty() {
            return Err(AppError::Config(
                "gadget.functions is empty and no gadget.setup_command is set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Linux limits interface names to IFNAMSIZ - 1 bytes without '/' or whitespace
fn valid_ifname(name: &str) -> bool {
    !name.is_empty()
        && name.len() < 16
        && !name.contains('/')
        && !name.chars().any(char::is_whitespace)
}

/// Control loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Network interfaces backed by the gadget (e.g. usb0 for ECM, usb1 for RNDIS)
    pub interfaces: Vec<String>,
    /// Tick interval while every link is connected
    pub normal_interval_ms: u64,
    /// Tick interval while connected inside the post-wake turbo window
    pub fast_interval_ms: u64,
    /// Tick interval while any link is waiting or disconnected
    pub short_interval_ms: u64,
    /// Tick interval while the bus is suspended
    pub suspended_interval_ms: u64,
    /// Delay between setup attempts while no gadget is bound
    pub not_bound_retry_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interfaces: vec!["usb0".to_string()],
            normal_interval_ms: 5000,
            fast_interval_ms: 1000,
            short_interval_ms: 2000,
            suspended_interval_ms: 1000,
            not_bound_retry_ms: 10_000,
        }
    }
}

impl MonitorConfig {
    pub fn normal_interval(&self) -> Duration {
        Duration::from_millis(self.normal_interval_ms)
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_interval_ms)
    }

    pub fn short_interval(&self) -> Duration {
        Duration::from_millis(self.short_interval_ms)
    }

    pub fn suspended_interval(&self) -> Duration {
        Duration::from_millis(self.suspended_interval_ms)
    }

    pub fn not_bound_retry(&self) -> Duration {
        Duration::from_millis(self.not_bound_retry_ms)
    }
}

/// Reachability probe configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    /// ICMP echo probes per reachability check
    pub count: u32,
    /// Per-probe timeout
    pub timeout_ms: u64,
    /// Wait after a broadcast probe before re-reading the neighbor table
    pub discovery_wait_ms: u64,
    /// Host subnet (e.g. "198.18.42.0/24"). Neighbor entries outside it are
    /// ignored, and it supplies the broadcast address while the interface
    /// has no address of its own.
    pub subnet: Option<Subnet>,
    /// ping binary
    pub ping_command: String,
    /// iproute2 binary
    pub ip_command: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            count: 2,
            timeout_ms: 1000,
            discovery_wait_ms: 500,
            subnet: None,
            ping_command: "ping".to_string(),
            ip_command: "ip".to_string(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn discovery_wait(&self) -> Duration {
        Duration::from_millis(self.discovery_wait_ms)
    }
}

/// Reset decision thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Consecutive not-attached checks before a reset (≈50s at 2s ticks)
    pub not_attached_threshold: u32,
    /// Failed checks before resetting a link that worked before (≈6s)
    pub reconnect_threshold: u32,
    /// Failed checks before a reset inside the post-wake turbo window
    pub post_wake_fast_threshold: u32,
    /// Length of the post-wake turbo window
    pub turbo_window_ms: u64,
    /// Post-wake period during which no decision is taken
    pub grace_period_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            not_attached_threshold: 25,
            reconnect_threshold: 3,
            post_wake_fast_threshold: 1,
            turbo_window_ms: 15_000,
            grace_period_ms: 1000,
        }
    }
}

impl PolicyConfig {
    pub fn turbo_window(&self) -> Duration {
        Duration::from_millis(self.turbo_window_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Kernel status file locations
///
/// `{udc}` in a path is replaced with the controller name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObserverConfig {
    /// UDC (USB Device Controller) name; first one found when unset
    pub udc: Option<String>,
    /// Directory listing available controllers
    pub udc_class_dir: PathBuf,
    /// Gadget state attribute
    pub state_path: String,
    /// Gadget suspend flag attribute
    pub suspended_path: String,
    /// Controller register dump containing the DSTS register
    pub regdump_path: Option<String>,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            udc: None,
            udc_class_dir: PathBuf::from("/sys/class/udc"),
            state_path: "/sys/class/udc/{udc}/state".to_string(),
            suspended_path: "/sys/class/udc/{udc}/device/gadget/suspended".to_string(),
            regdump_path: Some("/sys/kernel/debug/{udc}/regdump".to_string()),
        }
    }
}

/// Gadget lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GadgetConfig {
    /// ConfigFS base path for USB gadgets
    pub configfs_path: PathBuf,
    /// Gadget directory name
    pub name: String,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Manufacturer string
    pub manufacturer: String,
    /// Product string
    pub product: String,
    /// Serial number
    pub serial_number: String,
    /// Network functions, one per monitored interface
    pub functions: Vec<NetFunctionKind>,
    /// Fixed host-side MAC so the host keeps the same interface across resets
    pub host_addr: Option<String>,
    /// Fixed device-side MAC
    pub dev_addr: Option<String>,
    /// External descriptor builder; replaces the built-in configfs builder when set
    pub setup_command: Vec<String>,
    /// Controller kernel module (e.g. "dwc2"); driver load/reload is skipped when unset
    pub driver_module: Option<String>,
    /// Driver unload/reload attempts when no controller appears
    pub driver_reload_attempts: u32,
    /// Wait after each driver reload
    pub driver_reload_wait_ms: u64,
    /// Controller availability poll period
    pub controller_poll_ms: u64,
    /// Controller poll budget on the runtime reset path
    pub runtime_controller_ticks: u32,
    /// Controller poll budget on the boot path
    pub boot_controller_ticks: u32,
    /// Log per-step timings during boot setup
    pub timing: bool,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            configfs_path: PathBuf::from("/sys/kernel/config/usb_gadget"),
            name: "usbnet".to_string(),
            vendor_id: 0x1d6b,  // Linux Foundation
            product_id: 0x0104, // Multifunction Composite Gadget
            manufacturer: "usbnet-keeper".to_string(),
            product: "USB Ethernet Gadget".to_string(),
            serial_number: "0123456789".to_string(),
            functions: vec![NetFunctionKind::Ecm],
            host_addr: None,
            dev_addr: None,
            setup_command: Vec::new(),
            driver_module: None,
            driver_reload_attempts: 2,
            driver_reload_wait_ms: 2000,
            controller_poll_ms: 500,
            runtime_controller_ticks: 10,
            boot_controller_ticks: 60,
            timing: false,
        }
    }
}

impl GadgetConfig {
    pub fn controller_poll(&self) -> Duration {
        Duration::from_millis(self.controller_poll_ms)
    }

    pub fn driver_reload_wait(&self) -> Duration {
        Duration::from_millis(self.driver_reload_wait_ms)
    }
}

/// Persisted link status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// `interface:status:hostIp:connectedOnce` file
    pub state_file: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("/var/lib/usbnet-keeper/link-status"),
        }
    }
}
