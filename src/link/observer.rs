//! Link/power state observer
//!
//! Pass-through reads of the controller's sysfs/debugfs status. Nothing is
//! cached and no read ever fails: a missing or unreadable file is
//! `Unknown`, and no transition is ever inferred from `Unknown`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

use crate::config::ObserverConfig;
use crate::gadget::configfs::find_udc;

/// USB gadget state as exposed by the UDC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbState {
    NotAttached,
    Suspended,
    Configured,
    Unknown,
}

impl UsbState {
    /// Map the UDC `state` attribute
    ///
    /// Enumeration intermediates (attached/powered/default/addressed) are
    /// reported as `NotAttached`: the link is not usable until the host
    /// selects a configuration.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "configured" => Self::Configured,
            "suspended" => Self::Suspended,
            "not attached" | "attached" | "powered" | "default" | "addressed" => {
                Self::NotAttached
            }
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAttached => "not-attached",
            Self::Suspended => "suspended",
            Self::Configured => "configured",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for UsbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-bit hardware signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// 0
    Clear,
    /// 1
    Set,
    Unknown,
}

impl Signal {
    pub fn from_bit(bit: bool) -> Self {
        if bit {
            Self::Set
        } else {
            Self::Clear
        }
    }

    pub fn is_set(&self) -> bool {
        *self == Self::Set
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Clear => "0",
            Self::Set => "1",
            Self::Unknown => "?",
        })
    }
}

/// Source of link and power observations
pub trait LinkObserver: Send + Sync {
    /// Gadget state of the controller
    fn usb_state(&self) -> UsbState;

    /// Gadget `suspended` flag
    fn suspend_flag(&self) -> Signal;

    /// SuspSts bit of the controller's DSTS register
    fn debug_suspend_bit(&self) -> Signal;
}

/// [`LinkObserver`] reading the kernel's UDC attributes
pub struct SysfsObserver {
    config: ObserverConfig,
}

impl SysfsObserver {
    pub fn new(config: ObserverConfig) -> Self {
        Self { config }
    }

    /// Configured UDC, else the first one present
    pub fn udc_name(&self) -> Option<String> {
        self.config
            .udc
            .clone()
            .or_else(|| find_udc(&self.config.udc_class_dir))
    }

    fn resolve(&self, template: &str) -> Option<PathBuf> {
        if template.contains("{udc}") {
            let udc = self.udc_name()?;
            Some(PathBuf::from(template.replace("{udc}", &udc)))
        } else {
            Some(PathBuf::from(template))
        }
    }

    fn read(path: &Path) -> Option<String> {
        match fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(e) => {
                trace!("read {} failed: {}", path.display(), e);
                None
            }
        }
    }
}

impl LinkObserver for SysfsObserver {
    fn usb_state(&self) -> UsbState {
        self.resolve(&self.config.state_path)
            .and_then(|p| Self::read(&p))
            .map(|s| UsbState::parse(&s))
            .unwrap_or(UsbState::Unknown)
    }

    fn suspend_flag(&self) -> Signal {
        self.resolve(&self.config.suspended_path)
            .and_then(|p| Self::read(&p))
            .map(|s| parse_flag(&s))
            .unwrap_or(Signal::Unknown)
    }

    fn debug_suspend_bit(&self) -> Signal {
        self.config
            .regdump_path
            .as_deref()
            .and_then(|t| self.resolve(t))
            .and_then(|p| Self::read(&p))
            .map(|s| parse_dsts_suspend(&s))
            .unwrap_or(Signal::Unknown)
    }
}

fn parse_flag(raw: &str) -> Signal {
    match raw.trim() {
        "0" => Signal::Clear,
        "1" => Signal::Set,
        _ => Signal::Unknown,
    }
}

/// Extract DSTS bit 0 (SuspSts) from a register dump
///
/// Accepts `DSTS = 0x00000001` (dwc2) as well as `DSTS: 0x...` and bare hex.
pub fn parse_dsts_suspend(dump: &str) -> Signal {
    let Some(line) = dump.lines().find(|l| {
        let name = l.trim_start();
        name.starts_with("DSTS") && !name.starts_with("DSTSCTL")
    }) else {
        return Signal::Unknown;
    };

    let value = line
        .trim_start()
        .trim_start_matches("DSTS")
        .trim_start_matches(|c: char| c == ' ' || c == '=' || c == ':' || c == '\t')
        .split_whitespace()
        .next()
        .unwrap_or("");
    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);

    match u32::from_str_radix(hex, 16) {
        Ok(reg) => Signal::from_bit(reg & 1 != 0),
        Err(_) => Signal::Unknown,
    }
}
