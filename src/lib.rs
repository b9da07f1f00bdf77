//! usbnet-keeper - keeps a USB-tethered Ethernet gadget usable
//!
//! Watches the USB device controller, the host's suspend signals and the
//! host's reachability over the gadget's network interface(s), and forces a
//! re-enumeration only when the host is awake and the link is really stuck.

pub mod config;
pub mod error;
pub mod gadget;
pub mod link;
pub mod monitor;
pub mod net;
pub mod persist;
pub mod policy;
pub mod utils;

pub use error::{AppError, Result};
