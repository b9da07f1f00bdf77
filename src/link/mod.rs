//! Link and host power observation

pub mod observer;
pub mod power;

pub use observer::{LinkObserver, Signal, SysfsObserver, UsbState};
pub use power::{determine_event, PowerEvent, PowerOutcome, PowerState};
