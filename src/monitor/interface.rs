//! Per-interface state owned by the control loop

use std::net::Ipv4Addr;

use crate::link::UsbState;
use crate::persist::{LinkStatus, PersistentRecord};
use crate::policy::{Counters, LinkSnapshot};

#[derive(Debug, Clone)]
pub struct InterfaceState {
    pub name: String,
    /// Last observed USB state; `Unknown` until the first good read
    pub usb_state: UsbState,
    pub connection: LinkStatus,
    /// Host silent but still present in the neighbor table
    pub is_idle: bool,
    /// Last known reachability; edge-triggers connect/lost logging
    pub is_connected: bool,
    pub counters: Counters,
    pub last_host_ip: Option<Ipv4Addr>,
    pub suspended_logged: bool,
    pub link_down_logged: bool,
}

impl InterfaceState {
    /// Fresh state, seeded with the persisted status and host address
    pub fn new(name: &str, record: Option<&PersistentRecord>) -> Self {
        Self {
            name: name.to_string(),
            usb_state: UsbState::Unknown,
            connection: record.map(|r| r.status).unwrap_or_default(),
            is_idle: false,
            is_connected: false,
            counters: Counters::default(),
            last_host_ip: record.and_then(|r| r.host_ip),
            suspended_logged: false,
            link_down_logged: false,
        }
    }

    pub fn reset_counters(&mut self) {
        self.counters.reset();
    }

    /// Forget everything learned about the host; used after a gadget reset,
    /// which makes the host re-enumerate and possibly re-address the link
    pub fn clear_after_reset(&mut self) {
        self.counters.reset();
        self.is_connected = false;
        self.is_idle = false;
        self.last_host_ip = None;
        self.suspended_logged = false;
        self.link_down_logged = false;
    }

    pub fn snapshot(&self, was_connected: bool) -> LinkSnapshot<'_> {
        LinkSnapshot {
            iface: &self.name,
            usb_state: self.usb_state,
            counters: self.counters,
            was_connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_from_record() {
        let record = PersistentRecord::parse_line("usb0:connected:198.18.42.17:true").unwrap();
        let state = InterfaceState::new("usb0", Some(&record));
        assert_eq!(state.connection, LinkStatus::Connected);
        assert_eq!(state.last_host_ip, Some(Ipv4Addr::new(198, 18, 42, 17)));
        assert_eq!(state.usb_state, UsbState::Unknown);
        assert!(!state.is_connected);

        let fresh = InterfaceState::new("usb1", None);
        assert_eq!(fresh.connection, LinkStatus::Disconnected);
        assert_eq!(fresh.last_host_ip, None);
    }

    #[test]
    fn test_clear_after_reset() {
        let mut state = InterfaceState::new("usb0", None);
        state.counters.fail_no_ping = 3;
        state.counters.not_attached = 7;
        state.is_connected = true;
        state.is_idle = true;
        state.last_host_ip = Some(Ipv4Addr::new(198, 18, 42, 17));

        state.clear_after_reset();
        assert!(state.counters == Counters::default());
        assert!(!state.is_connected);
        assert!(!state.is_idle);
        assert_eq!(state.last_host_ip, None);
    }
}
