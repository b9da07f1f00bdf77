//! Connectivity prober
//!
//! Finds the tethered host's address and decides whether it is still there.
//! A host that stops answering ICMP but keeps a valid ARP entry is treated as
//! idle (asleep, screen off) rather than gone.

use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

use super::neighbor::{has_valid_entry, select_host};
use super::probe::NetProbe;
use super::Subnet;
use crate::config::ProbeConfig;
use crate::link::UsbState;

/// Outcome of a reachability check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

pub struct ConnectivityProber {
    probe: Arc<dyn NetProbe>,
    config: ProbeConfig,
}

impl ConnectivityProber {
    pub fn new(probe: Arc<dyn NetProbe>, config: ProbeConfig) -> Self {
        Self { probe, config }
    }

    /// Subnet used to filter neighbors and derive the broadcast address
    ///
    /// The interface's own address wins; the configured subnet covers links
    /// that have not been addressed yet.
    fn subnet_for(&self, iface: &str) -> Option<Subnet> {
        self.probe.interface_subnet(iface).or(self.config.subnet)
    }

    /// Resolve the host's address on `iface`
    ///
    /// `cached` (last seen or persisted address) is returned as-is. Otherwise
    /// the neighbor table is consulted, and if that has no usable entry a
    /// broadcast probe is sent and the table is read once more.
    pub async fn get_host_address(&self, iface: &str, cached: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
        if cached.is_some() {
            return cached;
        }

        let subnet = self.subnet_for(iface);
        if let Some(addr) = select_host(&self.probe.neighbors(iface).await, subnet.as_ref()) {
            return Some(addr);
        }

        self.refresh_neighbor_table(iface).await;
        tokio::time::sleep(self.config.discovery_wait()).await;

        let found = select_host(&self.probe.neighbors(iface).await, subnet.as_ref());
        if let Some(addr) = found {
            info!("Discovered host {} on {}", addr, iface);
        }
        found
    }

    /// Check whether the host at `address` is still reachable
    ///
    /// Any echo reply is success and clears `idle`. Without a reply, a valid
    /// neighbor entry keeps the link alive as idle, except on a configured
    /// link with no entry at all, which is a hard failure.
    pub async fn verify_reachability(
        &self,
        iface: &str,
        address: Ipv4Addr,
        usb_state: UsbState,
        idle: &mut bool,
    ) -> Reachability {
        for attempt in 1..=self.config.count {
            if self.probe.ping(iface, address, self.config.timeout()).await {
                if *idle {
                    info!("Host {} on {} resumed from idle", address, iface);
                    *idle = false;
                }
                return Reachability::Reachable;
            }
            debug!(
                "No echo reply from {} on {} ({}/{})",
                address, iface, attempt, self.config.count
            );
        }

        let entries = self.probe.neighbors(iface).await;
        if has_valid_entry(&entries, address) {
            if !*idle {
                info!(
                    "Host {} on {} silent but still in neighbor table, assuming idle",
                    address, iface
                );
                *idle = true;
            }
            return Reachability::Reachable;
        }

        if usb_state == UsbState::Configured {
            debug!(
                "Host {} on {} unreachable with configured link and no neighbor entry",
                address, iface
            );
        } else {
            debug!(
                "Host {} on {} unreachable, link {}",
                address, iface, usb_state
            );
        }
        Reachability::Unreachable
    }

    /// Provoke ARP traffic with one broadcast echo; best effort
    pub async fn refresh_neighbor_table(&self, iface: &str) {
        match self.subnet_for(iface) {
            Some(subnet) => {
                self.probe
                    .broadcast_ping(iface, subnet.broadcast(), self.config.timeout())
                    .await;
            }
            None => debug!("{} has no subnet, skipping neighbor refresh", iface),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Result;
    use crate::net::neighbor::{NeighborEntry, NeighborState};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted network shared with the keeper tests
    #[derive(Default)]
    pub(crate) struct FakeNet {
        pub replies: Mutex<HashMap<Ipv4Addr, bool>>,
        pub neighbors: Mutex<Vec<NeighborEntry>>,
        /// Entries that appear only after a broadcast
        pub discoverable: Mutex<Vec<NeighborEntry>>,
        pub subnet: Mutex<Option<Subnet>>,
        pub pings: Mutex<u32>,
        pub broadcasts: Mutex<Vec<Ipv4Addr>>,
        pub links_up: Mutex<Vec<String>>,
    }

    impl FakeNet {
        pub fn set_reply(&self, addr: Ipv4Addr, reply: bool) {
            self.replies.lock().unwrap().insert(addr, reply);
        }

        pub fn set_neighbor(&self, addr: Ipv4Addr, state: NeighborState) {
            let mut neighbors = self.neighbors.lock().unwrap();
            neighbors.retain(|e| e.address != addr);
            neighbors.push(NeighborEntry {
                address: addr,
                lladdr: Some("02:00:00:00:00:01".to_string()),
                state,
            });
        }

        pub fn clear_neighbors(&self) {
            self.neighbors.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl NetProbe for FakeNet {
        async fn ping(&self, _iface: &str, addr: Ipv4Addr, _timeout: Duration) -> bool {
            *self.pings.lock().unwrap() += 1;
            self.replies.lock().unwrap().get(&addr).copied().unwrap_or(false)
        }

        async fn broadcast_ping(&self, _iface: &str, broadcast: Ipv4Addr, _timeout: Duration) {
            self.broadcasts.lock().unwrap().push(broadcast);
            let found: Vec<_> = self.discoverable.lock().unwrap().drain(..).collect();
            self.neighbors.lock().unwrap().extend(found);
        }

        async fn neighbors(&self, _iface: &str) -> Vec<NeighborEntry> {
            self.neighbors.lock().unwrap().clone()
        }

        fn interface_subnet(&self, _iface: &str) -> Option<Subnet> {
            *self.subnet.lock().unwrap()
        }

        async fn link_up(&self, iface: &str) -> Result<()> {
            self.links_up.lock().unwrap().push(iface.to_string());
            Ok(())
        }
    }

    pub(crate) const HOST: Ipv4Addr = Ipv4Addr::new(198, 18, 42, 17);

    fn prober(net: &Arc<FakeNet>) -> ConnectivityProber {
        let config = ProbeConfig {
            discovery_wait_ms: 0,
            ..Default::default()
        };
        ConnectivityProber::new(net.clone(), config)
    }

    #[tokio::test]
    async fn test_cached_address_wins() {
        let net = Arc::new(FakeNet::default());
        net.set_neighbor(Ipv4Addr::new(198, 18, 42, 99), NeighborState::Reachable);
        let addr = prober(&net).get_host_address("usb0", Some(HOST)).await;
        assert_eq!(addr, Some(HOST));
    }

    #[tokio::test]
    async fn test_neighbor_lookup_skips_invalid() {
        let net = Arc::new(FakeNet::default());
        net.set_neighbor(Ipv4Addr::new(198, 18, 42, 30), NeighborState::Incomplete);
        net.set_neighbor(HOST, NeighborState::Stale);
        assert_eq!(prober(&net).get_host_address("usb0", None).await, Some(HOST));
    }

    #[tokio::test]
    async fn test_discovery_after_broadcast() {
        let net = Arc::new(FakeNet::default());
        *net.subnet.lock().unwrap() = Some("198.18.42.1/24".parse().unwrap());
        net.discoverable.lock().unwrap().push(NeighborEntry {
            address: HOST,
            lladdr: None,
            state: NeighborState::Reachable,
        });

        assert_eq!(prober(&net).get_host_address("usb0", None).await, Some(HOST));
        assert_eq!(
            net.broadcasts.lock().unwrap().as_slice(),
            &[Ipv4Addr::new(198, 18, 42, 255)]
        );
    }

    #[tokio::test]
    async fn test_no_subnet_no_broadcast() {
        let net = Arc::new(FakeNet::default());
        assert_eq!(prober(&net).get_host_address("usb0", None).await, None);
        assert!(net.broadcasts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_configured_subnet_fallback() {
        let net = Arc::new(FakeNet::default());
        let config = ProbeConfig {
            subnet: Some("10.55.0.0/16".parse().unwrap()),
            ..Default::default()
        };
        let prober = ConnectivityProber::new(net.clone(), config);
        prober.refresh_neighbor_table("usb0").await;
        assert_eq!(
            net.broadcasts.lock().unwrap().as_slice(),
            &[Ipv4Addr::new(10, 55, 255, 255)]
        );
    }

    #[tokio::test]
    async fn test_reply_clears_idle() {
        let net = Arc::new(FakeNet::default());
        net.set_reply(HOST, true);
        let mut idle = true;
        let result = prober(&net)
            .verify_reachability("usb0", HOST, UsbState::Configured, &mut idle)
            .await;
        assert_eq!(result, Reachability::Reachable);
        assert!(!idle);
    }

    #[tokio::test]
    async fn test_silent_host_with_arp_is_idle() {
        let net = Arc::new(FakeNet::default());
        net.set_neighbor(HOST, NeighborState::Stale);
        let mut idle = false;
        let result = prober(&net)
            .verify_reachability("usb0", HOST, UsbState::Configured, &mut idle)
            .await;
        assert_eq!(result, Reachability::Reachable);
        assert!(idle);
        assert_eq!(*net.pings.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_configured_without_arp_is_hard_failure() {
        let net = Arc::new(FakeNet::default());
        net.set_neighbor(HOST, NeighborState::Failed);
        let mut idle = false;
        let result = prober(&net)
            .verify_reachability("usb0", HOST, UsbState::Configured, &mut idle)
            .await;
        assert_eq!(result, Reachability::Unreachable);
        assert!(!idle);
    }

    #[tokio::test]
    async fn test_unconfigured_uses_neighbor_fallback() {
        let net = Arc::new(FakeNet::default());
        net.set_neighbor(HOST, NeighborState::Delay);
        let mut idle = false;
        let result = prober(&net)
            .verify_reachability("usb0", HOST, UsbState::Suspended, &mut idle)
            .await;
        assert_eq!(result, Reachability::Reachable);

        net.clear_neighbors();
        let result = prober(&net)
            .verify_reachability("usb0", HOST, UsbState::Suspended, &mut idle)
            .await;
        assert_eq!(result, Reachability::Unreachable);
    }
}
