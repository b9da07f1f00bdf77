//! Network probing backend
//!
//! The prober and the gadget lifecycle talk to the network stack only
//! through [`NetProbe`], so the decision logic can run against a scripted
//! network in tests.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, trace};

use super::neighbor::{self, NeighborEntry};
use super::Subnet;
use crate::config::ProbeConfig;
use crate::error::Result;
use crate::utils::{run_checked, run_command};

/// Slack on top of a probe timeout before the subprocess is killed
const COMMAND_SLACK: Duration = Duration::from_secs(2);

/// Deadline for neighbor queries and link commands
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Network probing backend
#[async_trait]
pub trait NetProbe: Send + Sync {
    /// Send one ICMP echo to `addr` out of `iface`; true on reply
    async fn ping(&self, iface: &str, addr: Ipv4Addr, timeout: Duration) -> bool;

    /// Send one broadcast ICMP echo to provoke neighbor discovery
    async fn broadcast_ping(&self, iface: &str, broadcast: Ipv4Addr, timeout: Duration);

    /// IPv4 neighbor entries on `iface`; empty when the query fails
    async fn neighbors(&self, iface: &str) -> Vec<NeighborEntry>;

    /// The interface's own IPv4 subnet, if it has an address
    fn interface_subnet(&self, iface: &str) -> Option<Subnet>;

    /// Set the interface administratively up
    async fn link_up(&self, iface: &str) -> Result<()>;
}

/// [`NetProbe`] backed by iputils `ping`, iproute2 and `getifaddrs(3)`
pub struct SystemNetProbe {
    ping_command: String,
    ip_command: String,
}

impl SystemNetProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            ping_command: config.ping_command.clone(),
            ip_command: config.ip_command.clone(),
        }
    }

    /// ping's -W takes whole seconds on older iputils
    fn wait_arg(timeout: Duration) -> String {
        timeout.as_secs().max(1).to_string()
    }
}

#[async_trait]
impl NetProbe for SystemNetProbe {
    async fn ping(&self, iface: &str, addr: Ipv4Addr, timeout: Duration) -> bool {
        let wait = Self::wait_arg(timeout);
        let target = addr.to_string();
        let args = ["-c", "1", "-W", wait.as_str(), "-I", iface, target.as_str()];

        match run_command(&self.ping_command, &args, timeout + COMMAND_SLACK).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!("ping {} via {} failed to run: {}", addr, iface, e);
                false
            }
        }
    }

    async fn broadcast_ping(&self, iface: &str, broadcast: Ipv4Addr, timeout: Duration) {
        let wait = Self::wait_arg(timeout);
        let target = broadcast.to_string();
        let args = [
            "-b",
            "-c",
            "1",
            "-W",
            wait.as_str(),
            "-I",
            iface,
            target.as_str(),
        ];

        if let Err(e) = run_command(&self.ping_command, &args, timeout + COMMAND_SLACK).await {
            debug!("broadcast ping on {} failed to run: {}", iface, e);
        }
    }

    async fn neighbors(&self, iface: &str) -> Vec<NeighborEntry> {
        let json_args = ["-j", "-4", "neigh", "show", "dev", iface];
        if let Ok(output) = run_command(&self.ip_command, &json_args, QUERY_TIMEOUT).await {
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                if let Some(entries) = neighbor::parse_json(&text) {
                    return entries;
                }
                trace!("ip -j neigh output not JSON, falling back to text");
            }
        }

        let text_args = ["-4", "neigh", "show", "dev", iface];
        match run_command(&self.ip_command, &text_args, QUERY_TIMEOUT).await {
            Ok(output) if output.status.success() => {
                neighbor::parse_text(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                debug!(
                    "neighbor query on {} failed: {}",
                    iface,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                Vec::new()
            }
            Err(e) => {
                debug!("neighbor query on {} failed to run: {}", iface, e);
                Vec::new()
            }
        }
    }

    fn interface_subnet(&self, iface: &str) -> Option<Subnet> {
        let addrs = match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("getifaddrs failed: {}", e);
                return None;
            }
        };

        for ifa in addrs {
            if ifa.interface_name != iface {
                continue;
            }
            let Some(sin) = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
                continue;
            };
            let addr = Ipv4Addr::from(sin.ip());
            let prefix_len = ifa
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .map(|m| u32::from(Ipv4Addr::from(m.ip())).count_ones() as u8)
                .unwrap_or(32);
            return Subnet::new(addr, prefix_len).ok();
        }
        None
    }

    async fn link_up(&self, iface: &str) -> Result<()> {
        run_checked(
            &self.ip_command,
            &["link", "set", "dev", iface, "up"],
            QUERY_TIMEOUT,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_arg_rounds_up_to_one_second() {
        assert_eq!(SystemNetProbe::wait_arg(Duration::from_millis(300)), "1");
        assert_eq!(SystemNetProbe::wait_arg(Duration::from_secs(2)), "2");
    }

    #[test]
    fn test_loopback_subnet() {
        let probe = SystemNetProbe::new(&ProbeConfig::default());
        // Loopback exists on any Linux host running the tests
        if let Some(subnet) = probe.interface_subnet("lo") {
            assert!(subnet.contains(Ipv4Addr::LOCALHOST));
        }
        assert!(probe.interface_subnet("usbnet-absent0").is_none());
    }

    #[tokio::test]
    async fn test_missing_tools_degrade() {
        let probe = SystemNetProbe::new(&ProbeConfig {
            ping_command: "/nonexistent/ping".to_string(),
            ip_command: "/nonexistent/ip".to_string(),
            ..Default::default()
        });
        assert!(
            !probe
                .ping("usb0", Ipv4Addr::new(198, 18, 42, 17), Duration::from_millis(100))
                .await
        );
        assert!(probe.neighbors("usb0").await.is_empty());
        assert!(probe.link_up("usb0").await.is_err());
    }
}
