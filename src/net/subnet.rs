//! IPv4 subnet used for host discovery

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{AppError, Result};

/// IPv4 network in CIDR form, e.g. `198.18.42.0/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    /// Build from any address inside the network; host bits are cleared
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(AppError::Config(format!(
                "invalid prefix length /{}",
                prefix_len
            )));
        }
        let mask = Self::mask_for(prefix_len);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix_len,
        })
    }

    fn mask_for(prefix_len: u8) -> u32 {
        match prefix_len {
            0 => 0,
            n => u32::MAX << (32 - u32::from(n)),
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask_for(self.prefix_len) == u32::from(self.network)
    }

    /// Directed broadcast address
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !Self::mask_for(self.prefix_len))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s.trim().split_once('/').unwrap_or((s.trim(), "24"));
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| AppError::Config(format!("invalid subnet address: {}", s)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| AppError::Config(format!("invalid subnet prefix: {}", s)))?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Subnet {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_broadcast() {
        let subnet: Subnet = "198.18.42.0/24".parse().unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(198, 18, 42, 0));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(198, 18, 42, 255));
        assert!(subnet.contains(Ipv4Addr::new(198, 18, 42, 17)));
        assert!(!subnet.contains(Ipv4Addr::new(198, 18, 43, 17)));
    }

    #[test]
    fn test_host_bits_cleared() {
        let subnet = Subnet::new(Ipv4Addr::new(10, 55, 0, 1), 29).unwrap();
        assert_eq!(subnet.to_string(), "10.55.0.0/29");
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(10, 55, 0, 7));
    }

    #[test]
    fn test_bare_address_defaults_to_24() {
        let subnet: Subnet = "198.18.42.1".parse().unwrap();
        assert_eq!(subnet.to_string(), "198.18.42.0/24");
    }

    #[test]
    fn test_edge_prefixes() {
        let all: Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(all.broadcast(), Ipv4Addr::BROADCAST);

        let host: Subnet = "198.18.42.17/32".parse().unwrap();
        assert!(host.contains(Ipv4Addr::new(198, 18, 42, 17)));
        assert_eq!(host.broadcast(), Ipv4Addr::new(198, 18, 42, 17));
    }

    #[test]
    fn test_invalid() {
        assert!("198.18.42.0/33".parse::<Subnet>().is_err());
        assert!("198.18.42/24".parse::<Subnet>().is_err());
        assert!("usb0".parse::<Subnet>().is_err());
    }
}
