//! Neighbor (ARP) table parsing
//!
//! `ip -j neigh` output is preferred. Older iproute2 builds without JSON
//! support fall back to the text form, parsed without assuming fixed columns.

use serde::Deserialize;
use std::net::Ipv4Addr;

use super::Subnet;

/// Kernel neighbor entry state (NUD_*)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Reachable,
    Stale,
    Delay,
    Probe,
    Incomplete,
    Failed,
    Noarp,
    Permanent,
    Unknown,
}

impl NeighborState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "REACHABLE" => Self::Reachable,
            "STALE" => Self::Stale,
            "DELAY" => Self::Delay,
            "PROBE" => Self::Probe,
            "INCOMPLETE" => Self::Incomplete,
            "FAILED" => Self::Failed,
            "NOARP" => Self::Noarp,
            "PERMANENT" => Self::Permanent,
            _ => Self::Unknown,
        }
    }

    /// A host that answered ARP recently enough to be believed present
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Reachable | Self::Stale | Self::Delay)
    }

    fn preference(&self) -> u8 {
        match self {
            Self::Reachable => 0,
            Self::Delay => 1,
            Self::Stale => 2,
            _ => u8::MAX,
        }
    }
}

/// One neighbor table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub address: Ipv4Addr,
    pub lladdr: Option<String>,
    pub state: NeighborState,
}

#[derive(Debug, Deserialize)]
struct RawNeighbor {
    dst: String,
    #[serde(default)]
    lladdr: Option<String>,
    #[serde(default)]
    state: Vec<String>,
}

/// Parse `ip -j neigh show` output. `None` when the text is not JSON.
pub fn parse_json(text: &str) -> Option<Vec<NeighborEntry>> {
    let raw: Vec<RawNeighbor> = serde_json::from_str(text.trim()).ok()?;
    Some(
        raw.into_iter()
            .filter_map(|n| {
                let address = n.dst.parse().ok()?;
                let state = n
                    .state
                    .iter()
                    .map(|s| NeighborState::parse(s))
                    .find(|s| *s != NeighborState::Unknown)
                    .unwrap_or(NeighborState::Unknown);
                Some(NeighborEntry {
                    address,
                    lladdr: n.lladdr,
                    state,
                })
            })
            .collect(),
    )
}

/// Parse `ip neigh show` text output
///
/// Lines look like `198.18.42.17 dev usb0 lladdr 02:00:00:00:00:01 REACHABLE`
/// with `dev` omitted when filtering by device, and `lladdr` missing for
/// incomplete entries. IPv6 and unparseable lines are skipped.
pub fn parse_text(text: &str) -> Vec<NeighborEntry> {
    text.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let address: Ipv4Addr = tokens.next()?.parse().ok()?;
            let mut lladdr = None;
            let mut state = NeighborState::Unknown;

            while let Some(token) = tokens.next() {
                if token == "lladdr" {
                    lladdr = tokens.next().map(str::to_string);
                    continue;
                }
                let parsed = NeighborState::parse(token);
                if parsed != NeighborState::Unknown {
                    state = parsed;
                }
            }

            Some(NeighborEntry {
                address,
                lladdr,
                state,
            })
        })
        .collect()
}

/// Best host candidate: valid state, inside `subnet` when given, REACHABLE
/// preferred over DELAY over STALE
pub fn select_host(entries: &[NeighborEntry], subnet: Option<&Subnet>) -> Option<Ipv4Addr> {
    entries
        .iter()
        .filter(|e| e.state.is_valid())
        .filter(|e| subnet.map_or(true, |s| s.contains(e.address)))
        .min_by_key(|e| e.state.preference())
        .map(|e| e.address)
}

/// Whether `address` has a valid entry
pub fn has_valid_entry(entries: &[NeighborEntry], address: Ipv4Addr) -> bool {
    entries
        .iter()
        .any(|e| e.address == address && e.state.is_valid())
}
