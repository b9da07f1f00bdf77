//! Persisted per-interface link status
//!
//! One line per interface, `interface:status:hostIp:connectedOnce`, e.g.
//!
//! ```text
//! usb0:connected:198.18.42.17:true
//! usb1:waiting::false
//! ```
//!
//! The file is rewritten atomically (temp file + rename) on every status
//! change so external diagnostics never observe a half-written record.
//! `connectedOnce` is sticky: once an interface has reached a host it stays
//! `true` across restarts, and it selects between the patient and the fast
//! recovery policies.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// Link connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    /// USB not attached, no host
    #[default]
    Disconnected,
    /// Attached, host not (yet) reachable
    Waiting,
    /// Host reachable
    Connected,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Waiting => "waiting",
            LinkStatus::Connected => "connected",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disconnected" => Ok(LinkStatus::Disconnected),
            "waiting" => Ok(LinkStatus::Waiting),
            "connected" => Ok(LinkStatus::Connected),
            other => Err(AppError::Internal(format!("unknown link status: {}", other))),
        }
    }
}

/// Durable record for one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentRecord {
    pub interface: String,
    pub status: LinkStatus,
    pub host_ip: Option<Ipv4Addr>,
    pub connected_once: bool,
}

impl PersistentRecord {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            status: LinkStatus::Disconnected,
            host_ip: None,
            connected_once: false,
        }
    }

    /// Serialize to a state file line (without newline)
    pub fn to_line(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.interface,
            self.status,
            self.host_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            self.connected_once
        )
    }

    /// Parse one state file line
    ///
    /// The first field is the interface and the last one the flag; the
    /// address field may be empty.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        let (interface, rest) = line.split_once(':')?;
        let (status, rest) = rest.split_once(':')?;
        let (host_ip, connected_once) = rest.rsplit_once(':')?;

        if interface.is_empty() {
            return None;
        }
        let host_ip = match host_ip {
            "" => None,
            ip => Some(ip.parse().ok()?),
        };

        Some(Self {
            interface: interface.to_string(),
            status: status.parse().ok()?,
            host_ip,
            connected_once: connected_once.parse().ok()?,
        })
    }
}

/// Read all records from a state file
///
/// This is the diagnostics read path: malformed lines are skipped and a
/// missing file is an empty set.
pub fn read_records(path: &Path) -> Result<BTreeMap<String, PersistentRecord>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => {
            return Err(AppError::StateFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        }
    };

    let mut records = BTreeMap::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match PersistentRecord::parse_line(line) {
            Some(record) => {
                records.insert(record.interface.clone(), record);
            }
            None => warn!("Ignoring malformed state line in {}: {:?}", path.display(), line),
        }
    }
    Ok(records)
}

/// Persistent state store
///
/// Holds the records in memory (the daemon is the only writer) and writes
/// the whole file through on each change. A failed write leaves the store
/// dirty and the next update rewrites the file even if nothing changed.
pub struct StatusStore {
    path: PathBuf,
    records: BTreeMap<String, PersistentRecord>,
    dirty: bool,
}

impl StatusStore {
    /// Open the store, loading existing records
    ///
    /// An unreadable file is logged and treated as empty; the next update
    /// replaces it.
    pub fn open(path: &Path) -> Self {
        let records = match read_records(path) {
            Ok(records) => records,
            Err(e) => {
                warn!("Starting with empty link state: {}", e);
                BTreeMap::new()
            }
        };
        debug!(
            "Loaded {} link state record(s) from {}",
            records.len(),
            path.display()
        );

        Self {
            path: path.to_path_buf(),
            records,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, interface: &str) -> Option<&PersistentRecord> {
        self.records.get(interface)
    }

    /// Whether the interface has ever reached a host
    pub fn connected_once(&self, interface: &str) -> bool {
        self.records
            .get(interface)
            .map(|r| r.connected_once)
            .unwrap_or(false)
    }

    /// Create a disconnected record for each interface that has none
    pub fn ensure(&mut self, interfaces: &[String]) -> Result<()> {
        let mut added = false;
        for name in interfaces {
            if !self.records.contains_key(name) {
                self.records
                    .insert(name.clone(), PersistentRecord::new(name));
                added = true;
            }
        }
        if added || self.dirty {
            self.flush()?;
        }
        Ok(())
    }

    /// Record a status change
    ///
    /// `host_ip = None` keeps the last known host address. `connected_once`
    /// latches on the first `Connected`. Returns whether the file was
    /// rewritten: on a change, or to retry a previously failed write.
    pub fn update(
        &mut self,
        interface: &str,
        status: LinkStatus,
        host_ip: Option<Ipv4Addr>,
    ) -> Result<bool> {
        let previous = self.records.get(interface).cloned();
        let mut record = previous
            .clone()
            .unwrap_or_else(|| PersistentRecord::new(interface));

        record.status = status;
        if host_ip.is_some() {
            record.host_ip = host_ip;
        }
        record.connected_once |= status == LinkStatus::Connected;

        if previous.as_ref() == Some(&record) && !self.dirty {
            return Ok(false);
        }

        self.records.insert(interface.to_string(), record);
        self.flush()?;
        Ok(true)
    }

    fn flush(&mut self) -> Result<()> {
        let result = self.write();
        self.dirty = result.is_err();
        result
    }

    fn write(&self) -> Result<()> {
        let err = |reason: String| AppError::StateFile {
            path: self.path.display().to_string(),
            reason,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| err(format!("create {}: {}", parent.display(), e)))?;
            }
        }

        let mut content = String::new();
        for record in self.records.values() {
            content.push_str(&record.to_line());
            content.push('\n');
        }

        let mut temp_name = self.path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let mut file =
            fs::File::create(&temp_path).map_err(|e| err(format!("create temp: {}", e)))?;
        file.write_all(content.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| err(format!("write temp: {}", e)))?;
        fs::rename(&temp_path, &self.path).map_err(|e| err(format!("rename: {}", e)))?;

        Ok(())
    }
}
