//! Configuration for the PVA session layer.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PVA_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/pva/config.toml
//!   3. ~/.config/pva/config.toml
//!
//! The classic EPICS_PVA_* variables override the file.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::{
    DEFAULT_BROADCAST_PORT, DEFAULT_RECEIVE_BUFFER_SIZE, DEFAULT_SERVER_PORT,
    MAX_UDP_UNFRAGMENTED_SEND,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PvaConfig {
    pub search: SearchConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Search destinations, `host` or `host:port`. Entries without a port
    /// use `broadcast_port`.
    pub address_list: Vec<String>,
    /// Also search on the limited broadcast address.
    pub auto_address_list: bool,
    /// UDP port servers listen on for searches and send beacons to.
    pub broadcast_port: u16,
    /// Base period of the search timer.
    pub period_ms: u64,
    /// Random jitter added to each period, ±.
    pub jitter_ms: u64,
    /// A search cycle is skipped if the previous one ran less than this ago.
    pub min_cycle_gap_ms: u64,
    /// Largest search datagram.
    pub max_datagram: usize,
    /// A server whose beacons stop for this long is forgotten.
    pub beacon_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP port the acceptor binds. 0 = OS-assigned.
    pub server_port: u16,
    /// Application receive buffer advertised during validation.
    pub receive_buffer_size: u32,
    /// Heartbeat period. Unresponsive after twice this without traffic.
    pub heartbeat_interval_ms: u64,
    /// Timeout of a single TCP connect attempt.
    pub connect_timeout_ms: u64,
    /// TCP connect attempts before giving up.
    pub connect_attempts: u32,
    /// Time allowed for the validation handshake.
    pub validation_timeout_ms: u64,
    /// How long a connect waits for another connect to the same peer.
    pub reservation_timeout_ms: u64,
    /// Largest message payload accepted from a peer.
    pub max_payload: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            address_list: Vec::new(),
            auto_address_list: true,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            period_ms: 225,
            jitter_ms: 25,
            min_cycle_gap_ms: 100,
            max_datagram: MAX_UDP_UNFRAGMENTED_SEND,
            beacon_ttl_ms: 180_000,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            heartbeat_interval_ms: 15_000,
            connect_timeout_ms: 5_000,
            connect_attempts: 3,
            validation_timeout_ms: 5_000,
            reservation_timeout_ms: 20_000,
            max_payload: 16 * 1024 * 1024,
        }
    }
}

impl SearchConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn min_cycle_gap(&self) -> Duration {
        Duration::from_millis(self.min_cycle_gap_ms)
    }

    pub fn beacon_ttl(&self) -> Duration {
        Duration::from_millis(self.beacon_ttl_ms)
    }

    /// Resolve `address_list` (plus the broadcast address when
    /// `auto_address_list` is set) into socket addresses. Unparseable
    /// entries are returned as errors so the caller can log them.
    pub fn search_addresses(&self) -> (Vec<SocketAddr>, Vec<String>) {
        let mut resolved = Vec::new();
        let mut rejected = Vec::new();
        for entry in &self.address_list {
            match parse_address(entry, self.broadcast_port) {
                Some(addr) => resolved.push(addr),
                None => rejected.push(entry.clone()),
            }
        }
        if self.auto_address_list {
            let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.broadcast_port);
            if !resolved.contains(&broadcast) {
                resolved.push(broadcast);
            }
        }
        (resolved, rejected)
    }
}

impl TransportConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_timeout_ms)
    }
}

/// Parse `host` or `host:port`.
pub fn parse_address(entry: &str, default_port: u16) -> Option<SocketAddr> {
    let entry = entry.trim();
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Some(addr);
    }
    entry.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, default_port))
}

/// True if a search sent to `addr` may reach more than one host.
pub fn is_broadcast_target(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => v4.is_broadcast() || v4.is_multicast() || v4.octets()[3] == 255,
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("pva")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PvaConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PvaConfig::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PVA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PvaConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply EPICS_PVA_* overrides, reading variables through `var`.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("EPICS_PVA_ADDR_LIST") {
            self.search.address_list = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = var("EPICS_PVA_AUTO_ADDR_LIST") {
            self.search.auto_address_list = parse_flag(&v);
        }
        if let Some(p) = var("EPICS_PVA_BROADCAST_PORT").and_then(|v| v.parse().ok()) {
            self.search.broadcast_port = p;
        }
        if let Some(p) = var("EPICS_PVA_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.transport.server_port = p;
        }
        if let Some(secs) = var("EPICS_PVA_CONN_TMO").and_then(|v| v.parse::<f64>().ok()) {
            if secs > 0.0 {
                self.transport.heartbeat_interval_ms = (secs * 500.0) as u64;
            }
        }
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "yes" | "true" | "1")
}
