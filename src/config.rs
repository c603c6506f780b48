//! Tunables for discovery and RLPx sessions, loadable from TOML.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::{
    io,
    net::{IpAddr, Ipv4Addr},
    path::Path,
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    pub connection: ConnectionConfig,
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }
}

/// Config for node discovery
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Nodes contacted per lookup round.
    pub alpha: usize,
    /// How long a UDP client waits for any datagram before giving up.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub response_timeout: Duration,
    /// Lifetime stamped on outgoing packets.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub expiration: Duration,
    /// Endpoint advertised in our pings.
    pub self_host: IpAddr,
    pub self_port: u16,
    pub bootnodes: Vec<String>,
    pub event_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            alpha: 3,
            response_timeout: Duration::from_secs(10),
            expiration: Duration::from_secs(20),
            self_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            self_port: 30303,
            bootnodes: Vec::new(),
            event_capacity: 64,
        }
    }
}

/// Config for RLPx sessions
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub handshake_timeout: Duration,
    /// Session is dropped after this long without an inbound frame.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_timeout: Duration,
    pub command_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            command_capacity: 64,
        }
    }
}
