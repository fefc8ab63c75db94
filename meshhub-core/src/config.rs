use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::error::MeshError;

/// TCP port the Meshtastic firmware listens on
pub const DEFAULT_TCP_PORT: u16 = 4403;

pub const DEFAULT_CHANNEL_LOG: &str = "channel-messages.csv";
pub const DEFAULT_DIRECT_LOG: &str = "direct-messages.csv";

/// Client-side settings consumed by the core.
///
/// The same keys the environment file used are understood by
/// [`ClientConfig::from_lookup`]: `TCP_DEVICES`, `CHANNEL_MESSAGE_LOG`,
/// `DIRECT_MESSAGE_LOG` and `WANT_ACK_BROADCAST`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Validated TCP device addresses offered by the TCP scanner
    pub tcp_devices: Vec<String>,
    pub channel_log: PathBuf,
    pub direct_log: PathBuf,
    /// Request delivery acknowledgment for outbound broadcast sends
    pub want_ack_broadcast: bool,
    pub connect_timeout: Duration,
    /// How long BLE discovery listens for advertisements
    pub scan_duration: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tcp_devices: Vec::new(),
            channel_log: PathBuf::from(DEFAULT_CHANNEL_LOG),
            direct_log: PathBuf::from(DEFAULT_DIRECT_LOG),
            want_ack_broadcast: false,
            connect_timeout: Duration::from_secs(30),
            scan_duration: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Build a config from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(devices) = lookup("TCP_DEVICES") {
            config.tcp_devices = parse_tcp_devices(&devices);
        }
        if let Some(path) = lookup("CHANNEL_MESSAGE_LOG").filter(|p| !p.trim().is_empty()) {
            config.channel_log = PathBuf::from(path);
        }
        if let Some(path) = lookup("DIRECT_MESSAGE_LOG").filter(|p| !p.trim().is_empty()) {
            config.direct_log = PathBuf::from(path);
        }
        if let Some(flag) = lookup("WANT_ACK_BROADCAST") {
            config.want_ack_broadcast = parse_flag(&flag);
        }

        config
    }

    /// Build a config from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// `true` and `yes` (any case) switch a flag on; everything else leaves it off
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "yes")
}

/// Split a comma-separated `TCP_DEVICES` value, dropping invalid entries with a warning
pub fn parse_tcp_devices(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match validate_tcp_address(entry) {
            Ok(()) => Some(entry.to_string()),
            Err(e) => {
                warn!("Ignoring TCP_DEVICES entry: {e}");
                None
            }
        })
        .collect()
}

/// Accepts an IP address, `ip:port`, `[v6]:port`, or a hostname with optional `:port`
pub fn validate_tcp_address(address: &str) -> Result<(), MeshError> {
    if address.parse::<IpAddr>().is_ok() || address.parse::<SocketAddr>().is_ok() {
        return Ok(());
    }

    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        Some(_) => return Err(MeshError::InvalidAddress(address.to_string())),
        None => address,
    };

    if is_valid_hostname(host) {
        Ok(())
    } else {
        Err(MeshError::InvalidAddress(address.to_string()))
    }
}

/// Append the Meshtastic TCP port when the address does not carry one
pub fn with_default_port(address: &str) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{ip}]:{DEFAULT_TCP_PORT}"),
        Ok(IpAddr::V4(ip)) => format!("{ip}:{DEFAULT_TCP_PORT}"),
        Err(_) => match address.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => address.to_string(),
            _ => format!("{address}:{DEFAULT_TCP_PORT}"),
        },
    }
}

fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }

    let labels: Vec<&str> = host.trim_end_matches('.').split('.').collect();

    // All-numeric labels look like a mistyped IPv4 address
    if labels
        .iter()
        .all(|label| label.chars().all(|c| c.is_ascii_digit()))
    {
        return false;
    }

    labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
