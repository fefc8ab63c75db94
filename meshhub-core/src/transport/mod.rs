//! Transport abstraction: one [`Transport`] implementation per link type,
//! selected through a [`TransportRegistry`] keyed on [`TransportKind`].

pub mod scanner;
pub mod stream;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use strum::{Display, EnumIter, EnumString};

use crate::config::ClientConfig;
use crate::error::MeshError;
use crate::event::EventSink;
use crate::state::{BROADCAST_ID, Channel, NodeRecord};

pub use scanner::{ScanFailure, ScanReport, TransportScanner, filter_known};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ble,
    Serial,
    Tcp,
}

impl TransportKind {
    /// Parse a transport name, reporting anything unrecognized as a caller error
    pub fn parse(name: &str) -> Result<Self, MeshError> {
        TransportKind::from_str(name.trim())
            .map_err(|_| MeshError::UnknownTransportType(name.to_string()))
    }
}

/// A device found by a scan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub transport: TransportKind,
    pub address: String,
    /// May just repeat the address until a connection reports the short name
    pub display_name: String,
}

/// Parse a `kind:address` device spec such as `tcp:192.168.1.20` or `serial:/dev/ttyUSB0`
pub fn parse_device_spec(spec: &str) -> Result<(TransportKind, String), MeshError> {
    let (kind, address) = spec
        .split_once(':')
        .ok_or_else(|| MeshError::InvalidAddress(spec.to_string()))?;
    let kind = TransportKind::parse(kind)?;
    let address = address.trim();
    if address.is_empty() {
        return Err(MeshError::InvalidAddress(spec.to_string()));
    }
    Ok((kind, address.to_string()))
}

/// Node number the firmware uses as the broadcast address
pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;

/// Render a node number as a node id (`!a1b2c3d4`), or `^all` for the broadcast address
pub fn node_id_string(num: u32) -> String {
    if num == BROADCAST_NUM {
        BROADCAST_ID.to_string()
    } else {
        format!("!{num:08x}")
    }
}

/// Parse a `!a1b2c3d4` node id back into a node number
pub fn parse_node_id(id: &str) -> Option<u32> {
    let hex = id.strip_prefix('!')?;
    u32::from_str_radix(hex, 16).ok()
}

/// Who a text is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    Node { id: Option<String>, num: Option<u32> },
}

/// Identity the radio reports for itself once configured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub node_id: String,
    pub node_num: u32,
    pub short_name: String,
    pub long_name: String,
}

/// A freshly opened link plus the snapshot the radio sent while being configured
pub struct Connection {
    pub link: Box<dyn Link>,
    pub identity: LocalIdentity,
    pub channels: Vec<Channel>,
    pub nodes: Vec<NodeRecord>,
}

/// Discovery and connection for one kind of link
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// List reachable devices. May take several seconds (BLE discovery).
    async fn scan(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open and configure a link. Inbound traffic is held back until [`Link::start`].
    async fn connect(&self, address: &str) -> Result<Connection>;
}

/// An open connection to one radio
#[async_trait]
pub trait Link: Send {
    /// Begin delivering inbound events for this link
    fn start(&mut self, sink: EventSink);

    async fn send_text(
        &mut self,
        text: &str,
        destination: &Destination,
        channel: u32,
        want_ack: bool,
    ) -> Result<()>;

    /// Ask the radio to wipe its node database. The radio reboots afterwards.
    async fn reset_node_db(&mut self) -> Result<()>;

    async fn reboot(&mut self, delay_secs: i32) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// Transports available in this build
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serial and TCP always; BLE when built with the `bluetooth` feature
    pub fn with_defaults(config: &ClientConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(stream::SerialTransport::new(config.connect_timeout)));
        registry.register(Arc::new(stream::TcpTransport::new(
            config.tcp_devices.clone(),
            config.connect_timeout,
        )));
        #[cfg(feature = "bluetooth")]
        registry.register(Arc::new(stream::BleTransport::new(
            config.scan_duration,
            config.connect_timeout,
        )));
        registry
    }

    /// Add or replace the implementation for a transport's kind
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.kind(), transport);
    }

    pub fn get(&self, kind: TransportKind) -> Result<Arc<dyn Transport>, MeshError> {
        self.transports
            .get(&kind)
            .cloned()
            .ok_or(MeshError::TransportNotSupported(kind))
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        let mut kinds: Vec<TransportKind> = self.transports.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
