//! Serial, TCP and BLE transports built on the meshtastic crate's `StreamApi`.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use meshtastic::Message as ProstMessage;
use meshtastic::api::state::{Configured, Connected};
use meshtastic::api::{ConnectedStreamApi, StreamApi};
use meshtastic::packet::{PacketDestination, PacketReceiver, PacketRouter};
use meshtastic::protobufs;
use meshtastic::utils;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Connection, DeviceDescriptor, Destination, Link, LocalIdentity, Transport, TransportKind,
    node_id_string, parse_node_id,
};
use crate::config::{validate_tcp_address, with_default_port};
use crate::event::{EventSink, Packet};
use crate::state::{Channel, ChannelRole, DeviceMetrics, NodeRecord, Position};

/// `nodedb_reset = 1` (admin message field 100), pre-encoded.
/// The field's protobuf type differs between firmware releases.
const NODEDB_RESET_PAYLOAD: [u8; 3] = [0xA0, 0x06, 0x01];

/// Packet router for outbound sends; inbound traffic is handled by the pump task
struct LinkRouter {
    node_num: u32,
}

impl PacketRouter<(), std::io::Error> for LinkRouter {
    fn handle_packet_from_radio(
        &mut self,
        _packet: protobufs::FromRadio,
    ) -> std::result::Result<(), std::io::Error> {
        Ok(())
    }

    fn handle_mesh_packet(
        &mut self,
        _packet: protobufs::MeshPacket,
    ) -> std::result::Result<(), std::io::Error> {
        Ok(())
    }

    fn source_node_id(&self) -> meshtastic::types::NodeId {
        self.node_num.into()
    }
}

pub struct SerialTransport {
    timeout: Duration,
}

impl SerialTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn scan(&self) -> Result<Vec<DeviceDescriptor>> {
        let ports = utils::stream::available_serial_ports().context("Failed to list serial ports")?;
        Ok(ports
            .into_iter()
            .map(|port| DeviceDescriptor {
                transport: TransportKind::Serial,
                display_name: port.clone(),
                address: port,
            })
            .collect())
    }

    async fn connect(&self, address: &str) -> Result<Connection> {
        info!("Connecting via serial port {address}");
        let stream = utils::stream::build_serial_stream(
            address.to_string(),
            None, // Use default baud rate
            None, // Use default DTR
            None, // Use default RTS
        )
        .context("Failed to connect via serial")?;
        let (receiver, api) = StreamApi::new().connect(stream).await;
        configure(receiver, api, self.timeout).await
    }
}

/// Offers the configured `TCP_DEVICES` list; there is no network discovery
pub struct TcpTransport {
    devices: Vec<String>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(devices: Vec<String>, timeout: Duration) -> Self {
        Self { devices, timeout }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn scan(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self
            .devices
            .iter()
            .map(|address| DeviceDescriptor {
                transport: TransportKind::Tcp,
                address: address.clone(),
                display_name: address.clone(),
            })
            .collect())
    }

    async fn connect(&self, address: &str) -> Result<Connection> {
        validate_tcp_address(address)?;
        let address = with_default_port(address);
        info!("Connecting via TCP to {address}");
        let stream = utils::stream::build_tcp_stream(address)
            .await
            .context("Failed to connect via TCP")?;
        let (receiver, api) = StreamApi::new().connect(stream).await;
        configure(receiver, api, self.timeout).await
    }
}

#[cfg(feature = "bluetooth")]
pub struct BleTransport {
    scan_duration: Duration,
    timeout: Duration,
}

#[cfg(feature = "bluetooth")]
impl BleTransport {
    pub fn new(scan_duration: Duration, timeout: Duration) -> Self {
        Self {
            scan_duration,
            timeout,
        }
    }
}

#[cfg(feature = "bluetooth")]
#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn scan(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = utils::stream::available_ble_devices(self.scan_duration)
            .await
            .context("Bluetooth discovery failed")?;
        Ok(devices
            .into_iter()
            .map(|device| {
                let address = device.mac_address.to_string();
                DeviceDescriptor {
                    transport: TransportKind::Ble,
                    display_name: device.name.unwrap_or_else(|| address.clone()),
                    address,
                }
            })
            .collect())
    }

    async fn connect(&self, address: &str) -> Result<Connection> {
        info!("Connecting via Bluetooth to {address}");
        // Try as MAC address first, then as advertised name
        let ble_id = utils::stream::BleId::from_mac_address(address)
            .unwrap_or_else(|_| utils::stream::BleId::from_name(address));
        let stream = utils::stream::build_ble_stream(&ble_id, Duration::from_secs(10))
            .await
            .context("Failed to connect via Bluetooth")?;
        let (receiver, api) = StreamApi::new().connect(stream).await;
        configure(receiver, api, self.timeout).await
    }
}

/// What the radio reports between `want_config_id` and the matching `config_complete_id`
#[derive(Default)]
struct ConfigSnapshot {
    my_node_num: Option<u32>,
    channels: Vec<Channel>,
    nodes: Vec<NodeRecord>,
    /// Mesh traffic that arrived before configuration finished
    pending: Vec<protobufs::MeshPacket>,
}

async fn configure(
    mut receiver: PacketReceiver,
    api: ConnectedStreamApi<Connected>,
    timeout: Duration,
) -> Result<Connection> {
    debug!("Configuring connection...");
    let config_id: u32 = utils::generate_rand_id();
    let api = api
        .configure(config_id)
        .await
        .context("Failed to configure connection")?;

    let snapshot = collect_config(&mut receiver, config_id, timeout).await?;
    let my_node_num = snapshot
        .my_node_num
        .context("Radio did not report its node number")?;

    let me = snapshot
        .nodes
        .iter()
        .find(|node| node.node_num == Some(my_node_num));
    let identity = LocalIdentity {
        node_id: me
            .and_then(|node| node.node_id.clone())
            .unwrap_or_else(|| node_id_string(my_node_num)),
        node_num: my_node_num,
        short_name: me
            .and_then(|node| node.short_name.clone())
            .unwrap_or_default(),
        long_name: me
            .and_then(|node| node.long_name.clone())
            .unwrap_or_default(),
    };
    info!(
        "Configured {node_id} ({short}) with {channels} channel(s) and {nodes} known node(s)",
        node_id = identity.node_id,
        short = identity.short_name,
        channels = snapshot.channels.len(),
        nodes = snapshot.nodes.len()
    );

    Ok(Connection {
        link: Box::new(StreamLink {
            api: Some(api),
            receiver: Some(receiver),
            pending: snapshot.pending,
            my_node_num,
            pump: None,
        }),
        identity,
        channels: snapshot.channels,
        nodes: snapshot.nodes,
    })
}

async fn collect_config(
    receiver: &mut PacketReceiver,
    config_id: u32,
    timeout: Duration,
) -> Result<ConfigSnapshot> {
    use protobufs::from_radio::PayloadVariant;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut snapshot = ConfigSnapshot::default();

    loop {
        let from_radio = match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Ok(Some(from_radio)) => from_radio,
            Ok(None) => bail!("Radio closed the connection during configuration"),
            Err(_) => bail!("Timed out after {timeout:?} waiting for the radio configuration"),
        };

        match from_radio.payload_variant {
            Some(PayloadVariant::MyInfo(my_info)) => {
                snapshot.my_node_num = Some(my_info.my_node_num);
            }
            Some(PayloadVariant::NodeInfo(node_info)) => {
                snapshot.nodes.push(node_from_info(&node_info));
            }
            Some(PayloadVariant::Channel(channel)) => {
                snapshot.channels.push(channel_from_proto(&channel));
            }
            Some(PayloadVariant::Packet(mesh_packet)) => snapshot.pending.push(mesh_packet),
            Some(PayloadVariant::ConfigCompleteId(id)) if id == config_id => break,
            _ => {}
        }
    }

    Ok(snapshot)
}

/// An open stream to a radio. Inbound packets are buffered until [`Link::start`].
pub struct StreamLink {
    api: Option<ConnectedStreamApi<Configured>>,
    receiver: Option<PacketReceiver>,
    pending: Vec<protobufs::MeshPacket>,
    my_node_num: u32,
    pump: Option<JoinHandle<()>>,
}

impl StreamLink {
    fn api(&mut self) -> Result<&mut ConnectedStreamApi<Configured>> {
        self.api.as_mut().context("Link is closed")
    }

    async fn send_admin(&mut self, payload: Vec<u8>) -> Result<()> {
        let to = self.my_node_num;
        let mesh_packet = protobufs::MeshPacket {
            payload_variant: Some(protobufs::mesh_packet::PayloadVariant::Decoded(
                protobufs::Data {
                    portnum: protobufs::PortNum::AdminApp as i32,
                    payload,
                    ..Default::default()
                },
            )),
            to,
            want_ack: false,
            priority: protobufs::mesh_packet::Priority::Reliable as i32,
            ..Default::default()
        };

        self.api()?
            .send_to_radio_packet(Some(protobufs::to_radio::PayloadVariant::Packet(
                mesh_packet,
            )))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Link for StreamLink {
    fn start(&mut self, sink: EventSink) {
        let Some(mut receiver) = self.receiver.take() else {
            warn!("Link {link} already started", link = sink.link());
            return;
        };
        let pending = std::mem::take(&mut self.pending);

        self.pump = Some(tokio::spawn(async move {
            debug!("Starting packet processing for {link}", link = sink.link());

            for mesh_packet in pending {
                forward_mesh_packet(mesh_packet, &sink);
            }
            while let Some(from_radio) = receiver.recv().await {
                forward_from_radio(from_radio, &sink);
            }

            info!("Radio stream for {link} ended", link = sink.link());
            sink.on_connection_lost();
        }));
    }

    async fn send_text(
        &mut self,
        text: &str,
        destination: &Destination,
        channel: u32,
        want_ack: bool,
    ) -> Result<()> {
        let dest = packet_destination(destination)?;
        let mut router = LinkRouter {
            node_num: self.my_node_num,
        };
        self.api()?
            .send_text(&mut router, text.to_string(), dest, want_ack, channel.into())
            .await?;
        debug!("Text message sent to {dest:?} on channel {channel}");
        Ok(())
    }

    async fn reset_node_db(&mut self) -> Result<()> {
        self.send_admin(NODEDB_RESET_PAYLOAD.to_vec()).await
    }

    async fn reboot(&mut self, delay_secs: i32) -> Result<()> {
        let admin = protobufs::AdminMessage {
            payload_variant: Some(protobufs::admin_message::PayloadVariant::RebootSeconds(
                delay_secs,
            )),
            session_passkey: Vec::new(),
        };
        self.send_admin(admin.encode_to_vec()).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(api) = self.api.take() {
            api.disconnect().await?;
        }
        Ok(())
    }
}

impl Drop for StreamLink {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

fn packet_destination(destination: &Destination) -> Result<PacketDestination> {
    match destination {
        Destination::Broadcast => Ok(PacketDestination::Broadcast),
        Destination::Node { num: Some(num), .. } => Ok(PacketDestination::Node((*num).into())),
        Destination::Node { id: Some(id), .. } => {
            let num = parse_node_id(id).with_context(|| format!("Invalid node id {id:?}"))?;
            Ok(PacketDestination::Node(num.into()))
        }
        Destination::Node { .. } => bail!("Destination node has neither an id nor a number"),
    }
}

fn forward_from_radio(from_radio: protobufs::FromRadio, sink: &EventSink) {
    use protobufs::from_radio::PayloadVariant;

    match from_radio.payload_variant {
        Some(PayloadVariant::Packet(mesh_packet)) => forward_mesh_packet(mesh_packet, sink),
        Some(PayloadVariant::NodeInfo(node_info)) => sink.on_node_updated(node_from_info(&node_info)),
        Some(PayloadVariant::Rebooted(_)) => info!("Radio on {link} rebooted", link = sink.link()),
        _ => {}
    }
}

fn forward_mesh_packet(mesh_packet: protobufs::MeshPacket, sink: &EventSink) {
    let Some(protobufs::mesh_packet::PayloadVariant::Decoded(data)) = &mesh_packet.payload_variant
    else {
        // Can't process encrypted packets
        return;
    };
    let from = mesh_packet.from;

    match data.portnum() {
        protobufs::PortNum::TextMessageApp => {
            debug!("Received text message from {from:08x}");
            sink.on_packet_received(Packet {
                text: Some(String::from_utf8_lossy(&data.payload).to_string()),
                to_id: Some(node_id_string(mesh_packet.to)),
                from_id: (from != 0).then(|| node_id_string(from)),
                from_num: (from != 0).then_some(from),
                channel_index: Some(mesh_packet.channel),
                rx_time: (mesh_packet.rx_time > 0).then_some(mesh_packet.rx_time as i64),
            });
        }

        protobufs::PortNum::NodeinfoApp => {
            if let Ok(user) = protobufs::User::decode(data.payload.as_slice()) {
                sink.on_node_updated(NodeRecord {
                    node_id: non_empty(&user.id),
                    short_name: non_empty(&user.short_name),
                    long_name: non_empty(&user.long_name),
                    hw_model: Some(format!("{:?}", user.hw_model())),
                    ..heard_from(&mesh_packet)
                });
            }
        }

        protobufs::PortNum::PositionApp => {
            if let Ok(position) = protobufs::Position::decode(data.payload.as_slice())
                && let Some(position) = position_from_proto(&position)
            {
                sink.on_node_updated(NodeRecord {
                    node_id: Some(node_id_string(from)),
                    position: Some(position),
                    ..heard_from(&mesh_packet)
                });
            }
        }

        protobufs::PortNum::TelemetryApp => {
            if let Ok(telemetry) = protobufs::Telemetry::decode(data.payload.as_slice())
                && let Some(protobufs::telemetry::Variant::DeviceMetrics(metrics)) =
                    telemetry.variant
            {
                sink.on_node_updated(NodeRecord {
                    node_id: Some(node_id_string(from)),
                    device_metrics: Some(DeviceMetrics {
                        battery_level: metrics.battery_level,
                        voltage: metrics.voltage,
                        channel_utilization: metrics.channel_utilization,
                        air_util_tx: metrics.air_util_tx,
                        uptime_seconds: metrics.uptime_seconds,
                    }),
                    ..heard_from(&mesh_packet)
                });
            }
        }

        _ => {
            // Other port types not handled
        }
    }
}

/// Fields every packet tells us about its sender
fn heard_from(mesh_packet: &protobufs::MeshPacket) -> NodeRecord {
    let heard = if mesh_packet.rx_time > 0 {
        mesh_packet.rx_time as u64
    } else {
        chrono::Utc::now().timestamp().max(0) as u64
    };
    NodeRecord {
        node_num: Some(mesh_packet.from),
        snr: (mesh_packet.rx_snr != 0.0).then_some(mesh_packet.rx_snr),
        hops_away: (mesh_packet.hop_start > 0)
            .then(|| mesh_packet.hop_start.saturating_sub(mesh_packet.hop_limit)),
        last_heard: Some(heard),
        ..Default::default()
    }
}

fn node_from_info(node_info: &protobufs::NodeInfo) -> NodeRecord {
    let user = node_info.user.as_ref();
    NodeRecord {
        node_id: user.and_then(|u| non_empty(&u.id)),
        node_num: Some(node_info.num),
        short_name: user.and_then(|u| non_empty(&u.short_name)),
        long_name: user.and_then(|u| non_empty(&u.long_name)),
        hw_model: user.map(|u| format!("{:?}", u.hw_model())),
        position: node_info.position.as_ref().and_then(position_from_proto),
        device_metrics: node_info.device_metrics.as_ref().map(|m| DeviceMetrics {
            battery_level: m.battery_level,
            voltage: m.voltage,
            channel_utilization: m.channel_utilization,
            air_util_tx: m.air_util_tx,
            uptime_seconds: m.uptime_seconds,
        }),
        snr: Some(node_info.snr),
        hops_away: None,
        last_heard: (node_info.last_heard > 0).then_some(node_info.last_heard as u64),
    }
}

fn position_from_proto(position: &protobufs::Position) -> Option<Position> {
    let (Some(lat), Some(lon)) = (position.latitude_i, position.longitude_i) else {
        return None;
    };
    Some(Position {
        time: (position.time > 0).then_some(position.time as u64),
        latitude: lat as f64 / 1e7,
        longitude: lon as f64 / 1e7,
        altitude: position.altitude,
    })
}

fn channel_from_proto(channel: &protobufs::Channel) -> Channel {
    Channel {
        index: channel.index.max(0) as u32,
        name: channel
            .settings
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_default(),
        role: ChannelRole::from_i32(channel.role),
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
