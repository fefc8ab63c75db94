use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::Display;
use tracing::{debug, warn};

/// Destination id meaning "every node on this channel"
pub const BROADCAST_ID: &str = "^all";

/// Channel key for packets that did not say which channel they arrived on
pub const UNKNOWN_CHANNEL: &str = "Unknown";

/// Timestamp layout used in buffers and in the message logs
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local time at one-second resolution, matching what the logs can hold
pub fn now_timestamp() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// A text message as held in the buffers. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub timestamp: NaiveDateTime,
    pub from: String,
    pub to: String,
    /// Channel name for channel traffic, remote display name for direct traffic
    pub key: Option<String>,
    pub text: String,
}

impl Message {
    pub fn channel(timestamp: NaiveDateTime, sender: &str, channel: &str, text: &str) -> Self {
        Self {
            timestamp,
            from: sender.to_string(),
            to: BROADCAST_ID.to_string(),
            key: Some(channel.to_string()),
            text: text.to_string(),
        }
    }

    pub fn direct(
        timestamp: NaiveDateTime,
        from: &str,
        to: &str,
        remote: &str,
        text: &str,
    ) -> Self {
        Self {
            timestamp,
            from: from.to_string(),
            to: to.to_string(),
            key: Some(remote.to_string()),
            text: text.to_string(),
        }
    }

    pub fn formatted_time(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum ChannelRole {
    Disabled,
    Primary,
    Secondary,
}

impl ChannelRole {
    /// Map the firmware's numeric role; anything unrecognized is treated as disabled
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ChannelRole::Primary,
            2 => ChannelRole::Secondary,
            _ => ChannelRole::Disabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub index: u32,
    pub name: String,
    pub role: ChannelRole,
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.role != ChannelRole::Disabled
    }

    /// Buffer key for this channel. The primary channel usually has no name.
    pub fn key(&self) -> String {
        channel_label(self.index, &self.name)
    }
}

/// Buffer key for a channel name, with `Channel <index>` standing in for an empty one
pub fn channel_label(index: u32, name: &str) -> String {
    if name.is_empty() {
        format!("Channel {index}")
    } else {
        name.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub time: Option<u64>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
}

/// Last-reported identity, telemetry and position of a remote node.
///
/// Transports report partial records (a position packet carries no names),
/// so every field is optional and [`NodeRecord::merge`] keeps what an update
/// leaves out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: Option<String>,
    pub node_num: Option<u32>,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub hw_model: Option<String>,
    pub position: Option<Position>,
    pub device_metrics: Option<DeviceMetrics>,
    pub snr: Option<f32>,
    pub hops_away: Option<u32>,
    pub last_heard: Option<u64>,
}

impl NodeRecord {
    /// Overwrite every field the update carries
    pub fn merge(&mut self, update: NodeRecord) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.node_id, update.node_id);
        take(&mut self.node_num, update.node_num);
        take(&mut self.short_name, update.short_name);
        take(&mut self.long_name, update.long_name);
        take(&mut self.hw_model, update.hw_model);
        take(&mut self.position, update.position);
        take(&mut self.device_metrics, update.device_metrics);
        take(&mut self.snr, update.snr);
        take(&mut self.hops_away, update.hops_away);
        take(&mut self.last_heard, update.last_heard);
    }

    /// The id this record is keyed by, if it has a usable one
    pub fn key(&self) -> Option<&str> {
        self.node_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn short_name(&self) -> Option<&str> {
        self.short_name.as_deref().filter(|name| !name.is_empty())
    }
}

/// Counters for inputs that were dropped or degraded rather than failing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub malformed_node_updates: u64,
    pub pass_through_packets: u64,
    pub unknown_channel_packets: u64,
    pub persistence_failures: u64,
}

/// Everything held for one local device
#[derive(Debug, Clone, Default)]
pub struct DeviceBuffers {
    pub connected: bool,
    pub channels: Vec<Channel>,
    pub channel_messages: BTreeMap<String, Vec<Message>>,
    pub direct_messages: Vec<Message>,
    pub conversations: BTreeMap<String, Vec<Message>>,
    pub nodes: BTreeMap<String, NodeRecord>,
}

/// In-memory message buffers and node directory, keyed by device display name.
///
/// Buffers are never dropped when a device disconnects, so history survives
/// reconnects under the same display name.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    devices: BTreeMap<String, DeviceBuffers>,
    diagnostics: Diagnostics,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn device_mut(&mut self, device: &str) -> &mut DeviceBuffers {
        self.devices.entry(device.to_string()).or_default()
    }

    /// Record a successful connection and pre-create a buffer for every enabled channel
    pub fn register_device(&mut self, device: &str, channels: &[Channel]) {
        let buffers = self.device_mut(device);
        buffers.connected = true;
        buffers.channels = channels.to_vec();

        for channel in channels.iter().filter(|c| c.is_enabled()) {
            buffers.channel_messages.entry(channel.key()).or_default();
        }
        debug!(
            "Registered device {device} with {count} channel(s)",
            count = channels.len()
        );
    }

    /// Clear the connected flag. Buffers and the node directory are kept.
    pub fn remove_device(&mut self, device: &str) {
        if let Some(buffers) = self.devices.get_mut(device) {
            buffers.connected = false;
        }
    }

    pub fn is_connected(&self, device: &str) -> bool {
        self.devices.get(device).is_some_and(|d| d.connected)
    }

    pub fn devices(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn device(&self, device: &str) -> Option<&DeviceBuffers> {
        self.devices.get(device)
    }

    pub fn channels(&self, device: &str) -> &[Channel] {
        self.devices
            .get(device)
            .map(|d| d.channels.as_slice())
            .unwrap_or_default()
    }

    pub fn enabled_channels(&self, device: &str) -> Vec<Channel> {
        self.channels(device)
            .iter()
            .filter(|c| c.is_enabled())
            .cloned()
            .collect()
    }

    pub fn channel(&self, device: &str, index: u32) -> Option<&Channel> {
        self.channels(device).iter().find(|c| c.index == index)
    }

    /// Buffer key for a channel index reported by a packet
    pub fn channel_key(&self, device: &str, index: Option<u32>) -> String {
        match index {
            Some(index) => self
                .channel(device, index)
                .map(Channel::key)
                .unwrap_or_else(|| channel_label(index, "")),
            None => UNKNOWN_CHANNEL.to_string(),
        }
    }

    pub fn append_channel_message(&mut self, device: &str, channel: &str, message: Message) {
        self.device_mut(device)
            .channel_messages
            .entry(channel.to_string())
            .or_default()
            .push(message);
    }

    /// Append a direct message to both the flat direct buffer and the
    /// conversation with `remote`. The two views are only ever written together.
    pub fn append_direct_message(&mut self, device: &str, remote: &str, message: Message) {
        self.append_conversation_message(device, remote, message.clone());
        self.device_mut(device).direct_messages.push(message);
    }

    fn append_conversation_message(&mut self, device: &str, remote: &str, message: Message) {
        self.device_mut(device)
            .conversations
            .entry(remote.to_string())
            .or_default()
            .push(message);
    }

    /// Merge a node report into the directory.
    ///
    /// Returns `false` when the record has no node id; such updates are
    /// counted in [`Diagnostics::malformed_node_updates`] and not stored.
    pub fn upsert_node(&mut self, device: &str, record: NodeRecord) -> bool {
        let Some(key) = record.key().map(str::to_string) else {
            self.diagnostics.malformed_node_updates += 1;
            warn!(
                "Dropping node update without node id on {device} (num {num:?}, short name {short:?})",
                num = record.node_num,
                short = record.short_name
            );
            return false;
        };

        self.device_mut(device)
            .nodes
            .entry(key)
            .or_default()
            .merge(record);
        true
    }

    pub fn channel_messages(&self, device: &str, channel: &str) -> &[Message] {
        self.devices
            .get(device)
            .and_then(|d| d.channel_messages.get(channel))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Channel buffer for a channel index, resolved through the device's channel list
    pub fn channel_messages_by_index(&self, device: &str, index: u32) -> &[Message] {
        let key = self.channel_key(device, Some(index));
        self.channel_messages(device, &key)
    }

    pub fn direct_messages(&self, device: &str) -> &[Message] {
        self.devices
            .get(device)
            .map(|d| d.direct_messages.as_slice())
            .unwrap_or_default()
    }

    pub fn conversation(&self, device: &str, remote: &str) -> &[Message] {
        self.devices
            .get(device)
            .and_then(|d| d.conversations.get(remote))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn conversation_partners(&self, device: &str) -> Vec<String> {
        self.devices
            .get(device)
            .map(|d| d.conversations.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn nodes(&self, device: &str) -> Vec<NodeRecord> {
        self.devices
            .get(device)
            .map(|d| d.nodes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn node(&self, device: &str, node_id: &str) -> Option<&NodeRecord> {
        self.devices.get(device).and_then(|d| d.nodes.get(node_id))
    }

    /// Long name for a short name, or `Meshtastic <short>` when the node has none
    pub fn long_name_for(&self, device: &str, short_name: &str) -> String {
        self.devices
            .get(device)
            .and_then(|d| {
                d.nodes
                    .values()
                    .find(|n| n.short_name() == Some(short_name))
            })
            .and_then(|n| n.long_name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("Meshtastic {short_name}"))
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    pub(crate) fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }
}
