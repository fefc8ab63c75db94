use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use strum::Display;

use crate::connection::{NodeTable, Session};
use crate::event::Packet;
use crate::state::{BROADCAST_ID, now_timestamp};

/// Sender label when the packet names a sender we have no short name for
pub const UNRESOLVED_SENDER: &str = "????";

/// Sender label when the packet carries no sender at all
pub const MISSING_SENDER: &str = "unknown";

/// Text used when a text packet arrives without a payload
pub const MISSING_TEXT: &str = "Unknown text";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum MessageKind {
    /// Addressed to this session's own node
    Direct,
    /// Addressed to everyone on a channel
    Broadcast,
    /// Addressed to some other node; observed but not stored
    PassThrough,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Sender {
    Named(String),
    Unresolved,
    Missing,
}

impl Sender {
    pub fn display_name(&self) -> &str {
        match self {
            Sender::Named(name) => name,
            Sender::Unresolved => UNRESOLVED_SENDER,
            Sender::Missing => MISSING_SENDER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedMessage {
    pub kind: MessageKind,
    pub sender: Sender,
    pub channel_index: Option<u32>,
    pub destination: Option<String>,
    pub text: String,
    pub timestamp: NaiveDateTime,
}

/// Decide what an inbound text packet is, from the point of view of `session`
pub fn classify(packet: &Packet, session: &Session) -> ClassifiedMessage {
    ClassifiedMessage {
        kind: classify_destination(packet.to_id.as_deref(), &session.info.node_id),
        sender: resolve_sender(packet, &session.nodes),
        channel_index: packet.channel_index,
        destination: packet.to_id.clone(),
        text: packet
            .text
            .clone()
            .unwrap_or_else(|| MISSING_TEXT.to_string()),
        timestamp: packet_timestamp(packet.rx_time),
    }
}

/// `Direct` when addressed to `local_id`, `Broadcast` for `^all`, otherwise `PassThrough`
pub fn classify_destination(to_id: Option<&str>, local_id: &str) -> MessageKind {
    match to_id {
        Some(to) if !local_id.is_empty() && to == local_id => MessageKind::Direct,
        Some(BROADCAST_ID) => MessageKind::Broadcast,
        _ => MessageKind::PassThrough,
    }
}

/// Short name of the sender: id lookup first, then node number
pub fn resolve_sender(packet: &Packet, nodes: &NodeTable) -> Sender {
    if packet.from_id.is_none() && packet.from_num.is_none() {
        return Sender::Missing;
    }

    packet
        .from_id
        .as_deref()
        .and_then(|id| nodes.by_id(id))
        .and_then(|node| node.short_name())
        .or_else(|| {
            packet
                .from_num
                .and_then(|num| nodes.by_num(num))
                .and_then(|node| node.short_name())
        })
        .map(|name| Sender::Named(name.to_string()))
        .unwrap_or(Sender::Unresolved)
}

/// Local receive time, falling back to now when the radio gave none
fn packet_timestamp(rx_time: Option<i64>) -> NaiveDateTime {
    rx_time
        .filter(|secs| *secs > 0)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|utc| utc.with_timezone(&Local).naive_local())
        .unwrap_or_else(now_timestamp)
}
