use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::SessionInfo;
use crate::state::{Channel, NodeRecord};

/// Identifies one opened link. A reconnect under the same display name gets a new id,
/// so late reports from the old link can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// An inbound text packet as decoded by a transport. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub text: Option<String>,
    /// Destination id: `^all` for broadcasts, `!xxxxxxxx` for a node
    pub to_id: Option<String>,
    pub from_id: Option<String>,
    pub from_num: Option<u32>,
    pub channel_index: Option<u32>,
    /// Receive time in seconds since the epoch, as reported by the radio
    pub rx_time: Option<i64>,
}

/// Everything a transport or the connection manager reports to the dispatcher
#[derive(Debug, Clone)]
pub enum MeshEvent {
    ConnectionEstablished {
        link: LinkId,
        session: SessionInfo,
        channels: Vec<Channel>,
        nodes: Vec<NodeRecord>,
    },
    ConnectionLost {
        link: LinkId,
    },
    PacketReceived {
        link: LinkId,
        packet: Packet,
    },
    NodeUpdated {
        link: LinkId,
        node: NodeRecord,
    },
}

impl MeshEvent {
    pub fn link(&self) -> LinkId {
        match self {
            MeshEvent::ConnectionEstablished { link, .. }
            | MeshEvent::ConnectionLost { link }
            | MeshEvent::PacketReceived { link, .. }
            | MeshEvent::NodeUpdated { link, .. } => *link,
        }
    }
}

/// Producer side of the event queue, shared by every link
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn sink(&self, link: LinkId) -> EventSink {
        EventSink {
            link,
            tx: self.tx.clone(),
        }
    }
}

/// Handle a single link uses to report events, tagged with its [`LinkId`].
///
/// Callbacks never block: events are queued for the dispatcher, which
/// applies them in arrival order.
#[derive(Debug, Clone)]
pub struct EventSink {
    link: LinkId,
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl EventSink {
    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn on_connection_established(
        &self,
        session: SessionInfo,
        channels: Vec<Channel>,
        nodes: Vec<NodeRecord>,
    ) {
        self.emit(MeshEvent::ConnectionEstablished {
            link: self.link,
            session,
            channels,
            nodes,
        });
    }

    pub fn on_connection_lost(&self) {
        self.emit(MeshEvent::ConnectionLost { link: self.link });
    }

    pub fn on_packet_received(&self, packet: Packet) {
        self.emit(MeshEvent::PacketReceived {
            link: self.link,
            packet,
        });
    }

    pub fn on_node_updated(&self, node: NodeRecord) {
        self.emit(MeshEvent::NodeUpdated {
            link: self.link,
            node,
        });
    }

    fn emit(&self, event: MeshEvent) {
        if self.tx.send(event).is_err() {
            debug!("Dropping event from {link}: dispatcher has shut down", link = self.link);
        }
    }
}
