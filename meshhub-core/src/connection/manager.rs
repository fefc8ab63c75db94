use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use strum::Display;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::MeshError;
use crate::event::{EventBus, LinkId};
use crate::state::NodeRecord;
use crate::transport::{Destination, Link, TransportKind, TransportRegistry};

type SharedLink = Arc<Mutex<Box<dyn Link>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Public view of one device session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Short name reported by the radio, or the address when it has none
    pub display_name: String,
    pub transport: TransportKind,
    pub address: String,
    pub state: ConnectionState,
    /// This radio's own node id; packets addressed here are direct messages
    pub node_id: String,
    pub node_num: u32,
    pub long_name: String,
}

/// Per-session view of remote nodes, indexed both ways for sender resolution
#[derive(Debug, Clone, Default)]
pub struct NodeTable {
    by_id: HashMap<String, NodeRecord>,
    by_num: HashMap<u32, NodeRecord>,
}

impl NodeTable {
    /// Merge an update into whichever indexes its keys allow
    pub fn update(&mut self, record: &NodeRecord) {
        if let Some(id) = record.key() {
            self.by_id
                .entry(id.to_string())
                .or_default()
                .merge(record.clone());
        }
        if let Some(num) = record.node_num {
            self.by_num.entry(num).or_default().merge(record.clone());
        }
    }

    pub fn by_id(&self, id: &str) -> Option<&NodeRecord> {
        self.by_id.get(id)
    }

    pub fn by_num(&self, num: u32) -> Option<&NodeRecord> {
        self.by_num.get(&num)
    }

    pub fn find_by_short_name(&self, short_name: &str) -> Option<&NodeRecord> {
        self.by_id
            .values()
            .chain(self.by_num.values())
            .find(|node| node.short_name() == Some(short_name))
    }
}

/// A session together with its node table, as seen by the classifier
#[derive(Debug, Clone)]
pub struct Session {
    pub info: SessionInfo,
    pub nodes: NodeTable,
}

struct SessionEntry {
    session: Session,
    link_id: LinkId,
    link: Option<SharedLink>,
}

#[derive(Default)]
struct Sessions {
    by_name: HashMap<String, SessionEntry>,
    /// Addresses with a connect in flight
    connecting: HashSet<String>,
    /// Links whose loss has not been applied yet, including replaced ones
    links: HashMap<LinkId, String>,
}

type SharedSessions = Arc<std::sync::Mutex<Sessions>>;

fn lock_sessions(sessions: &std::sync::Mutex<Sessions>) -> MutexGuard<'_, Sessions> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reservation of an address for one connect attempt.
///
/// Released explicitly once the transport answers, or on drop when the
/// attempt is cancelled.
struct ConnectAttempt {
    sessions: SharedSessions,
    address: String,
    released: bool,
}

impl ConnectAttempt {
    fn release(&mut self, sessions: &mut Sessions) {
        self.released = true;
        sessions.connecting.remove(&self.address);
        set_state_by_address(sessions, &self.address, ConnectionState::Disconnected);
    }
}

impl Drop for ConnectAttempt {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        debug!("Connect to {address} was cancelled", address = self.address);
        let shared = self.sessions.clone();
        let mut sessions = lock_sessions(&shared);
        self.release(&mut sessions);
    }
}

/// Owns every device session and the link behind it.
///
/// Cloning is cheap; all clones share the same sessions.
#[derive(Clone)]
pub struct ConnectionManager {
    registry: TransportRegistry,
    bus: EventBus,
    sessions: SharedSessions,
    next_link: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(registry: TransportRegistry, bus: EventBus) -> Self {
        Self {
            registry,
            bus,
            sessions: Arc::new(std::sync::Mutex::new(Sessions::default())),
            next_link: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn registry(&self) -> &TransportRegistry {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        lock_sessions(&self.sessions)
    }

    /// Open a session to `address` over `kind`.
    ///
    /// The session is keyed by the radio's short name so that a reconnect
    /// lands on the same buffers. `ConnectionEstablished` is queued before
    /// the link starts delivering packets.
    pub async fn connect(
        &self,
        kind: TransportKind,
        address: &str,
    ) -> Result<SessionInfo, MeshError> {
        let transport = self.registry.get(kind)?;

        let mut attempt = {
            let mut sessions = self.lock();
            let busy = sessions.connecting.contains(address)
                || sessions.by_name.values().any(|entry| {
                    entry.session.info.address == address
                        && entry.session.info.state == ConnectionState::Connected
                });
            if busy {
                return Err(MeshError::DuplicateConnect(address.to_string()));
            }
            sessions.connecting.insert(address.to_string());
            set_state_by_address(&mut sessions, address, ConnectionState::Connecting);
            ConnectAttempt {
                sessions: self.sessions.clone(),
                address: address.to_string(),
                released: false,
            }
        };

        info!("Connecting to {address} via {kind}");
        let result = transport.connect(address).await;

        let mut sessions = self.lock();
        // Sessions at this address that are not replaced below go back to Disconnected
        attempt.release(&mut sessions);
        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Connection to {address} via {kind} failed: {e:#}");
                return Err(MeshError::Connection {
                    kind,
                    address: address.to_string(),
                    message: format!("{e:#}"),
                });
            }
        };

        let identity = connection.identity;
        let display_name = if identity.short_name.is_empty() {
            address.to_string()
        } else {
            identity.short_name.clone()
        };

        if sessions
            .by_name
            .get(&display_name)
            .is_some_and(|entry| entry.session.info.state == ConnectionState::Connected)
        {
            drop(sessions);
            warn!("{display_name} is already connected through another address; closing {address}");
            let mut link = connection.link;
            if let Err(e) = link.disconnect().await {
                debug!("Closing duplicate link to {address} failed: {e:#}");
            }
            return Err(MeshError::DuplicateConnect(display_name));
        }

        let link_id = LinkId(self.next_link.fetch_add(1, Ordering::Relaxed));
        let mut nodes = NodeTable::default();
        for node in &connection.nodes {
            nodes.update(node);
        }

        let info = SessionInfo {
            display_name: display_name.clone(),
            transport: kind,
            address: address.to_string(),
            state: ConnectionState::Connected,
            node_id: identity.node_id,
            node_num: identity.node_num,
            long_name: identity.long_name,
        };

        let link: SharedLink = Arc::new(Mutex::new(connection.link));
        sessions.by_name.insert(
            display_name.clone(),
            SessionEntry {
                session: Session {
                    info: info.clone(),
                    nodes,
                },
                link_id,
                link: Some(link.clone()),
            },
        );
        sessions.links.insert(link_id, display_name.clone());
        drop(sessions);

        let sink = self.bus.sink(link_id);
        sink.on_connection_established(info.clone(), connection.channels, connection.nodes);
        link.lock().await.start(sink);

        info!("Connected to {display_name} ({address}) as {link_id}");
        Ok(info)
    }

    /// Connect using a transport name such as `"tcp"`
    pub async fn connect_named(&self, kind: &str, address: &str) -> Result<SessionInfo, MeshError> {
        let kind = TransportKind::parse(kind)?;
        self.connect(kind, address).await
    }

    /// Close a session's link. The session and its buffers stay known.
    pub async fn disconnect(&self, name: &str) -> Result<(), MeshError> {
        let (link, info) = self.close_session(name).await?;

        if let Some(link) = link {
            link.lock()
                .await
                .disconnect()
                .await
                .map_err(|e| MeshError::Connection {
                    kind: info.transport,
                    address: info.address.clone(),
                    message: format!("disconnect failed: {e:#}"),
                })?;
        }
        info!("Disconnected from {name}");
        Ok(())
    }

    /// Mark a session Disconnected and emit `ConnectionLost` without talking to the
    /// transport. Used after operations that make the radio drop the link itself.
    pub async fn force_disconnect_signal(&self, name: &str) -> Result<(), MeshError> {
        self.close_session(name).await?;
        info!("Marked {name} as disconnected");
        Ok(())
    }

    async fn close_session(
        &self,
        name: &str,
    ) -> Result<(Option<SharedLink>, SessionInfo), MeshError> {
        let (link, link_id, info) = {
            let mut sessions = self.lock();
            let entry = sessions
                .by_name
                .get_mut(name)
                .ok_or_else(|| MeshError::UnknownSession(name.to_string()))?;
            entry.session.info.state = ConnectionState::Disconnected;
            (entry.link.take(), entry.link_id, entry.session.info.clone())
        };
        self.bus.sink(link_id).on_connection_lost();
        Ok((link, info))
    }

    /// Apply a `ConnectionLost` for `link`.
    ///
    /// Returns the session name the first time a link is reported lost, even when
    /// a reconnect has already replaced it, so that every link's loss is announced.
    /// Repeated reports return `None`.
    pub async fn mark_lost(&self, link: LinkId) -> Option<String> {
        let mut sessions = self.lock();
        let name = sessions.links.remove(&link)?;
        if let Some(entry) = sessions.by_name.get_mut(&name)
            && entry.link_id == link
        {
            entry.session.info.state = ConnectionState::Disconnected;
            entry.link = None;
        }
        Some(name)
    }

    /// Transmit on a Connected session
    pub async fn send_text(
        &self,
        name: &str,
        text: &str,
        destination: &Destination,
        channel: u32,
        want_ack: bool,
    ) -> Result<(), MeshError> {
        let link = self.connected_link(name).await?;
        link.lock()
            .await
            .send_text(text, destination, channel, want_ack)
            .await
            .map_err(|e| MeshError::Send {
                device: name.to_string(),
                message: format!("{e:#}"),
            })
    }

    /// Ask the radio to clear its node database, then signal a disconnect since
    /// the radio reboots
    pub async fn reset_node_db(&self, name: &str) -> Result<(), MeshError> {
        let link = self.connected_link(name).await?;
        link.lock()
            .await
            .reset_node_db()
            .await
            .map_err(|e| MeshError::Send {
                device: name.to_string(),
                message: format!("node database reset failed: {e:#}"),
            })?;
        warn!("Node database reset requested on {name}; the radio will reboot");
        self.force_disconnect_signal(name).await
    }

    pub async fn reboot(&self, name: &str, delay_secs: i32) -> Result<(), MeshError> {
        let link = self.connected_link(name).await?;
        link.lock()
            .await
            .reboot(delay_secs)
            .await
            .map_err(|e| MeshError::Send {
                device: name.to_string(),
                message: format!("reboot failed: {e:#}"),
            })?;
        info!("Reboot requested on {name} in {delay_secs}s");
        self.force_disconnect_signal(name).await
    }

    async fn connected_link(&self, name: &str) -> Result<SharedLink, MeshError> {
        let sessions = self.lock();
        let entry = sessions
            .by_name
            .get(name)
            .ok_or_else(|| MeshError::UnknownSession(name.to_string()))?;
        if entry.session.info.state != ConnectionState::Connected {
            return Err(MeshError::SessionClosed(name.to_string()));
        }
        entry
            .link
            .clone()
            .ok_or_else(|| MeshError::SessionClosed(name.to_string()))
    }

    /// Run `f` against the live session behind `link`
    pub async fn with_session<R>(&self, link: LinkId, f: impl FnOnce(&Session) -> R) -> Option<R> {
        let sessions = self.lock();
        let name = sessions.links.get(&link)?;
        let entry = sessions.by_name.get(name)?;
        (entry.link_id == link).then(|| f(&entry.session))
    }

    /// Merge a node update into the session's table; returns the session name
    pub async fn update_node(&self, link: LinkId, record: &NodeRecord) -> Option<String> {
        let mut sessions = self.lock();
        let name = sessions.links.get(&link)?.clone();
        let entry = sessions.by_name.get_mut(&name)?;
        if entry.link_id != link {
            return None;
        }
        entry.session.nodes.update(record);
        Some(name)
    }

    /// Look up a remote node by short name in a session's table
    pub async fn find_node(&self, name: &str, short_name: &str) -> Result<NodeRecord, MeshError> {
        let sessions = self.lock();
        let entry = sessions
            .by_name
            .get(name)
            .ok_or_else(|| MeshError::UnknownSession(name.to_string()))?;
        entry
            .session
            .nodes
            .find_by_short_name(short_name)
            .cloned()
            .ok_or_else(|| MeshError::UnknownNode {
                device: name.to_string(),
                node: short_name.to_string(),
            })
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.lock();
        let mut infos: Vec<SessionInfo> = sessions
            .by_name
            .values()
            .map(|entry| entry.session.info.clone())
            .collect();
        infos.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        infos
    }

    pub async fn session(&self, name: &str) -> Option<SessionInfo> {
        let sessions = self.lock();
        sessions
            .by_name
            .get(name)
            .map(|entry| entry.session.info.clone())
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.session(name)
            .await
            .is_some_and(|info| info.state == ConnectionState::Connected)
    }

    /// Names and addresses of every Connected session, for filtering scan results
    pub async fn known_names(&self) -> HashSet<String> {
        let sessions = self.lock();
        sessions
            .by_name
            .values()
            .filter(|entry| entry.session.info.state == ConnectionState::Connected)
            .flat_map(|entry| {
                [
                    entry.session.info.display_name.clone(),
                    entry.session.info.address.clone(),
                ]
            })
            .collect()
    }

    /// Disconnect every Connected session, logging failures
    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self
            .sessions()
            .await
            .into_iter()
            .filter(|info| info.state == ConnectionState::Connected)
            .map(|info| info.display_name)
            .collect();

        for name in names {
            if let Err(e) = self.disconnect(&name).await {
                warn!("Failed to disconnect {name}: {e}");
            }
        }
    }
}

fn set_state_by_address(sessions: &mut Sessions, address: &str, state: ConnectionState) {
    for entry in sessions.by_name.values_mut() {
        if entry.session.info.address == address
            && entry.session.info.state != ConnectionState::Connected
        {
            entry.session.info.state = state;
        }
    }
}
