use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info};

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, SessionInfo};
use crate::dispatch::{Dispatcher, Notification};
use crate::error::MeshError;
use crate::event::EventBus;
use crate::persist::{self, ChannelLogRecord, DirectLogRecord, LogRecord, MessageLog};
use crate::state::{Message, StateStore};
use crate::transport::{TransportKind, TransportRegistry, TransportScanner};

const NOTIFICATION_CAPACITY: usize = 256;

/// Entry point tying sessions, the state store and the message logs together.
///
/// Cloning is cheap. The [`Dispatcher`] returned by [`MeshClient::new`] must be
/// driven (usually spawned) for inbound traffic to reach the store.
#[derive(Clone)]
pub struct MeshClient {
    config: Arc<ClientConfig>,
    connections: ConnectionManager,
    store: Arc<Mutex<StateStore>>,
    log: Arc<MessageLog>,
    notifications: broadcast::Sender<Notification>,
}

impl MeshClient {
    pub fn new(config: ClientConfig, registry: TransportRegistry) -> (Self, Dispatcher) {
        let (bus, events) = EventBus::channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let client = Self {
            log: Arc::new(MessageLog::from_config(&config)),
            config: Arc::new(config),
            connections: ConnectionManager::new(registry, bus),
            store: Arc::new(Mutex::new(StateStore::new())),
            notifications,
        };
        let dispatcher = Dispatcher::new(client.clone(), events);
        (client, dispatcher)
    }

    /// Client over the built-in serial, TCP and (with the feature) BLE transports
    pub fn with_default_transports(config: ClientConfig) -> (Self, Dispatcher) {
        let registry = TransportRegistry::with_defaults(&config);
        Self::new(config, registry)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn scanner(&self) -> TransportScanner {
        TransportScanner::new(self.connections.registry().clone())
    }

    pub fn store(&self) -> Arc<Mutex<StateStore>> {
        self.store.clone()
    }

    /// Point-in-time copy of the store
    pub async fn snapshot(&self) -> StateStore {
        self.store.lock().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Replay both message logs into the store. Call before connecting.
    pub async fn load_history(&self) -> Result<usize, MeshError> {
        let records = self.log.load_all()?;
        let mut store = self.store.lock().await;
        let applied = persist::replay(&records, &mut store);
        info!("Loaded {applied} message(s) from history");
        Ok(applied)
    }

    pub async fn connect(
        &self,
        kind: TransportKind,
        address: &str,
    ) -> Result<SessionInfo, MeshError> {
        self.connections.connect(kind, address).await
    }

    pub async fn disconnect(&self, name: &str) -> Result<(), MeshError> {
        self.connections.disconnect(name).await
    }

    pub(crate) fn notify(&self, notification: Notification) {
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    /// Append to the channel buffer, then the channel log
    pub(crate) async fn record_channel_message(
        &self,
        device: &str,
        channel: &str,
        message: Message,
    ) {
        self.store
            .lock()
            .await
            .append_channel_message(device, channel, message.clone());
        let record = LogRecord::Channel(ChannelLogRecord::new(device, channel, &message));
        if let Err(e) = self.write_log(record).await {
            error!("Failed to log channel message on {device}/{channel}: {e}");
        }
        self.notify(Notification::ChannelMessage {
            device: device.to_string(),
            channel: channel.to_string(),
            message,
        });
    }

    /// Append to the direct buffer and the conversation with `remote`, then the direct log
    pub(crate) async fn record_direct_message(&self, device: &str, remote: &str, message: Message) {
        self.store
            .lock()
            .await
            .append_direct_message(device, remote, message.clone());
        let record = LogRecord::Direct(DirectLogRecord::new(device, remote, &message));
        if let Err(e) = self.write_log(record).await {
            error!("Failed to log direct message on {device} with {remote}: {e}");
        }
        self.notify(Notification::DirectMessage {
            device: device.to_string(),
            remote: remote.to_string(),
            message,
        });
    }

    /// Write one log row on the blocking pool; failures are counted, never raised
    async fn write_log(&self, record: LogRecord) -> Result<(), String> {
        let log = self.log.clone();
        let failure = match tokio::task::spawn_blocking(move || log.append(&record)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("log writer task failed: {e}"),
        };
        self.store.lock().await.diagnostics_mut().persistence_failures += 1;
        Err(failure)
    }
}
