use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::classify::{MessageKind, Sender, classify};
use crate::client::MeshClient;
use crate::event::{LinkId, MeshEvent, Packet};
use crate::state::{Message, NodeRecord};

/// Store changes pushed to subscribers after they are applied
#[derive(Debug, Clone, Serialize)]
pub enum Notification {
    DeviceConnected {
        device: String,
    },
    DeviceDisconnected {
        device: String,
    },
    ChannelMessage {
        device: String,
        channel: String,
        message: Message,
    },
    DirectMessage {
        device: String,
        remote: String,
        message: Message,
    },
    NodeUpdated {
        device: String,
        node: NodeRecord,
    },
    PassThrough {
        device: String,
        destination: Option<String>,
        sender: String,
    },
}

/// Sole consumer of the event queue; applies events to the store one at a time
pub struct Dispatcher {
    client: MeshClient,
    events: mpsc::UnboundedReceiver<MeshEvent>,
}

impl Dispatcher {
    pub(crate) fn new(client: MeshClient, events: mpsc::UnboundedReceiver<MeshEvent>) -> Self {
        Self { client, events }
    }

    /// Process events until the task is cancelled
    pub async fn run(mut self) {
        info!("Starting event dispatcher");
        while let Some(event) = self.events.recv().await {
            self.handle(event).await;
        }
        info!("Event dispatcher stopped");
    }

    /// Process every event already queued, without waiting for more
    pub async fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle(event).await;
            handled += 1;
        }
        handled
    }

    pub async fn handle(&self, event: MeshEvent) {
        match event {
            MeshEvent::ConnectionEstablished {
                session,
                channels,
                nodes,
                ..
            } => {
                let device = session.display_name;
                {
                    let store = self.client.store();
                    let mut store = store.lock().await;
                    store.register_device(&device, &channels);
                    for node in nodes {
                        store.upsert_node(&device, node);
                    }
                }
                info!("{device} is connected");
                self.client
                    .notify(Notification::DeviceConnected { device });
            }

            MeshEvent::ConnectionLost { link } => {
                let Some(device) = self.client.connections().mark_lost(link).await else {
                    debug!("Ignoring repeated connection loss for {link}");
                    return;
                };
                self.client.store().lock().await.remove_device(&device);
                warn!("Lost connection to {device}");
                self.client
                    .notify(Notification::DeviceDisconnected { device });
            }

            MeshEvent::PacketReceived { link, packet } => self.handle_packet(link, packet).await,

            MeshEvent::NodeUpdated { link, node } => {
                let Some(device) = self.client.connections().update_node(link, &node).await else {
                    debug!("Ignoring node update from inactive {link}");
                    return;
                };
                let stored = self
                    .client
                    .store()
                    .lock()
                    .await
                    .upsert_node(&device, node.clone());
                if stored {
                    self.client
                        .notify(Notification::NodeUpdated { device, node });
                }
            }
        }
    }

    async fn handle_packet(&self, link: LinkId, packet: Packet) {
        let Some((device, classified)) = self
            .client
            .connections()
            .with_session(link, |session| {
                (session.info.display_name.clone(), classify(&packet, session))
            })
            .await
        else {
            debug!("Ignoring packet from inactive {link}");
            return;
        };
        let sender = classified.sender.display_name().to_string();

        match classified.kind {
            MessageKind::Direct => {
                // Unnamed senders are filed under their node id so conversations stay apart
                let remote = match &classified.sender {
                    Sender::Named(name) => name.clone(),
                    _ => packet.from_id.clone().unwrap_or_else(|| sender.clone()),
                };
                debug!("Direct message on {device} from {sender}");
                let message = Message::direct(
                    classified.timestamp,
                    &sender,
                    &device,
                    &remote,
                    &classified.text,
                );
                self.client
                    .record_direct_message(&device, &remote, message)
                    .await;
            }

            MessageKind::Broadcast => {
                let channel = {
                    let store = self.client.store();
                    let mut store = store.lock().await;
                    if classified.channel_index.is_none() {
                        store.diagnostics_mut().unknown_channel_packets += 1;
                        warn!("Broadcast on {device} from {sender} has no channel index");
                    }
                    store.channel_key(&device, classified.channel_index)
                };
                debug!("Channel message on {device}/{channel} from {sender}");
                let message =
                    Message::channel(classified.timestamp, &sender, &channel, &classified.text);
                self.client
                    .record_channel_message(&device, &channel, message)
                    .await;
            }

            MessageKind::PassThrough => {
                self.client
                    .store()
                    .lock()
                    .await
                    .diagnostics_mut()
                    .pass_through_packets += 1;
                warn!(
                    "Pass-through packet on {device} from {sender} to {to}",
                    to = classified.destination.as_deref().unwrap_or("<none>")
                );
                self.client.notify(Notification::PassThrough {
                    device,
                    destination: classified.destination,
                    sender,
                });
            }
        }
    }
}
