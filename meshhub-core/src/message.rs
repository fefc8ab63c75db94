use tracing::debug;

use crate::client::MeshClient;
use crate::error::MeshError;
use crate::state::{Message, now_timestamp};
use crate::transport::Destination;

/// Broadcast `text` on one of a device's channels.
///
/// The message is mirrored into the channel buffer and the channel log
/// only after the transport accepts it.
pub async fn send_channel_text(
    client: &MeshClient,
    device: &str,
    channel_index: u32,
    text: &str,
) -> Result<Message, MeshError> {
    if text.trim().is_empty() {
        return Err(MeshError::EmptyMessage);
    }

    let channel = {
        let store = client.store();
        let store = store.lock().await;
        let channel = store
            .channel(device, channel_index)
            .ok_or_else(|| MeshError::UnknownChannel {
                device: device.to_string(),
                index: channel_index,
            })?;
        if !channel.is_enabled() {
            return Err(MeshError::ChannelDisabled {
                device: device.to_string(),
                index: channel_index,
            });
        }
        channel.key()
    };

    client
        .connections()
        .send_text(
            device,
            text,
            &Destination::Broadcast,
            channel_index,
            client.config().want_ack_broadcast,
        )
        .await?;
    debug!("Sent channel message on {device}/{channel}");

    let message = Message::channel(now_timestamp(), device, &channel, text);
    client
        .record_channel_message(device, &channel, message.clone())
        .await;
    Ok(message)
}

/// Send `text` to the node whose short name is `remote` in the device's node list.
///
/// On success the message lands in the direct buffer, the conversation with
/// `remote`, and the direct log.
pub async fn send_direct_text(
    client: &MeshClient,
    device: &str,
    remote: &str,
    text: &str,
) -> Result<Message, MeshError> {
    if text.trim().is_empty() {
        return Err(MeshError::EmptyMessage);
    }

    let node = client.connections().find_node(device, remote).await?;
    if node.node_id.is_none() && node.node_num.is_none() {
        return Err(MeshError::UnknownNode {
            device: device.to_string(),
            node: remote.to_string(),
        });
    }
    let destination = Destination::Node {
        id: node.node_id.clone(),
        num: node.node_num,
    };

    client
        .connections()
        .send_text(device, text, &destination, 0, false)
        .await?;
    debug!("Sent direct message from {device} to {remote}");

    let message = Message::direct(now_timestamp(), device, remote, remote, text);
    client
        .record_direct_message(device, remote, message.clone())
        .await;
    Ok(message)
}
