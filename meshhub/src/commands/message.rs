use anyhow::Result;
use meshhub_core::message::{send_channel_text, send_direct_text};
use meshhub_core::ClientConfig;
use serde::Serialize;

use super::Running;
use crate::output::{OutputFormat, print_json};
use crate::utils::print_success;

#[derive(Debug, Serialize)]
struct SentMessage {
    pub device: String,
    pub destination: String,
    pub channel: Option<u32>,
    pub text: String,
    pub timestamp: String,
}

pub async fn handle_send(
    config: ClientConfig,
    device: String,
    channel: u32,
    text: String,
    format: OutputFormat,
) -> Result<()> {
    let timeout = config.connect_timeout;
    let running = Running::start(config);
    let result = async {
        let session = running.open(&device, timeout).await?;
        let message =
            send_channel_text(&running.client, &session.display_name, channel, &text).await?;
        Ok::<_, anyhow::Error>(SentMessage {
            device: session.display_name,
            timestamp: message.formatted_time(),
            destination: message.key.unwrap_or_default(),
            channel: Some(channel),
            text: message.text,
        })
    }
    .await;
    running.shutdown().await;

    report(result?, format);
    Ok(())
}

pub async fn handle_direct(
    config: ClientConfig,
    device: String,
    to: String,
    text: String,
    format: OutputFormat,
) -> Result<()> {
    let timeout = config.connect_timeout;
    let running = Running::start(config);
    let result = async {
        let session = running.open(&device, timeout).await?;
        let message = send_direct_text(&running.client, &session.display_name, &to, &text).await?;
        Ok::<_, anyhow::Error>(SentMessage {
            device: session.display_name,
            timestamp: message.formatted_time(),
            destination: to.clone(),
            channel: None,
            text: message.text,
        })
    }
    .await;
    running.shutdown().await;

    report(result?, format);
    Ok(())
}

fn report(sent: SentMessage, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&sent),
        OutputFormat::Table => print_success(&format!(
            "Message sent from {device} to {destination}",
            device = sent.device,
            destination = sent.destination
        )),
    }
}
