use anyhow::{Context, Result, bail};
use colored::*;
use meshhub_core::{ClientConfig, Notification};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, warn};

use super::Running;
use crate::output::{OutputFormat, print_json_line};
use crate::utils::{print_info, print_success, print_warning};

pub async fn handle_monitor(
    config: ClientConfig,
    devices: Vec<String>,
    format: OutputFormat,
) -> Result<()> {
    let timeout = config.connect_timeout;
    let running = Running::start(config);

    let replayed = running
        .client
        .load_history()
        .await
        .context("Failed to load message history")?;
    if replayed > 0 {
        print_info(&format!("Restored {replayed} messages from history"));
    }

    // Subscribe before connecting so nothing between connect and the loop is missed
    let mut notifications = running.client.subscribe();

    let mut connected = 0;
    for spec in &devices {
        match running.open(spec, timeout).await {
            Ok(session) => {
                connected += 1;
                print_success(&format!(
                    "Connected to {name} ({long})",
                    name = session.display_name,
                    long = session.long_name
                ));
            }
            Err(e) => error!("{e:#}"),
        }
    }
    if connected == 0 {
        running.shutdown().await;
        bail!("No device could be connected");
    }

    print_info("Monitoring mesh traffic. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                print_info("Stopping monitor");
                break;
            }
            received = notifications.recv() => match received {
                Ok(notification) => show(&notification, format),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Monitor fell behind, skipped {skipped} notifications");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let diagnostics = running.client.snapshot().await.diagnostics();
    running.shutdown().await;
    if format == OutputFormat::Json {
        print_json_line(&diagnostics);
    } else if diagnostics.persistence_failures > 0 {
        print_warning(&format!(
            "{count} messages could not be written to the history logs",
            count = diagnostics.persistence_failures
        ));
    }
    Ok(())
}

fn show(notification: &Notification, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json_line(notification);
        return;
    }

    match notification {
        Notification::DeviceConnected { device } => {
            println!("{} {device} connected", "●".green());
        }
        Notification::DeviceDisconnected { device } => {
            println!("{} {device} disconnected", "●".red());
        }
        Notification::ChannelMessage {
            device,
            channel,
            message,
        } => {
            println!(
                "[{time}] {device}/{channel} {from}: {text}",
                time = message.formatted_time().dimmed(),
                channel = channel.cyan(),
                from = message.from.bold(),
                text = message.text
            );
        }
        Notification::DirectMessage {
            device,
            remote,
            message,
        } => {
            println!(
                "[{time}] {device} {arrow} {remote} {from}: {text}",
                time = message.formatted_time().dimmed(),
                arrow = "⇄".magenta(),
                remote = remote.magenta(),
                from = message.from.bold(),
                text = message.text
            );
        }
        Notification::NodeUpdated { device, node } => {
            println!(
                "{device} heard {id} {short}",
                id = node.node_id.as_deref().unwrap_or("<unknown>").dimmed(),
                short = node.short_name.as_deref().unwrap_or("")
            );
        }
        Notification::PassThrough {
            device,
            destination,
            sender,
        } => {
            println!(
                "{device} relayed {sender} {arrow} {to}",
                arrow = "→".dimmed(),
                to = destination.as_deref().unwrap_or("<none>")
            );
        }
    }
}
