mod admin;
mod history;
mod message;
mod monitor;
mod nodes;
mod scan;

use anyhow::{Context, Result, bail};
use meshhub_core::transport::parse_device_spec;
use meshhub_core::{ClientConfig, MeshClient, Notification, SessionInfo};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cli::{Cli, Commands};
use crate::output::OutputFormat;

pub async fn handle_command(cli: Cli) -> Result<()> {
    // Determine output format
    let output_format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let config = cli.client_config();

    match cli.command {
        Commands::Scan { transport } => scan::handle_scan(config, transport, output_format).await,
        Commands::Monitor { devices } => {
            monitor::handle_monitor(config, devices, output_format).await
        }
        Commands::Send {
            device,
            channel,
            text,
        } => message::handle_send(config, device, channel, text, output_format).await,
        Commands::Direct { device, to, text } => {
            message::handle_direct(config, device, to, text, output_format).await
        }
        Commands::History { kind, device } => {
            history::handle_history(config, kind, device, output_format).await
        }
        Commands::Nodes { device } => nodes::handle_nodes(config, device, output_format).await,
        Commands::ResetNodeDb { device, confirm } => {
            admin::handle_reset_node_db(config, device, confirm).await
        }
    }
}

/// A client with its dispatcher running in the background
pub(crate) struct Running {
    pub client: MeshClient,
    dispatcher: JoinHandle<()>,
}

impl Running {
    pub fn start(config: ClientConfig) -> Self {
        let (client, dispatcher) = MeshClient::with_default_transports(config);
        Self {
            client,
            dispatcher: tokio::spawn(dispatcher.run()),
        }
    }

    /// Connect to a `kind:address` device and wait until the store has registered it
    pub async fn open(&self, spec: &str, timeout: Duration) -> Result<SessionInfo> {
        let (kind, address) = parse_device_spec(spec)?;
        let mut notifications = self.client.subscribe();
        let session = self
            .client
            .connect(kind, &address)
            .await
            .with_context(|| format!("Failed to connect to {spec}"))?;
        wait_for_device(&mut notifications, &session.display_name, timeout).await?;
        Ok(session)
    }

    pub async fn shutdown(self) {
        self.client.connections().disconnect_all().await;
        self.dispatcher.abort();
    }
}

async fn wait_for_device(
    notifications: &mut broadcast::Receiver<Notification>,
    device: &str,
    timeout: Duration,
) -> Result<()> {
    let wait = async {
        loop {
            match notifications.recv().await {
                Ok(Notification::DeviceConnected { device: name }) if name == device => {
                    return Ok(());
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    bail!("Client shut down while waiting for {device}")
                }
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .with_context(|| format!("Timed out waiting for {device} to register"))?
}
