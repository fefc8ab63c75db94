use anyhow::Result;
use chrono::Utc;
use comfy_table::Cell;
use meshhub_core::ClientConfig;
use meshhub_core::state::NodeRecord;
use std::time::Duration;

use super::Running;
use crate::output::{OutputFormat, create_table, print_json};
use crate::utils::print_info;

pub async fn handle_nodes(config: ClientConfig, device: String, format: OutputFormat) -> Result<()> {
    let timeout = config.connect_timeout;
    let running = Running::start(config);
    let result = async {
        let session = running.open(&device, timeout).await?;
        let nodes = running.client.snapshot().await.nodes(&session.display_name);
        Ok::<_, anyhow::Error>(nodes)
    }
    .await;
    running.shutdown().await;
    let nodes = result?;

    if nodes.is_empty() {
        print_info("No nodes known to this radio");
        return Ok(());
    }

    match format {
        OutputFormat::Json => print_json(&nodes),
        OutputFormat::Table => {
            let mut table = create_table();
            table.set_header(vec![
                Cell::new("ID"),
                Cell::new("Short"),
                Cell::new("Long"),
                Cell::new("Hardware"),
                Cell::new("SNR"),
                Cell::new("Hops"),
                Cell::new("Battery"),
                Cell::new("Last Heard"),
            ]);
            let now = Utc::now().timestamp().max(0) as u64;
            for node in &nodes {
                table.add_row(vec![
                    Cell::new(node.node_id.as_deref().unwrap_or("-")),
                    Cell::new(node.short_name.as_deref().unwrap_or("-")),
                    Cell::new(node.long_name.as_deref().unwrap_or("-")),
                    Cell::new(node.hw_model.as_deref().unwrap_or("-")),
                    Cell::new(optional(node.snr.map(|snr| format!("{snr:.1} dB")))),
                    Cell::new(optional(node.hops_away.map(|hops| hops.to_string()))),
                    Cell::new(optional(battery(node))),
                    Cell::new(optional(node.last_heard.map(|heard| last_heard(now, heard)))),
                ]);
            }
            println!("{table}");
        }
    }

    Ok(())
}

fn optional(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

fn battery(node: &NodeRecord) -> Option<String> {
    let level = node.device_metrics.as_ref()?.battery_level?;
    // Firmware reports 101 while on external power
    if level > 100 {
        Some("Powered".to_string())
    } else {
        Some(format!("{level}%"))
    }
}

fn last_heard(now: u64, heard: u64) -> String {
    let elapsed = Duration::from_secs(now.saturating_sub(heard));
    format!("{ago} ago", ago = humantime::format_duration(elapsed))
}
