use anyhow::{Context, Result};
use comfy_table::Cell;
use meshhub_core::ClientConfig;
use meshhub_core::persist::{LogRecord, MessageLog};

use crate::cli::HistoryKind;
use crate::output::{OutputFormat, create_table, print_json};
use crate::utils::print_info;

pub async fn handle_history(
    config: ClientConfig,
    kind: HistoryKind,
    device: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let log = MessageLog::from_config(&config);
    let records = log.load_all().context("Failed to read message history")?;
    let matches_device = |name: &str| device.as_deref().is_none_or(|wanted| wanted == name);

    match kind {
        HistoryKind::Channels => {
            let rows: Vec<_> = records
                .iter()
                .filter_map(|record| match record {
                    LogRecord::Channel(row) if matches_device(&row.device) => Some(row),
                    _ => None,
                })
                .collect();
            if rows.is_empty() {
                print_info(&format!(
                    "No channel messages in {path}",
                    path = log.channel_path().display()
                ));
                return Ok(());
            }
            match format {
                OutputFormat::Json => print_json(&rows),
                OutputFormat::Table => {
                    let mut table = create_table();
                    table.set_header(vec![
                        Cell::new("Time"),
                        Cell::new("Device"),
                        Cell::new("Channel"),
                        Cell::new("From"),
                        Cell::new("Message"),
                    ]);
                    for row in rows {
                        table.add_row(vec![
                            Cell::new(&row.timestamp),
                            Cell::new(&row.device),
                            Cell::new(&row.channel),
                            Cell::new(&row.sender),
                            Cell::new(&row.message),
                        ]);
                    }
                    println!("{table}");
                }
            }
        }
        HistoryKind::Direct => {
            let rows: Vec<_> = records
                .iter()
                .filter_map(|record| match record {
                    LogRecord::Direct(row) if matches_device(&row.device) => Some(row),
                    _ => None,
                })
                .collect();
            if rows.is_empty() {
                print_info(&format!(
                    "No direct messages in {path}",
                    path = log.direct_path().display()
                ));
                return Ok(());
            }
            match format {
                OutputFormat::Json => print_json(&rows),
                OutputFormat::Table => {
                    let mut table = create_table();
                    table.set_header(vec![
                        Cell::new("Time"),
                        Cell::new("Device"),
                        Cell::new("With"),
                        Cell::new("From"),
                        Cell::new("To"),
                        Cell::new("Message"),
                    ]);
                    for row in rows {
                        table.add_row(vec![
                            Cell::new(&row.timestamp),
                            Cell::new(&row.device),
                            Cell::new(&row.remote),
                            Cell::new(&row.from),
                            Cell::new(&row.to),
                            Cell::new(&row.message),
                        ]);
                    }
                    println!("{table}");
                }
            }
        }
    }

    Ok(())
}
