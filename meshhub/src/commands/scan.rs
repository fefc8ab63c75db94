use anyhow::Result;
use comfy_table::Cell;
use indicatif::{ProgressBar, ProgressStyle};
use meshhub_core::{ClientConfig, MeshClient};
use std::time::Duration;

use crate::output::{OutputFormat, create_table, print_json};
use crate::utils::{print_info, print_warning};

pub async fn handle_scan(
    config: ClientConfig,
    transports: Vec<String>,
    format: OutputFormat,
) -> Result<()> {
    let (client, _dispatcher) = MeshClient::with_default_transports(config);
    let scanner = client.scanner();

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message("Scanning for devices...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let report = if transports.is_empty() {
        scanner.scan_all().await
    } else {
        match scanner.scan_named(&transports).await {
            Ok(report) => report,
            Err(e) => {
                spinner.finish_and_clear();
                return Err(e.into());
            }
        }
    };
    spinner.finish_and_clear();

    for failure in &report.failures {
        print_warning(&format!("{kind}: {error}", kind = failure.kind, error = failure.error));
    }

    if report.is_empty() {
        print_info("No devices found");
        return Ok(());
    }

    match format {
        OutputFormat::Json => print_json(&report.devices),
        OutputFormat::Table => {
            let mut table = create_table();
            table.set_header(vec![
                Cell::new("Transport"),
                Cell::new("Address"),
                Cell::new("Name"),
            ]);
            for device in &report.devices {
                table.add_row(vec![
                    Cell::new(device.transport),
                    Cell::new(&device.address),
                    Cell::new(&device.display_name),
                ]);
            }
            println!("{table}");
        }
    }

    Ok(())
}
