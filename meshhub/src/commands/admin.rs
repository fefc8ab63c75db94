use anyhow::{Result, bail};
use colored::*;
use meshhub_core::ClientConfig;

use super::Running;
use crate::utils::{print_error, print_success, print_warning};

pub async fn handle_reset_node_db(config: ClientConfig, device: String, confirm: bool) -> Result<()> {
    if !confirm {
        print_error("NODE DATABASE RESET WILL FORGET EVERY KNOWN NODE!");
        println!(
            "{message}",
            message = "The radio reboots afterwards and rebuilds its directory from scratch."
                .red()
                .bold()
        );
        print_warning("Use --confirm to proceed with the reset.");
        bail!("Operation cancelled");
    }

    let timeout = config.connect_timeout;
    let running = Running::start(config);
    let result = async {
        let session = running.open(&device, timeout).await?;
        print_warning(&format!(
            "Sending node database reset to {name}...",
            name = session.display_name
        ));
        running
            .client
            .connections()
            .reset_node_db(&session.display_name)
            .await?;
        Ok::<_, anyhow::Error>(session.display_name)
    }
    .await;
    running.shutdown().await;

    let name = result?;
    print_success(&format!(
        "Node database reset sent. {name} will reboot and reconnect as a new session."
    ));
    Ok(())
}
