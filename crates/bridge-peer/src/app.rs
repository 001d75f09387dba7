//! Application role.

use anyhow::{Context, Result};
use bridge_ipc::{AppConnection, WorkOutcome};
use tracing::info;

pub async fn run(pipe_id: &str) -> Result<()> {
    let mut conn = AppConnection::start(pipe_id)
        .await
        .context("Failed to host the bridge endpoint")?;
    info!("Waiting for a bridge on session {:?}", pipe_id);
    info!("Launch it with: bridge-peer bridge --pipe-id {:?}", pipe_id);

    let finished = tokio::select! {
        report = conn.run() => Some(report),
        _ = tokio::signal::ctrl_c() => None,
    };
    let report = match finished {
        Some(report) => report.context("Bridge session failed")?,
        None => {
            info!("Shutdown signal received, exiting");
            conn.close();
            return Ok(());
        }
    };

    match report.outcome {
        WorkOutcome::Completed { changes_received } => {
            info!("Bridge finished (changes received: {})", changes_received)
        }
        WorkOutcome::BridgeVanished => info!("Bridge exited without reporting completion"),
    }
    // Intentional stdout so scripts can read the result
    println!(
        "changesReceived = {}, projectName = \"{}\"",
        report.changes_received(),
        report.project_name.as_deref().unwrap_or_default()
    );
    for url in &report.jump_urls {
        println!("jumpUrl = {}", url);
    }

    conn.close();
    Ok(())
}
