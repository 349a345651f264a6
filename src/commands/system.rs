// src/commands/system.rs
//! Worker lifecycle commands

use super::session::connect;
use anyhow::Result;
use pkgwarden::config::Config;
use pkgwarden::daemon;
use tracing::info;

/// Run the privileged worker in the foreground
pub async fn cmd_daemon(config: Config) -> Result<()> {
    daemon::run_daemon(config).await?;
    Ok(())
}

/// Ask the running worker to stop
pub async fn cmd_stop(config: &Config) -> Result<()> {
    if !daemon::is_daemon_running(config) {
        println!("The worker is not running.");
        return Ok(());
    }
    connect(config).await?.stop_daemon().await?;
    info!("Worker stopped");
    Ok(())
}
