// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use cli::{Cli, Commands};
use pkgwarden::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let config = Config::load(&cli.config)?;

    match command {
        Commands::Daemon => commands::cmd_daemon(config).await,
        Commands::Install {
            packages,
            needed,
            download_only,
            noconfirm,
        } => commands::cmd_install(&config, &packages, needed, download_only, noconfirm).await,
        Commands::Remove {
            packages,
            noconfirm,
        } => commands::cmd_remove(&config, &packages, noconfirm).await,
        Commands::Load { paths, noconfirm } => {
            commands::cmd_load(&config, &paths, noconfirm).await
        }
        Commands::Upgrade { noconfirm } => commands::cmd_upgrade(&config, noconfirm).await,
        Commands::Updates { remote } => commands::cmd_updates(&config, remote).await,
        Commands::Refresh { force } => commands::cmd_refresh(&config, force).await,
        Commands::Resolve {
            packages,
            remove,
            sysupgrade,
        } => commands::cmd_resolve(&config, &packages, &remove, sysupgrade),
        Commands::Stop => commands::cmd_stop(&config).await,
    }
}
