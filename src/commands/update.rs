// src/commands/update.rs
//! Upgrade, update listing and repository refresh

use super::progress::{Finished, SignalRenderer};
use super::session::{connect, load_catalog, run_transaction};
use anyhow::{Context, Result};
use pkgwarden::config::Config;
use pkgwarden::resolver::DesiredStateSet;
use pkgwarden::updates::{RemoteIndex, UpdateChecker, UpdateSet};
use std::collections::BTreeMap;
use std::time::Duration;

/// Upgrade every package with a newer candidate
pub async fn cmd_upgrade(config: &Config, noconfirm: bool) -> Result<()> {
    let mut options = BTreeMap::new();
    options.insert("sysupgrade".to_string(), true);
    run_transaction(config, DesiredStateSet::new(), options, noconfirm).await
}

/// List available updates
///
/// With `remote` the worker computes the list; otherwise it is computed
/// from the local catalog snapshot.
pub async fn cmd_updates(config: &Config, remote: bool) -> Result<()> {
    let updates = if remote {
        connect(config).await?.check_updates().await?
    } else {
        let config = config.clone();
        tokio::task::spawn_blocking(move || local_updates(&config))
            .await
            .context("Update check panicked")??
    };
    print_updates(&updates);
    Ok(())
}

fn local_updates(config: &Config) -> Result<UpdateSet> {
    let catalog = load_catalog(config)?;
    let remote = config.remote_index()?;
    let mut checker = UpdateChecker::new(&catalog)
        .with_ignored(config.options.ignore_pkg.iter().cloned())
        .with_sync_first(config.options.sync_first.iter().cloned());
    if let Some(remote) = &remote {
        checker = checker.with_remote(remote as &dyn RemoteIndex);
    }
    Ok(checker.compute_updates())
}

fn print_updates(updates: &UpdateSet) {
    if updates.is_empty() {
        println!("Your system is up to date.");
        return;
    }
    if updates.syncfirst {
        println!("These packages must be upgraded first:");
    }
    for entry in &updates.entries {
        println!("{:<32} {:<20} {}", entry.name, entry.version, entry.repo);
    }
}

/// Refresh the repository databases through the worker
pub async fn cmd_refresh(config: &Config, force: bool) -> Result<()> {
    let client = connect(config).await?;
    let render = tokio::spawn(SignalRenderer::new().follow(client.subscribe()));
    let result = client.refresh(force).await;

    let finished = tokio::time::timeout(Duration::from_secs(2), render)
        .await
        .ok()
        .and_then(|joined| joined.ok())
        .flatten();
    result?;
    if let Some(Finished::Failed(message)) = finished {
        anyhow::bail!(message);
    }
    Ok(())
}
