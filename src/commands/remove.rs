// src/commands/remove.rs
//! Package removal commands

use super::session::run_transaction;
use anyhow::Result;
use pkgwarden::config::Config;
use pkgwarden::resolver::DesiredStateSet;
use std::collections::BTreeMap;
use tracing::info;

/// Remove installed packages; dependents are removed with them
pub async fn cmd_remove(config: &Config, packages: &[String], noconfirm: bool) -> Result<()> {
    info!("Removing: {}", packages.join(", "));
    let desired = packages
        .iter()
        .fold(DesiredStateSet::new(), |desired, name| desired.remove(name.as_str()));
    run_transaction(config, desired, BTreeMap::new(), noconfirm).await
}
