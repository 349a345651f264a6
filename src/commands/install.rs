// src/commands/install.rs
//! Package installation commands

use super::session::run_transaction;
use anyhow::Result;
use pkgwarden::config::Config;
use pkgwarden::resolver::DesiredStateSet;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

/// Install or upgrade packages from the sync repositories
pub async fn cmd_install(
    config: &Config,
    packages: &[String],
    needed: bool,
    download_only: bool,
    noconfirm: bool,
) -> Result<()> {
    info!("Installing: {}", packages.join(", "));
    let desired = packages
        .iter()
        .fold(DesiredStateSet::new(), |desired, name| desired.add(name.as_str()));

    let mut options = BTreeMap::new();
    if needed {
        options.insert("needed".to_string(), true);
    }
    if download_only {
        options.insert("download_only".to_string(), true);
    }
    run_transaction(config, desired, options, noconfirm).await
}

/// Install package files
pub async fn cmd_load(config: &Config, paths: &[PathBuf], noconfirm: bool) -> Result<()> {
    let desired = paths
        .iter()
        .fold(DesiredStateSet::new(), |desired, path| desired.load(path.as_path()));
    run_transaction(config, desired, BTreeMap::new(), noconfirm).await
}
