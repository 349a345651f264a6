// src/commands/session.rs
//! Shared driver for commands that commit a transaction

use super::progress::{Finished, SignalRenderer, package_line};
use anyhow::{Context, Result};
use pkgwarden::catalog::PackageCatalog;
use pkgwarden::config::Config;
use pkgwarden::daemon::DaemonClient;
use pkgwarden::progress::format_size;
use pkgwarden::resolver::{Ambiguity, DesiredStateSet, FirstCandidate, ProviderChooser};
use pkgwarden::transaction::{SessionOutcome, TransactionSession, TransactionSummary};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Connect to the worker named in the configuration
pub async fn connect(config: &Config) -> Result<DaemonClient> {
    let client = DaemonClient::connect(&config.paths.socket)
        .await
        .context("Is the pkgwarden worker running? Start it with `pkgwarden daemon`")?;
    Ok(client.with_timeout(config.fast_call_timeout()))
}

/// Load the local catalog snapshot used for planning
pub fn load_catalog(config: &Config) -> Result<PackageCatalog> {
    PackageCatalog::load(&config.catalog_source()).with_context(|| {
        format!(
            "Failed to read the package catalog under {}",
            config.paths.db_root.display()
        )
    })
}

/// Plan `desired`, ask for confirmation and commit it
pub async fn run_transaction(
    config: &Config,
    desired: DesiredStateSet,
    options: BTreeMap<String, bool>,
    noconfirm: bool,
) -> Result<()> {
    let catalog = load_catalog(config)?;
    let policy = config.resolver_policy()?;
    let client = connect(config).await?;

    let mut session = TransactionSession::new(&client, &catalog, &policy)
        .with_ignored(config.options.ignore_pkg.iter().cloned())
        .with_sync_first(config.options.sync_first.iter().cloned());
    for (key, value) in &options {
        session = session.with_option(key, *value);
    }

    let mut chooser: Box<dyn ProviderChooser> = if noconfirm {
        Box::new(FirstCandidate)
    } else {
        Box::new(prompt_provider)
    };

    let mut render: Option<JoinHandle<Option<Finished>>> = None;
    let confirm = |summary: &TransactionSummary| {
        print_summary(summary);
        let accepted = noconfirm || prompt_yes("Commit transaction?", true);
        if accepted {
            render = Some(tokio::spawn(SignalRenderer::new().follow(client.subscribe())));
        }
        accepted
    };

    let result = {
        let run = session.run(&desired, chooser.as_mut(), confirm);
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => break result,
                _ = tokio::signal::ctrl_c() => {
                    if let Err(e) = client.interrupt().await {
                        debug!("Interrupt refused ({}), releasing", e);
                        let _ = client.release().await;
                        anyhow::bail!("Interrupted");
                    }
                    warn!("Interrupt requested, waiting for the worker");
                }
            }
        }
    };

    let finished = match render {
        Some(task) => tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .ok()
            .and_then(|joined| joined.ok())
            .flatten(),
        None => None,
    };

    match result? {
        SessionOutcome::NothingToDo => println!("Nothing to do."),
        SessionOutcome::Declined(_) => println!("Transaction cancelled."),
        SessionOutcome::Committed(_) => {
            if let Some(Finished::Failed(message)) = finished {
                anyhow::bail!(message);
            }
        }
    }
    Ok(())
}

fn print_summary(summary: &TransactionSummary) {
    for warning in &summary.warnings {
        println!("warning: {}", warning);
    }
    if !summary.to_remove.is_empty() {
        println!("To remove ({}):", summary.to_remove.len());
        for entry in &summary.to_remove {
            println!("{}", package_line(&entry.name, &entry.version, None));
        }
    }
    let installs: Vec<_> = summary.new_installs().collect();
    if !installs.is_empty() {
        println!("To install ({}):", installs.len());
        for entry in installs {
            println!(
                "{}",
                package_line(&entry.name, &entry.version, Some(entry.download_size))
            );
        }
    }
    if !summary.to_upgrade.is_empty() {
        println!("To upgrade ({}):", summary.to_upgrade.len());
        for entry in summary
            .to_add
            .iter()
            .filter(|e| summary.to_upgrade.contains(&e.name))
        {
            println!(
                "{}",
                package_line(&entry.name, &entry.version, Some(entry.download_size))
            );
        }
    }
    if summary.download_size > 0 {
        println!("Total download size: {}", format_size(summary.download_size));
    }
}

fn read_line() -> Option<String> {
    let _ = io::stdout().flush();
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

/// Ask a yes/no question; end of input takes the default
pub fn prompt_yes(question: &str, default: bool) -> bool {
    print!("{} [{}] ", question, if default { "Y/n" } else { "y/N" });
    match read_line().as_deref() {
        None | Some("") => default,
        Some(answer) => matches!(answer, "y" | "Y" | "yes" | "Yes"),
    }
}

/// Ask which provider to install; empty input picks the first
fn prompt_provider(ambiguity: &Ambiguity) -> Vec<String> {
    println!(
        "There are {} providers available for {}:",
        ambiguity.candidates.len(),
        ambiguity.virtual_name
    );
    for (i, candidate) in ambiguity.candidates.iter().enumerate() {
        println!("  {}) {}", i + 1, candidate);
    }
    print!("Enter a number (default=1): ");
    read_line()
        .and_then(|answer| answer.parse::<usize>().ok())
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| ambiguity.candidates.get(i).cloned())
        .into_iter()
        .collect()
}
