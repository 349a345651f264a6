// src/transaction/mod.rs

//! Client side of a package transaction
//!
//! A [`TransactionSession`] plans against the client's own catalog snapshot
//! and then drives the worker through one locked session:
//!
//! ```text
//! resolve ─► Init ─► Add/Remove/Load ─► Prepare ─┬─ nothing to do ─► done
//!                                                ├─ providers ─► Release, choose, Init again
//!                                                └─ ready ─► confirm ─┬─ Commit
//!                                                                     └─ Release
//! ```
//!
//! Resolution errors surface before the worker is contacted, so a request
//! that cannot succeed never takes the database lock.

use crate::catalog::PackageCatalog;
use crate::daemon::{AddEntry, DaemonClient, PrepareReply, RemoveEntry};
use crate::error::{Error, Result};
use crate::resolver::{
    Ambiguity, ConflictResolver, DesiredStateSet, ProviderChooser, Resolution, ResolverPolicy,
};
use crate::updates::{UpdateChecker, UpdateSet};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Rounds of provider questions before giving up
const MAX_PROVIDER_ROUNDS: usize = 4;

/// What the user is asked to confirm
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionSummary {
    pub to_add: Vec<AddEntry>,
    /// Names in `to_add` that are already installed
    pub to_upgrade: Vec<String>,
    pub to_remove: Vec<RemoveEntry>,
    pub download_size: u64,
    /// Resolver warnings (replacements, removed conflicts, dropped pairs)
    pub warnings: Vec<String>,
}

impl TransactionSummary {
    /// Names being installed for the first time
    pub fn new_installs(&self) -> impl Iterator<Item = &AddEntry> {
        self.to_add
            .iter()
            .filter(|entry| !self.to_upgrade.contains(&entry.name))
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The worker found nothing to change
    NothingToDo,
    /// The user declined; the session was released
    Declined(TransactionSummary),
    /// The worker committed the transaction
    Committed(TransactionSummary),
}

/// One planning session against a running worker
pub struct TransactionSession<'a> {
    worker: &'a DaemonClient,
    catalog: &'a PackageCatalog,
    policy: &'a ResolverPolicy,
    options: BTreeMap<String, bool>,
    ignored: Vec<String>,
    sync_first: Vec<String>,
}

impl<'a> TransactionSession<'a> {
    pub fn new(
        worker: &'a DaemonClient,
        catalog: &'a PackageCatalog,
        policy: &'a ResolverPolicy,
    ) -> Self {
        Self {
            worker,
            catalog,
            policy,
            options: BTreeMap::new(),
            ignored: Vec::new(),
            sync_first: Vec::new(),
        }
    }

    /// Set an `Init` option (`sysupgrade`, `needed`, `download_only`, ...)
    pub fn with_option(mut self, key: &str, value: bool) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }

    /// Packages skipped by a system upgrade
    pub fn with_ignored(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.ignored.extend(names);
        self
    }

    /// Packages that must be upgraded alone, before anything else
    pub fn with_sync_first(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.sync_first.extend(names);
        self
    }

    fn sysupgrade(&self) -> bool {
        self.options.get("sysupgrade").copied().unwrap_or(false)
    }

    fn updates(&self) -> UpdateSet {
        UpdateChecker::new(self.catalog)
            .with_ignored(self.ignored.iter().cloned())
            .with_sync_first(self.sync_first.iter().cloned())
            .compute_updates()
    }

    /// Expand `desired` against the local catalog snapshot
    ///
    /// With `sysupgrade` set, every available update joins the request. When
    /// a sync-first package has an update, only the sync-first packages do.
    pub fn resolve(
        &self,
        desired: &DesiredStateSet,
        chooser: &mut dyn ProviderChooser,
    ) -> Result<Resolution> {
        let resolver = ConflictResolver::new(self.catalog, self.policy);
        let resolution = if self.sysupgrade() {
            let updates = self.updates();
            if updates.syncfirst {
                info!(
                    "Upgrading sync-first packages alone: {}",
                    updates
                        .entries
                        .iter()
                        .map(|e| e.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                let mut desired = desired.clone();
                desired
                    .to_add
                    .extend(updates.entries.iter().map(|e| e.name.clone()));
                resolver.resolve(&desired, chooser)?
            } else {
                resolver.resolve_upgrade(desired, &updates.candidates(self.catalog), chooser)?
            }
        } else {
            resolver.resolve(desired, chooser)?
        };

        for warning in &resolution.warnings {
            warn!("{}", warning);
        }
        Ok(resolution)
    }

    /// Plan, confirm and commit `desired`
    ///
    /// `confirm` sees the prepared summary; returning false releases the
    /// session without committing. Provider questions raised by the worker
    /// are answered with `chooser`, an empty answer picking the first
    /// candidate.
    pub async fn run<F>(
        &self,
        desired: &DesiredStateSet,
        chooser: &mut dyn ProviderChooser,
        mut confirm: F,
    ) -> Result<SessionOutcome>
    where
        F: FnMut(&TransactionSummary) -> bool,
    {
        let resolution = self.resolve(desired, chooser)?;
        let mut targets = Targets::from_resolution(&resolution);

        // The upgrade set was spelled out during resolution; a sync-first
        // round must not let the worker pull in everything else
        let mut options = self.options.clone();
        if self.sysupgrade() && self.updates().syncfirst {
            options.insert("sysupgrade".to_string(), false);
        }

        let mut rounds = 0;
        loop {
            // A failed Init leaves someone else's session alone
            self.worker.init(&options).await?;
            let reply = match self.populate_and_prepare(&targets).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.release_quietly().await;
                    return Err(e);
                }
            };

            match reply {
                PrepareReply::NothingToDo => {
                    info!("Nothing to do");
                    return Ok(SessionOutcome::NothingToDo);
                }
                PrepareReply::Providers { choices } => {
                    self.worker.release().await?;
                    rounds += 1;
                    if rounds > MAX_PROVIDER_ROUNDS || !targets.answer(&choices, chooser) {
                        return Err(Error::Resolution(format!(
                            "provider choice for {} was not accepted",
                            choices
                                .iter()
                                .map(|c| c.virtual_name.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        )));
                    }
                    debug!("Retrying with provider choices (round {})", rounds);
                }
                PrepareReply::Ready { to_add, to_remove } => {
                    let summary = self.summarize(&resolution, to_add, to_remove);
                    if !confirm(&summary) {
                        self.worker.release().await?;
                        return Ok(SessionOutcome::Declined(summary));
                    }
                    self.worker.commit().await?;
                    return Ok(SessionOutcome::Committed(summary));
                }
            }
        }
    }

    async fn populate_and_prepare(&self, targets: &Targets) -> Result<PrepareReply> {
        for name in &targets.add {
            self.worker.add(name).await?;
        }
        for name in &targets.remove {
            self.worker.remove(name).await?;
        }
        for path in &targets.load {
            self.worker.load(path).await?;
        }
        self.worker.prepare().await
    }

    fn summarize(
        &self,
        resolution: &Resolution,
        to_add: Vec<AddEntry>,
        to_remove: Vec<RemoveEntry>,
    ) -> TransactionSummary {
        let to_upgrade = to_add
            .iter()
            .filter(|entry| self.catalog.is_installed(&entry.name))
            .map(|entry| entry.name.clone())
            .collect();
        let download_size = to_add.iter().map(|entry| entry.download_size).sum();
        TransactionSummary {
            to_add,
            to_upgrade,
            to_remove,
            download_size,
            warnings: resolution.warnings.iter().map(|w| w.to_string()).collect(),
        }
    }

    /// Release after a failure; the worker normally did so already
    async fn release_quietly(&self) {
        if let Err(e) = self.worker.release().await {
            debug!("Release after failure: {}", e);
        }
    }
}

/// Targets sent to the worker
#[derive(Debug, Clone, Default)]
struct Targets {
    add: BTreeSet<String>,
    remove: BTreeSet<String>,
    load: BTreeSet<PathBuf>,
}

impl Targets {
    fn from_resolution(resolution: &Resolution) -> Self {
        Self {
            add: resolution.desired.to_add.clone(),
            remove: resolution.desired.to_remove.clone(),
            load: resolution.desired.to_load.clone(),
        }
    }

    /// Add the chosen providers; false when nothing new was chosen
    fn answer(&mut self, choices: &[Ambiguity], chooser: &mut dyn ProviderChooser) -> bool {
        let mut progressed = false;
        for ambiguity in choices {
            let mut chosen = chooser.choose(ambiguity);
            chosen.retain(|name| ambiguity.candidates.contains(name));
            if chosen.is_empty()
                && let Some(first) = ambiguity.candidates.first()
            {
                chosen.push(first.clone());
            }
            for name in chosen {
                if self.add.insert(name) {
                    progressed = true;
                }
            }
        }
        progressed
    }
}
