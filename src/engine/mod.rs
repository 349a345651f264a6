// src/engine/mod.rs

//! Package engine boundary
//!
//! The worker never touches the package database itself. Everything that
//! reads or mutates the system goes through a [`PackageEngine`]: catalog
//! snapshots, repository refresh, the dry-run `prepare`, and `commit`.
//! Engines report progress as [`EngineEvent`]s on an [`EventSink`]; the
//! worker translates them into client signals.
//!
//! `prepare` and `commit` are blocking calls. The worker runs them on a
//! blocking thread so its event loop stays responsive.

mod local;

pub use local::LocalEngine;

use crate::catalog::{PackageCatalog, PackageRef};
use crate::error::Result;
use crate::progress::EngineEvent;
use crate::resolver::Ambiguity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Channel engines report progress on
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<UnboundedSender<EngineEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops everything
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Report an event; a closed channel is not an error
    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Options passed to `Init`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFlags {
    /// Upgrade every installed package with a newer candidate
    pub sysupgrade: bool,
    /// Skip targets already installed at the candidate version
    pub needed: bool,
    /// Download packages without installing them
    pub download_only: bool,
    /// Only update the database, skip downloads
    pub db_only: bool,
}

impl TransactionFlags {
    /// Build flags from the `Init` options map; unknown keys are ignored
    pub fn from_options(options: &BTreeMap<String, bool>) -> Self {
        let mut flags = Self::default();
        for (key, value) in options {
            match key.as_str() {
                "sysupgrade" => flags.sysupgrade = *value,
                "needed" => flags.needed = *value,
                "downloadonly" | "download_only" => flags.download_only = *value,
                "dbonly" | "db_only" => flags.db_only = *value,
                other => debug!("Ignoring unknown transaction option {}", other),
            }
        }
        flags
    }
}

/// Targets accumulated between `Init` and `Prepare`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSet {
    pub add: BTreeSet<String>,
    pub remove: BTreeSet<String>,
    pub load: BTreeSet<PathBuf>,
}

impl PendingSet {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.load.is_empty()
    }
}

/// The concrete change set a successful `prepare` produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnginePlan {
    pub to_add: Vec<PackageRef>,
    pub to_remove: Vec<PackageRef>,
    pub flags: TransactionFlags,
}

impl EnginePlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Result of a dry run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The plan is consistent and may be committed
    Ready(EnginePlan),
    /// The pending set changes nothing
    NothingToDo,
    /// The engine needs a provider choice before it can continue
    Providers(Vec<Ambiguity>),
}

/// The package engine the worker drives
pub trait PackageEngine: Send + Sync {
    /// Fresh snapshot of installed and available packages
    fn catalog(&self) -> Result<PackageCatalog>;

    /// Re-read every sync repository
    fn refresh(&self, force: bool, events: &EventSink, cancel: &AtomicBool) -> Result<()>;

    /// Read a package file named by `Load`
    fn load_package(&self, path: &Path) -> Result<PackageRef>;

    /// Dry-run the pending set
    fn prepare(
        &self,
        pending: &PendingSet,
        flags: TransactionFlags,
        events: &EventSink,
    ) -> Result<PrepareOutcome>;

    /// Apply a prepared plan, checking `cancel` between steps
    fn commit(&self, plan: &EnginePlan, events: &EventSink, cancel: &AtomicBool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_from_options() {
        let mut options = BTreeMap::new();
        options.insert("sysupgrade".to_string(), true);
        options.insert("downloadonly".to_string(), true);
        options.insert("cascade".to_string(), true);
        let flags = TransactionFlags::from_options(&options);
        assert!(flags.sysupgrade);
        assert!(flags.download_only);
        assert!(!flags.needed);
    }

    #[test]
    fn test_discard_sink_accepts_events() {
        EventSink::discard().emit(EngineEvent::CheckDepsStart);
    }

    #[test]
    fn test_sink_forwards_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.emit(EngineEvent::LoadStart);
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::LoadStart);
    }
}
