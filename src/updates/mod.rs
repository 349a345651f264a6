// src/updates/mod.rs

//! Available update detection
//!
//! [`UpdateChecker`] compares every installed package with the repository
//! candidates of the same name and reports the highest strictly newer one.
//! Installed packages no repository carries ("foreign" packages) can be
//! checked against an out-of-band [`RemoteIndex`].
//!
//! When a sync-first package has an update, the result holds only the
//! sync-first updates. Those must be committed alone, and the check run again
//! afterwards.

mod remote;

pub use remote::{HttpRemoteIndex, RemoteIndex, RemotePackage};

use crate::catalog::{PackageCatalog, PackageRef};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// One available update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEntry {
    pub name: String,
    pub version: String,
    pub repo: String,
    /// Source location for remote-index packages; empty for repository packages
    pub source_path: String,
    pub download_size: u64,
}

/// Result of an update check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSet {
    /// The entries are sync-first packages that must be updated alone
    pub syncfirst: bool,
    pub entries: Vec<UpdateEntry>,
}

impl UpdateSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Repository packages to feed into an upgrade resolution
    ///
    /// Remote-index entries are skipped; they are not installable through
    /// the package engine.
    pub fn candidates(&self, catalog: &PackageCatalog) -> Vec<PackageRef> {
        self.entries
            .iter()
            .filter_map(|entry| {
                catalog
                    .repositories()
                    .iter()
                    .find(|repo| repo.name == entry.repo)
                    .and_then(|repo| repo.get(&entry.name))
                    .cloned()
            })
            .collect()
    }
}

/// Computes available updates for a catalog snapshot
pub struct UpdateChecker<'a> {
    catalog: &'a PackageCatalog,
    ignore: BTreeSet<String>,
    sync_first: Vec<String>,
    remote: Option<&'a dyn RemoteIndex>,
}

impl<'a> UpdateChecker<'a> {
    pub fn new(catalog: &'a PackageCatalog) -> Self {
        Self {
            catalog,
            ignore: BTreeSet::new(),
            sync_first: Vec::new(),
            remote: None,
        }
    }

    /// Installed packages never reported as updatable
    pub fn with_ignored(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.ignore.extend(names);
        self
    }

    /// Packages that must be updated before anything else
    pub fn with_sync_first(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.sync_first.extend(names);
        self
    }

    /// Consult a remote index for foreign packages
    pub fn with_remote(mut self, remote: &'a dyn RemoteIndex) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Highest repository candidate strictly newer than the installed version
    pub fn newer_candidate(&self, installed: &PackageRef) -> Option<&'a PackageRef> {
        let mut best: Option<&'a PackageRef> = None;
        for repo in self.catalog.repositories() {
            let Some(candidate) = repo.get(&installed.name) else {
                continue;
            };
            if candidate.version.compare(&installed.version) != Ordering::Greater {
                continue;
            }
            // Equal versions keep the earlier repository
            if best.is_none_or(|b| candidate.version.compare(&b.version) == Ordering::Greater) {
                best = Some(candidate);
            }
        }
        best
    }

    /// Compute the available updates
    pub fn compute_updates(&self) -> UpdateSet {
        let sync_first: Vec<UpdateEntry> = self
            .sync_first
            .iter()
            .filter_map(|name| self.catalog.installed(name))
            .filter_map(|pkg| self.newer_candidate(pkg))
            .map(entry_for)
            .collect();
        if !sync_first.is_empty() {
            info!("{} sync-first update(s) must be applied first", sync_first.len());
            return UpdateSet {
                syncfirst: true,
                entries: sync_first,
            };
        }

        let mut entries = Vec::new();
        let mut foreign = Vec::new();
        for pkg in self.catalog.installed_packages() {
            if self.ignore.contains(&pkg.name) {
                debug!("Skipping ignored package {}", pkg.name);
                continue;
            }
            if !self.catalog.in_any_repository(&pkg.name) {
                foreign.push(pkg);
                continue;
            }
            if let Some(candidate) = self.newer_candidate(pkg) {
                entries.push(entry_for(candidate));
            }
        }

        if let Some(remote) = self.remote
            && !foreign.is_empty()
        {
            entries.extend(self.remote_updates(remote, &foreign));
        }

        info!("{} update(s) available", entries.len());
        UpdateSet {
            syncfirst: false,
            entries,
        }
    }

    fn remote_updates(&self, remote: &dyn RemoteIndex, foreign: &[&PackageRef]) -> Vec<UpdateEntry> {
        let names: Vec<String> = foreign.iter().map(|p| p.name.clone()).collect();
        let found = match remote.lookup(&names) {
            Ok(found) => found,
            Err(e) => {
                warn!("Failed to query {} for {}: {}", remote.label(), names.join(", "), e);
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        for remote_pkg in found {
            let Some(installed) = foreign.iter().find(|p| p.name == remote_pkg.name) else {
                continue;
            };
            let version = match Version::parse(&remote_pkg.version) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Ignoring {} from {}: {}", remote_pkg.name, remote.label(), e);
                    continue;
                }
            };
            if version.compare(&installed.version) == Ordering::Greater {
                entries.push(UpdateEntry {
                    name: remote_pkg.name,
                    version: version.to_string(),
                    repo: remote.label().to_string(),
                    source_path: remote_pkg.source_path,
                    download_size: remote_pkg.download_size,
                });
            }
        }
        entries
    }
}

fn entry_for(pkg: &PackageRef) -> UpdateEntry {
    UpdateEntry {
        name: pkg.name.clone(),
        version: pkg.version.to_string(),
        repo: pkg.repo.clone(),
        source_path: String::new(),
        download_size: pkg.download_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Repository;
    use crate::error::{Error, Result};
    use std::sync::Mutex;

    fn pkg(name: &str, version: &str) -> PackageRef {
        PackageRef::new(name, Version::parse(version).unwrap(), "")
    }

    struct FakeIndex {
        packages: Vec<RemotePackage>,
        queried: Mutex<Vec<String>>,
    }

    impl RemoteIndex for FakeIndex {
        fn label(&self) -> &str {
            "community"
        }

        fn lookup(&self, names: &[String]) -> Result<Vec<RemotePackage>> {
            self.queried.lock().unwrap().extend(names.iter().cloned());
            Ok(self.packages.clone())
        }
    }

    struct BrokenIndex;

    impl RemoteIndex for BrokenIndex {
        fn label(&self) -> &str {
            "community"
        }

        fn lookup(&self, _names: &[String]) -> Result<Vec<RemotePackage>> {
            Err(Error::NotFound("index unreachable".to_string()))
        }
    }

    fn names(set: &UpdateSet) -> Vec<&str> {
        set.entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_highest_candidate_across_repositories() {
        let catalog = PackageCatalog::new(
            vec![pkg("foo", "1.0-1")],
            vec![
                Repository::new("core", vec![pkg("foo", "1.1-1")]),
                Repository::new("testing", vec![pkg("foo", "1.2rc1-1")]),
                Repository::new("extra", vec![pkg("foo", "1.2-1")]),
            ],
        );
        let updates = UpdateChecker::new(&catalog).compute_updates();
        assert!(!updates.syncfirst);
        assert_eq!(updates.entries.len(), 1);
        assert_eq!(updates.entries[0].version, "1.2-1");
        assert_eq!(updates.entries[0].repo, "extra");
        assert_eq!(updates.candidates(&catalog)[0].repo, "extra");
    }

    #[test]
    fn test_equal_or_older_is_not_an_update() {
        let catalog = PackageCatalog::new(
            vec![pkg("foo", "2.0-1"), pkg("bar", "1:1.0-1")],
            vec![Repository::new(
                "core",
                vec![pkg("foo", "2.0-1"), pkg("bar", "9.0-1")],
            )],
        );
        assert!(UpdateChecker::new(&catalog).compute_updates().is_empty());
    }

    #[test]
    fn test_ignored_packages_skipped() {
        let catalog = PackageCatalog::new(
            vec![pkg("foo", "1.0"), pkg("bar", "1.0")],
            vec![Repository::new("core", vec![pkg("foo", "2.0"), pkg("bar", "2.0")])],
        );
        let updates = UpdateChecker::new(&catalog)
            .with_ignored(["foo".to_string()])
            .compute_updates();
        assert_eq!(names(&updates), vec!["bar"]);
    }

    #[test]
    fn test_sync_first_replaces_result() {
        let catalog = PackageCatalog::new(
            vec![pkg("pacman", "6.0"), pkg("foo", "1.0")],
            vec![Repository::new(
                "core",
                vec![pkg("pacman", "6.1"), pkg("foo", "2.0")],
            )],
        );
        let updates = UpdateChecker::new(&catalog)
            .with_sync_first(["pacman".to_string()])
            .compute_updates();
        assert!(updates.syncfirst);
        assert_eq!(names(&updates), vec!["pacman"]);
    }

    #[test]
    fn test_sync_first_without_update_is_ignored() {
        let catalog = PackageCatalog::new(
            vec![pkg("pacman", "6.1"), pkg("foo", "1.0")],
            vec![Repository::new(
                "core",
                vec![pkg("pacman", "6.1"), pkg("foo", "2.0")],
            )],
        );
        let updates = UpdateChecker::new(&catalog)
            .with_sync_first(["pacman".to_string()])
            .compute_updates();
        assert!(!updates.syncfirst);
        assert_eq!(names(&updates), vec!["foo"]);
    }

    #[test]
    fn test_remote_index_only_for_foreign_packages() {
        let catalog = PackageCatalog::new(
            vec![pkg("foo", "1.0"), pkg("yay", "12.0-1"), pkg("paru", "2.0-1")],
            vec![Repository::new("core", vec![pkg("foo", "1.0")])],
        );
        let index = FakeIndex {
            packages: vec![
                RemotePackage {
                    name: "yay".to_string(),
                    version: "12.1-1".to_string(),
                    source_path: "/cgit/yay.tar.gz".to_string(),
                    download_size: 0,
                },
                RemotePackage {
                    name: "paru".to_string(),
                    version: "1.9-1".to_string(),
                    source_path: String::new(),
                    download_size: 0,
                },
            ],
            queried: Mutex::new(Vec::new()),
        };
        let updates = UpdateChecker::new(&catalog)
            .with_remote(&index)
            .compute_updates();

        assert_eq!(names(&updates), vec!["yay"]);
        assert_eq!(updates.entries[0].repo, "community");
        assert_eq!(updates.entries[0].source_path, "/cgit/yay.tar.gz");
        assert_eq!(*index.queried.lock().unwrap(), vec!["paru", "yay"]);
        assert!(updates.candidates(&catalog).is_empty());
    }

    #[test]
    fn test_remote_failure_is_not_fatal() {
        let catalog = PackageCatalog::new(
            vec![pkg("foo", "1.0"), pkg("yay", "12.0-1")],
            vec![Repository::new("core", vec![pkg("foo", "1.1")])],
        );
        let updates = UpdateChecker::new(&catalog)
            .with_remote(&BrokenIndex)
            .compute_updates();
        assert_eq!(names(&updates), vec!["foo"]);
    }
}
