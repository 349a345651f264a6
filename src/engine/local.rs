// src/engine/local.rs

//! File-backed package engine
//!
//! `LocalEngine` keeps the installed set and the sync repositories as TOML
//! files under a [`DirectorySource`]. Repositories may have a mirror URL that
//! `refresh` downloads from. Commits walk the plan package by package,
//! reporting the same event sequence a real engine reports, and persist the
//! installed set after every step so an interrupted commit leaves a
//! consistent (partial) state behind.

use super::{EnginePlan, EventSink, PackageEngine, PendingSet, PrepareOutcome, TransactionFlags};
use crate::catalog::{
    CatalogSource, DirectorySource, FILE_REPO, LOCAL_REPO, PackageCatalog, PackageRef,
    load_package_file,
};
use crate::error::{Error, Result};
use crate::progress::{EngineEvent, ProgressKind};
use crate::resolver::{
    Ambiguity, ConflictResolver, DesiredStateSet, ProviderChooser, ResolverPolicy,
};
use crate::updates::UpdateChecker;
use reqwest::blocking::Client;
use std::cmp::Ordering as VersionOrdering;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout for repository downloads (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer size for streaming downloads (8 KB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Bytes reported per simulated package download step
const DOWNLOAD_CHUNK: u64 = 64 * 1024;

/// Records provider prompts instead of answering them
///
/// The engine cannot ask anyone; the caller has to release, choose and
/// re-initialize.
#[derive(Default)]
struct ProviderRecorder {
    seen: Vec<Ambiguity>,
}

impl ProviderChooser for ProviderRecorder {
    fn choose(&mut self, ambiguity: &Ambiguity) -> Vec<String> {
        self.seen.push(ambiguity.clone());
        Vec::new()
    }
}

/// Engine backed by TOML catalog files
pub struct LocalEngine {
    source: DirectorySource,
    policy: ResolverPolicy,
    mirrors: BTreeMap<String, String>,
    ignore: Vec<String>,
    step_delay: Duration,
}

impl LocalEngine {
    pub fn new(source: DirectorySource, policy: ResolverPolicy) -> Self {
        Self {
            source,
            policy,
            mirrors: BTreeMap::new(),
            ignore: Vec::new(),
            step_delay: Duration::ZERO,
        }
    }

    /// Download `repo` from `url` on refresh
    pub fn with_mirror(mut self, repo: &str, url: &str) -> Self {
        self.mirrors.insert(repo.to_string(), url.to_string());
        self
    }

    /// Packages left out of system upgrades
    pub fn with_ignored(mut self, names: Vec<String>) -> Self {
        self.ignore = names;
        self
    }

    /// Pause between commit steps
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn source(&self) -> &DirectorySource {
        &self.source
    }

    fn check_cancel(&self, cancel: &AtomicBool) -> Result<()> {
        if cancel.load(Ordering::SeqCst) {
            info!("Commit interrupted");
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    fn pause(&self) {
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
    }

    fn download_repository(
        &self,
        name: &str,
        url: &str,
        dest: &Path,
        events: &EventSink,
        cancel: &AtomicBool,
    ) -> Result<()> {
        let file_url = if url.ends_with('/') {
            format!("{url}{name}.toml")
        } else {
            format!("{url}/{name}.toml")
        };
        info!("Refreshing {} from {}", name, file_url);

        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Engine(format!("Failed to create HTTP client: {e}")))?;
        let mut response = client
            .get(&file_url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Engine(format!("failed to retrieve {name}.db: {e}")))?;
        let total = response.content_length().unwrap_or(0);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = dest.with_extension("toml.part");
        let mut file = File::create(&tmp)?;
        let target = format!("{name}.db");
        let mut buffer = [0u8; STREAM_BUFFER_SIZE];
        let mut transferred = 0u64;
        events.emit(EngineEvent::Download {
            target: target.clone(),
            transferred,
            total,
        });

        loop {
            if cancel.load(Ordering::SeqCst) {
                let _ = fs::remove_file(&tmp);
                return Err(Error::Interrupted);
            }
            let read = response
                .read(&mut buffer)
                .map_err(|e| Error::IoError(format!("Failed to read response: {e}")))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])?;
            transferred += read as u64;
            events.emit(EngineEvent::Download {
                target: target.clone(),
                transferred,
                total: total.max(transferred),
            });
        }
        file.sync_all()?;
        fs::rename(&tmp, dest)?;
        debug!("Downloaded {} bytes for {}", transferred, name);
        Ok(())
    }

    fn simulate_download(
        &self,
        plan: &EnginePlan,
        events: &EventSink,
        cancel: &AtomicBool,
    ) -> Result<()> {
        let remote: Vec<&PackageRef> = plan
            .to_add
            .iter()
            .filter(|p| p.repo != FILE_REPO && p.download_size > 0)
            .collect();
        if remote.is_empty() {
            return Ok(());
        }

        events.emit(EngineEvent::RetrieveStart);
        events.emit(EngineEvent::TotalDownload(
            remote.iter().map(|p| p.download_size).sum(),
        ));
        for pkg in remote {
            let target = format!("{}.pkg.tar.zst", pkg.full_name());
            let mut transferred = 0;
            while transferred < pkg.download_size {
                self.check_cancel(cancel)?;
                transferred = (transferred + DOWNLOAD_CHUNK).min(pkg.download_size);
                events.emit(EngineEvent::Download {
                    target: target.clone(),
                    transferred,
                    total: pkg.download_size,
                });
                self.pause();
            }
        }
        Ok(())
    }

    fn report_step(
        &self,
        events: &EventSink,
        kind: ProgressKind,
        name: &str,
        count: usize,
        current: usize,
    ) {
        for percent in [0, 100] {
            events.emit(EngineEvent::PackageProgress {
                kind,
                target: name.to_string(),
                percent,
                count,
                current,
            });
        }
    }

    fn persist(&self, installed: &BTreeMap<String, PackageRef>) -> Result<()> {
        self.source
            .write_installed(installed.values().cloned().collect())
    }
}

impl PackageEngine for LocalEngine {
    fn catalog(&self) -> Result<PackageCatalog> {
        PackageCatalog::load(&self.source)
    }

    fn refresh(&self, force: bool, events: &EventSink, cancel: &AtomicBool) -> Result<()> {
        for name in self.source.repository_names() {
            self.check_cancel(cancel)?;
            let path = self.source.repository_path(&name);
            match self.mirrors.get(&name) {
                Some(url) if force || !path.exists() => {
                    self.download_repository(&name, url, &path, events, cancel)?;
                }
                _ => {
                    let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    debug!("{} is up to date", name);
                    events.emit(EngineEvent::Download {
                        target: format!("{name}.db"),
                        transferred: size,
                        total: size,
                    });
                }
            }
            // Reject a broken database now rather than at the next prepare
            let packages = self.source.load_repository(&name)?;
            info!("Repository {} holds {} package(s)", name, packages.len());
        }
        Ok(())
    }

    fn load_package(&self, path: &Path) -> Result<PackageRef> {
        load_package_file(path)
    }

    fn prepare(
        &self,
        pending: &PendingSet,
        flags: TransactionFlags,
        events: &EventSink,
    ) -> Result<PrepareOutcome> {
        if pending.is_empty() && !flags.sysupgrade {
            return Ok(PrepareOutcome::NothingToDo);
        }

        let catalog = self.catalog()?;
        let desired = DesiredStateSet {
            to_add: pending.add.clone(),
            to_remove: pending.remove.clone(),
            to_load: pending.load.clone(),
        };

        events.emit(EngineEvent::CheckDepsStart);
        let mut recorder = ProviderRecorder::default();
        let resolver = ConflictResolver::new(&catalog, &self.policy);
        let result = if flags.sysupgrade {
            let updates = UpdateChecker::new(&catalog)
                .with_ignored(self.ignore.iter().cloned())
                .compute_updates();
            resolver.resolve_upgrade(&desired, &updates.candidates(&catalog), &mut recorder)
        } else {
            resolver.resolve(&desired, &mut recorder)
        };
        events.emit(EngineEvent::ResolveDepsStart);

        let resolution = match result {
            Ok(resolution) => resolution,
            Err(failure) => {
                for warning in &failure.warnings {
                    events.emit(EngineEvent::Warning(warning.to_string()));
                }
                events.emit(EngineEvent::ResolveDepsDone);
                return Err(match crate::Error::from(failure) {
                    Error::Resolution(msg) => Error::Engine(msg),
                    other => other,
                });
            }
        };
        for warning in &resolution.warnings {
            events.emit(EngineEvent::Warning(warning.to_string()));
        }
        events.emit(EngineEvent::ResolveDepsDone);

        if !recorder.seen.is_empty() {
            return Ok(PrepareOutcome::Providers(recorder.seen));
        }

        events.emit(EngineEvent::InterConflictsStart);
        let to_add: Vec<PackageRef> = resolution
            .packages
            .into_values()
            .filter(|pkg| {
                !(flags.needed
                    && catalog.installed(&pkg.name).is_some_and(|old| {
                        old.version.compare(&pkg.version) == VersionOrdering::Equal
                    }))
            })
            .collect();
        let to_remove: Vec<PackageRef> = resolution
            .desired
            .to_remove
            .iter()
            .filter_map(|name| catalog.installed(name).cloned())
            .collect();
        events.emit(EngineEvent::InterConflictsDone);

        let plan = EnginePlan {
            to_add,
            to_remove,
            flags,
        };
        if plan.is_empty() {
            return Ok(PrepareOutcome::NothingToDo);
        }
        info!(
            "Prepared {} package(s) to add, {} to remove",
            plan.to_add.len(),
            plan.to_remove.len()
        );
        Ok(PrepareOutcome::Ready(plan))
    }

    fn commit(&self, plan: &EnginePlan, events: &EventSink, cancel: &AtomicBool) -> Result<()> {
        self.check_cancel(cancel)?;
        if !plan.flags.db_only {
            self.simulate_download(plan, events, cancel)?;
        }
        if plan.flags.download_only {
            return Ok(());
        }

        events.emit(EngineEvent::IntegrityStart);
        events.emit(EngineEvent::IntegrityDone);
        events.emit(EngineEvent::FileConflictsStart);
        events.emit(EngineEvent::FileConflictsDone);
        events.emit(EngineEvent::DiskSpaceStart);
        events.emit(EngineEvent::DiskSpaceDone);

        let mut installed: BTreeMap<String, PackageRef> = self
            .source
            .load_installed()?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        let count = plan.to_remove.len();
        for (i, pkg) in plan.to_remove.iter().enumerate() {
            self.check_cancel(cancel)?;
            let version = pkg.version.to_string();
            events.emit(EngineEvent::RemoveStart {
                name: pkg.name.clone(),
                version: version.clone(),
            });
            self.report_step(events, ProgressKind::Remove, &pkg.name, count, i + 1);
            if installed.remove(&pkg.name).is_none() {
                warn!("{} was not installed", pkg.name);
            }
            self.persist(&installed)?;
            events.emit(EngineEvent::RemoveDone {
                name: pkg.name.clone(),
                version,
            });
            self.pause();
        }

        let count = plan.to_add.len();
        for (i, pkg) in plan.to_add.iter().enumerate() {
            self.check_cancel(cancel)?;
            let name = pkg.name.clone();
            let new_version = pkg.version.to_string();
            let previous = installed.get(&pkg.name).map(|old| old.version.clone());

            let (kind, start, done) = match previous {
                None => (
                    ProgressKind::Add,
                    EngineEvent::AddStart {
                        name: name.clone(),
                        version: new_version.clone(),
                    },
                    EngineEvent::AddDone {
                        name: name.clone(),
                        version: new_version.clone(),
                    },
                ),
                Some(old) => {
                    let old_version = old.to_string();
                    match pkg.version.compare(&old) {
                        VersionOrdering::Greater => (
                            ProgressKind::Upgrade,
                            EngineEvent::UpgradeStart {
                                name: name.clone(),
                                old_version: old_version.clone(),
                                new_version: new_version.clone(),
                            },
                            EngineEvent::UpgradeDone {
                                name: name.clone(),
                                old_version,
                                new_version: new_version.clone(),
                            },
                        ),
                        VersionOrdering::Less => (
                            ProgressKind::Downgrade,
                            EngineEvent::DowngradeStart {
                                name: name.clone(),
                                old_version: old_version.clone(),
                                new_version: new_version.clone(),
                            },
                            EngineEvent::DowngradeDone {
                                name: name.clone(),
                                old_version,
                                new_version: new_version.clone(),
                            },
                        ),
                        VersionOrdering::Equal => (
                            ProgressKind::Reinstall,
                            EngineEvent::ReinstallStart {
                                name: name.clone(),
                                version: new_version.clone(),
                            },
                            EngineEvent::ReinstallDone {
                                name: name.clone(),
                                version: new_version.clone(),
                            },
                        ),
                    }
                }
            };

            events.emit(start);
            self.report_step(events, kind, &name, count, i + 1);
            let mut record = pkg.clone();
            record.repo = LOCAL_REPO.to_string();
            installed.insert(name, record);
            self.persist(&installed)?;
            events.emit(done);
            self.pause();
        }

        info!(
            "Commit finished: {} added, {} removed",
            plan.to_add.len(),
            plan.to_remove.len()
        );
        Ok(())
    }
}
