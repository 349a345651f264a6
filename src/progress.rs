// src/progress.rs

//! Engine event to client signal translation
//!
//! The package engine reports what it is doing through [`EngineEvent`]s:
//! phase boundaries, per-file download progress, per-package install progress
//! and log lines. [`ProgressTranslator`] maps them onto the normalized
//! [`Signal`] stream every connected client renders: an action line, a
//! longer detail line, an icon token, a target and a percent.
//!
//! The translator only remembers the last value emitted for each channel and
//! never emits a value twice in a row. A percent outside `0.0..=1.0` means
//! "indeterminate" and is rendered as a pulse.
//!
//! # Example
//!
//! ```ignore
//! use pkgwarden::progress::{EngineEvent, ProgressTranslator};
//!
//! let mut translator = ProgressTranslator::new(false);
//! for signal in translator.translate(&EngineEvent::CheckDepsStart) {
//!     println!("{:?}", signal);
//! }
//! ```

use crate::updates::UpdateSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Percent value meaning "no known fraction"
pub const INDETERMINATE: f64 = -1.0;

/// Icon tokens carried by [`Signal::Icon`]
pub mod icon {
    pub const SEARCH: &str = "package-search";
    pub const SETUP: &str = "package-setup";
    pub const ADD: &str = "package-add";
    pub const DELETE: &str = "package-delete";
    pub const UPDATE: &str = "package-update";
    pub const DOWNLOAD: &str = "package-download";
    pub const REFRESH: &str = "refresh-cache";
}

/// Severity of an engine log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

/// Operation a per-package progress event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressKind {
    Add,
    Upgrade,
    Downgrade,
    Reinstall,
    Remove,
    ConflictsCheck,
    DiskSpace,
    Integrity,
    Load,
    Keyring,
}

impl ProgressKind {
    /// Whether this progress belongs to the package-changing step
    fn changes_packages(self) -> bool {
        matches!(
            self,
            ProgressKind::Add
                | ProgressKind::Upgrade
                | ProgressKind::Downgrade
                | ProgressKind::Reinstall
                | ProgressKind::Remove
        )
    }
}

/// Low-level events emitted by a package engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    CheckDepsStart,
    CheckDepsDone,
    FileConflictsStart,
    FileConflictsDone,
    ResolveDepsStart,
    ResolveDepsDone,
    InterConflictsStart,
    InterConflictsDone,
    AddStart { name: String, version: String },
    AddDone { name: String, version: String },
    RemoveStart { name: String, version: String },
    RemoveDone { name: String, version: String },
    UpgradeStart { name: String, old_version: String, new_version: String },
    UpgradeDone { name: String, old_version: String, new_version: String },
    DowngradeStart { name: String, old_version: String, new_version: String },
    DowngradeDone { name: String, old_version: String, new_version: String },
    ReinstallStart { name: String, version: String },
    ReinstallDone { name: String, version: String },
    IntegrityStart,
    IntegrityDone,
    LoadStart,
    LoadDone,
    KeyringStart,
    KeyringDone,
    KeyDownloadStart,
    KeyDownloadDone,
    DiskSpaceStart,
    DiskSpaceDone,
    RetrieveStart,
    /// Output of a package install script
    ScriptletInfo(String),
    /// Total bytes of the download batch about to start
    TotalDownload(u64),
    /// Progress of one file in a download batch
    Download {
        target: String,
        transferred: u64,
        total: u64,
    },
    /// Progress of one package in a multi-package step
    PackageProgress {
        kind: ProgressKind,
        target: String,
        percent: u32,
        count: usize,
        current: usize,
    },
    /// A decision the engine took on its own, reported to the user later
    Warning(String),
    Log { level: LogLevel, text: String },
}

/// Signals broadcast from the worker to every client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "value")]
pub enum Signal {
    Action(String),
    ActionLong(String),
    Icon(String),
    Target(String),
    Percent(f64),
    NeedDetails(bool),
    AvailableUpdates(UpdateSet),
    TransactionStart,
    TransactionDone(String),
    TransactionError(String),
    LogError(String),
    LogWarning(String),
}

/// Last emitted value of every channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressState {
    pub action: String,
    pub action_long: String,
    pub icon: String,
    pub target: String,
    pub percent: Option<f64>,
    pub last_error: Option<String>,
    pub last_warning: Option<String>,
    /// Package currently being processed, for scriptlet messages
    current_package: String,
    total_size: u64,
    already_transferred: u64,
    last_completed: Option<String>,
    transaction_started: bool,
    pending_warning: String,
}

/// Format a byte count the way download targets show it
pub fn format_size(size: u64) -> String {
    let kib = size as f64 / 1024.0;
    if kib < 1000.0 {
        format!("{:.1} KiB", kib)
    } else {
        format!("{:.2} MiB", kib / 1024.0)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Strip the archive suffix from a download target
fn package_label(target: &str) -> &str {
    [".pkg.tar.zst", ".pkg.tar.xz", ".pkg.toml"]
        .iter()
        .find_map(|suffix| target.strip_suffix(suffix))
        .unwrap_or(target)
}

/// Maps [`EngineEvent`]s to [`Signal`]s with duplicate suppression
#[derive(Debug, Default)]
pub struct ProgressTranslator {
    state: ProgressState,
    forward_debug: bool,
}

impl ProgressTranslator {
    /// `forward_debug` traces engine debug lines instead of dropping them
    pub fn new(forward_debug: bool) -> Self {
        Self {
            state: ProgressState::default(),
            forward_debug,
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Forget everything; called at the start of each Commit or Refresh
    pub fn reset(&mut self) {
        self.state = ProgressState::default();
    }

    /// Flush accumulated engine warnings as a single notification
    pub fn flush_warnings(&mut self) -> Option<Signal> {
        if self.state.pending_warning.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.state.pending_warning);
        let text = text.trim_end().to_string();
        self.state.last_warning = Some(text.clone());
        Some(Signal::LogWarning(text))
    }

    /// Translate one engine event
    pub fn translate(&mut self, event: &EngineEvent) -> Vec<Signal> {
        let mut out = Vec::new();
        match event {
            EngineEvent::CheckDepsStart => {
                self.phase(&mut out, "Checking dependencies", icon::SEARCH)
            }
            EngineEvent::FileConflictsStart => {
                self.phase(&mut out, "Checking file conflicts", icon::SEARCH)
            }
            EngineEvent::ResolveDepsStart => {
                self.phase(&mut out, "Resolving dependencies", icon::SETUP)
            }
            EngineEvent::InterConflictsStart => {
                self.phase(&mut out, "Checking inter conflicts", icon::SEARCH)
            }
            EngineEvent::CheckDepsDone
            | EngineEvent::ResolveDepsDone
            | EngineEvent::InterConflictsDone => out.extend(self.flush_warnings()),
            EngineEvent::AddStart { name, version } => {
                let action = format!("Installing {}", name);
                let detail = format!("{} ({})...\n", action, version);
                self.package_step(&mut out, name, &action, detail, icon::ADD);
            }
            EngineEvent::RemoveStart { name, version } => {
                let action = format!("Removing {}", name);
                let detail = format!("{} ({})...\n", action, version);
                self.package_step(&mut out, name, &action, detail, icon::DELETE);
            }
            EngineEvent::UpgradeStart {
                name,
                old_version,
                new_version,
            } => {
                let action = format!("Upgrading {}", name);
                let detail = format!("{} ({} => {})...\n", action, old_version, new_version);
                self.package_step(&mut out, name, &action, detail, icon::UPDATE);
            }
            EngineEvent::DowngradeStart {
                name,
                old_version,
                new_version,
            } => {
                let action = format!("Downgrading {}", name);
                let detail = format!("{} ({} => {})...\n", action, old_version, new_version);
                self.package_step(&mut out, name, &action, detail, icon::ADD);
            }
            EngineEvent::ReinstallStart { name, version } => {
                let action = format!("Reinstalling {}", name);
                let detail = format!("{} ({})...\n", action, version);
                self.package_step(&mut out, name, &action, detail, icon::ADD);
            }
            EngineEvent::IntegrityStart => {
                self.state.already_transferred = 0;
                self.phase(&mut out, "Checking integrity", icon::SEARCH);
            }
            EngineEvent::LoadStart => self.phase(&mut out, "Loading packages files", icon::SEARCH),
            EngineEvent::KeyringStart => self.phase(&mut out, "Checking keyring", icon::SEARCH),
            EngineEvent::KeyDownloadStart => {
                let icon = self.state.icon.clone();
                self.phase(&mut out, "Downloading required keys", &icon);
            }
            EngineEvent::DiskSpaceStart => {
                self.phase(&mut out, "Checking available disk space", icon::SEARCH)
            }
            EngineEvent::RetrieveStart => {
                self.state.already_transferred = 0;
                self.state.last_completed = None;
                self.phase(&mut out, "Downloading", icon::DOWNLOAD);
            }
            EngineEvent::ScriptletInfo(text) => {
                let action = format!("Configuring {}...", self.state.current_package);
                self.emit_action(&mut out, action, text.clone(), icon::SETUP);
                out.push(Signal::NeedDetails(true));
            }
            EngineEvent::TotalDownload(size) => {
                self.state.total_size = *size;
                self.state.already_transferred = 0;
                self.state.last_completed = None;
            }
            EngineEvent::Download {
                target,
                transferred,
                total,
            } => self.download(&mut out, target, *transferred, *total),
            EngineEvent::PackageProgress {
                kind,
                target: _,
                percent,
                count,
                current,
            } => self.package_progress(&mut out, *kind, *percent, *count, *current),
            EngineEvent::Warning(text) => {
                self.state.pending_warning.push_str(text);
                self.state.pending_warning.push('\n');
            }
            EngineEvent::Log { level, text } => self.log(&mut out, *level, text),
            EngineEvent::AddDone { .. }
            | EngineEvent::RemoveDone { .. }
            | EngineEvent::UpgradeDone { .. }
            | EngineEvent::DowngradeDone { .. }
            | EngineEvent::ReinstallDone { .. }
            | EngineEvent::FileConflictsDone
            | EngineEvent::IntegrityDone
            | EngineEvent::LoadDone
            | EngineEvent::KeyringDone
            | EngineEvent::KeyDownloadDone
            | EngineEvent::DiskSpaceDone => {}
        }
        out
    }

    fn phase(&mut self, out: &mut Vec<Signal>, action: &str, icon: &str) {
        let action = format!("{}...", action);
        let detail = format!("{}\n", action);
        self.emit_action(out, action, detail, icon);
    }

    fn package_step(
        &mut self,
        out: &mut Vec<Signal>,
        name: &str,
        action: &str,
        detail: String,
        icon: &str,
    ) {
        self.state.current_package = name.to_string();
        self.emit_action(out, format!("{}...", action), detail, icon);
    }

    fn emit_action(&mut self, out: &mut Vec<Signal>, action: String, detail: String, icon: &str) {
        if action != self.state.action {
            self.state.action = action.clone();
            out.push(Signal::Action(action));
        }
        if detail != self.state.action_long {
            self.state.action_long = detail.clone();
            out.push(Signal::ActionLong(detail));
        }
        if icon != self.state.icon {
            self.state.icon = icon.to_string();
            out.push(Signal::Icon(icon.to_string()));
        }
    }

    fn emit_target(&mut self, out: &mut Vec<Signal>, target: String) {
        if target != self.state.target {
            self.state.target = target.clone();
            out.push(Signal::Target(target));
        }
    }

    fn emit_percent(&mut self, out: &mut Vec<Signal>, percent: f64) -> bool {
        if self.state.percent == Some(percent) {
            return false;
        }
        self.state.percent = Some(percent);
        out.push(Signal::Percent(percent));
        true
    }

    fn download(&mut self, out: &mut Vec<Signal>, target: &str, transferred: u64, total: u64) {
        if let Some(repo) = target.strip_suffix(".db") {
            self.emit_action(out, format!("Refreshing {}...", repo), String::new(), icon::REFRESH);
        } else {
            let action = format!("Downloading {}...", package_label(target));
            let detail = format!("{}\n", action);
            self.emit_action(out, action, detail, icon::DOWNLOAD);
        }

        let finished = self.state.last_completed.as_deref() == Some(target);
        let (percent, text) = if self.state.total_size > 0 {
            let current = if finished { 0 } else { transferred };
            let done = current + self.state.already_transferred;
            let percent = round2(done as f64 / self.state.total_size as f64);
            let text = if done <= self.state.total_size {
                format!(
                    "{}/{}",
                    format_size(done),
                    format_size(self.state.total_size)
                )
            } else {
                String::new()
            };
            (percent, text)
        } else if total > 0 {
            (round2(transferred as f64 / total as f64), String::new())
        } else {
            (INDETERMINATE, String::new())
        };

        self.emit_target(out, text);
        self.emit_percent(out, percent);

        // A finished file counts toward the rest of the batch exactly once
        if total > 0 && transferred == total && !finished {
            self.state.already_transferred += total;
            self.state.last_completed = Some(target.to_string());
        }
    }

    fn package_progress(
        &mut self,
        out: &mut Vec<Signal>,
        kind: ProgressKind,
        percent: u32,
        count: usize,
        current: usize,
    ) {
        let count = count.max(1);
        let current = current.clamp(1, count);
        let fraction = if kind.changes_packages() {
            if !self.state.transaction_started {
                self.state.transaction_started = true;
                out.push(Signal::TransactionStart);
            }
            (current - 1) as f64 / count as f64 + percent as f64 / (100.0 * count as f64)
        } else {
            percent as f64 / 100.0
        };
        let fraction = round2(fraction);

        let mut changed = Vec::new();
        if self.emit_percent(&mut changed, fraction) {
            self.emit_target(out, format!("{}/{}", current, count));
        }
        out.extend(changed);
    }

    fn log(&mut self, out: &mut Vec<Signal>, level: LogLevel, text: &str) {
        let text = text.trim_end();
        match level {
            LogLevel::Error => {
                self.state.last_error = Some(text.to_string());
                out.push(Signal::LogError(text.to_string()));
                out.push(Signal::NeedDetails(true));
            }
            LogLevel::Warning => {
                self.state.last_warning = Some(text.to_string());
                out.push(Signal::LogWarning(text.to_string()));
            }
            LogLevel::Info | LogLevel::Debug => {
                if self.forward_debug {
                    debug!(target: "engine", "{}", text);
                }
            }
        }
    }
}
