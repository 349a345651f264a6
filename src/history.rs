// src/history.rs

//! Append-only package operation log
//!
//! One line per completed package operation:
//!
//! ```text
//! [2026-10-18 14:02] Installed foo (1.0-1)
//! [2026-10-18 14:02] Upgraded bar (1.0-1 -> 1.1-1)
//! ```

use crate::Result;
use crate::progress::EngineEvent;
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only operation log
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The log line for a completed operation, if the event is one
    pub fn line_for(event: &EngineEvent) -> Option<String> {
        let line = match event {
            EngineEvent::AddDone { name, version } => format!("Installed {} ({})", name, version),
            EngineEvent::RemoveDone { name, version } => format!("Removed {} ({})", name, version),
            EngineEvent::ReinstallDone { name, version } => {
                format!("Reinstalled {} ({})", name, version)
            }
            EngineEvent::UpgradeDone {
                name,
                old_version,
                new_version,
            } => format!("Upgraded {} ({} -> {})", name, old_version, new_version),
            EngineEvent::DowngradeDone {
                name,
                old_version,
                new_version,
            } => format!("Downgraded {} ({} -> {})", name, old_version, new_version),
            _ => return None,
        };
        Some(line)
    }

    /// Append the line for `event`; returns whether anything was written
    pub fn record(&self, event: &EngineEvent) -> Result<bool> {
        let Some(line) = Self::line_for(event) else {
            return Ok(false);
        };
        self.append(&line)?;
        Ok(true)
    }

    fn append(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "[{}] {}", Local::now().format("%Y-%m-%d %H:%M"), line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_only_completed_operations_are_logged() {
        let temp_dir = TempDir::new().unwrap();
        let log = HistoryLog::new(temp_dir.path().join("log/pkgwarden.log"));

        assert!(!log.record(&EngineEvent::CheckDepsStart).unwrap());
        assert!(
            log.record(&EngineEvent::AddDone {
                name: "foo".to_string(),
                version: "1.0-1".to_string(),
            })
            .unwrap()
        );
        assert!(
            log.record(&EngineEvent::UpgradeDone {
                name: "bar".to_string(),
                old_version: "1.0".to_string(),
                new_version: "1.1".to_string(),
            })
            .unwrap()
        );

        let content = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] Installed foo (1.0-1)"));
        assert!(lines[1].ends_with("] Upgraded bar (1.0 -> 1.1)"));
    }

    #[test]
    fn test_line_for_removal() {
        let line = HistoryLog::line_for(&EngineEvent::RemoveDone {
            name: "foo".to_string(),
            version: "1.0".to_string(),
        });
        assert_eq!(line.as_deref(), Some("Removed foo (1.0)"));
    }
}
