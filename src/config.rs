// src/config.rs
//! Configuration file parsing
//!
//! pkgwarden reads a single TOML file (default `/etc/pkgwarden.toml`) with
//! the following sections:
//! - [options] - Held, sync-first and ignored packages
//! - [paths] - Catalog root, lock, PID, log and socket locations
//! - [[repository]] - Sync repositories in search order
//! - [remote] - Optional out-of-band index for foreign packages
//! - [coupling] - Kernel family prefixes
//! - [daemon] - Authorization and timing of the worker
//!
//! A missing file yields the defaults.

use crate::catalog::DirectorySource;
use crate::engine::LocalEngine;
use crate::error::{Error, Result};
use crate::resolver::{CouplingRule, ResolverPolicy};
use crate::updates::HttpRemoteIndex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pkgwarden.toml";

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub options: OptionsSection,

    #[serde(default)]
    pub paths: PathsSection,

    /// Sync repositories, first match wins
    #[serde(default)]
    pub repository: Vec<RepositorySection>,

    #[serde(default)]
    pub remote: RemoteSection,

    #[serde(default)]
    pub coupling: CouplingSection,

    #[serde(default)]
    pub daemon: DaemonSection,
}

/// Package selection options
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptionsSection {
    /// Packages that must never be removed
    #[serde(default)]
    pub hold_pkg: Vec<String>,

    /// Packages updated alone before anything else
    #[serde(default)]
    pub sync_first: Vec<String>,

    /// Packages never reported as updatable
    #[serde(default)]
    pub ignore_pkg: Vec<String>,
}

/// Filesystem locations
#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_db_root")]
    pub db_root: PathBuf,

    /// Lock file shared with other package tools
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// PID file present while the worker runs
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    #[serde(default = "default_socket")]
    pub socket: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            db_root: default_db_root(),
            lock_file: default_lock_file(),
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            socket: default_socket(),
        }
    }
}

fn default_db_root() -> PathBuf {
    PathBuf::from("/var/lib/pkgwarden")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/lib/pkgwarden/db.lck")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/run/pkgwarden/pkgwarden.pid")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/pkgwarden.log")
}

fn default_socket() -> PathBuf {
    PathBuf::from("/run/pkgwarden/pkgwarden.sock")
}

/// One sync repository
#[derive(Debug, Clone, Deserialize)]
pub struct RepositorySection {
    pub name: String,

    /// Mirror the repository file is refreshed from
    #[serde(default)]
    pub server: Option<String>,
}

/// Out-of-band package index
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_remote_url")]
    pub url: String,

    /// Repository label shown for remote updates
    #[serde(default = "default_remote_label")]
    pub label: String,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_remote_url(),
            label: default_remote_label(),
        }
    }
}

fn default_remote_url() -> String {
    "https://aur.archlinux.org/rpc".to_string()
}

fn default_remote_label() -> String {
    "aur".to_string()
}

/// Kernel/module naming convention
#[derive(Debug, Clone, Deserialize)]
pub struct CouplingSection {
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,
}

impl Default for CouplingSection {
    fn default() -> Self {
        Self {
            prefixes: default_prefixes(),
        }
    }
}

fn default_prefixes() -> Vec<String> {
    vec!["linux".to_string()]
}

/// Worker settings
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSection {
    /// Require PolicyKit for non-root callers
    #[serde(default = "default_true")]
    pub require_polkit: bool,

    /// Groups allowed to commit without PolicyKit
    #[serde(default)]
    pub trusted_gids: Vec<u32>,

    /// Client timeout for calls expected to be fast
    #[serde(default = "default_fast_call_timeout")]
    pub fast_call_timeout_secs: u64,

    /// How long Interrupt waits for the engine before abandoning it
    #[serde(default = "default_interrupt_grace")]
    pub interrupt_grace_ms: u64,

    /// Trace engine debug lines instead of dropping them
    #[serde(default)]
    pub forward_debug: bool,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            require_polkit: true,
            trusted_gids: Vec::new(),
            fast_call_timeout_secs: default_fast_call_timeout(),
            interrupt_grace_ms: default_interrupt_grace(),
            forward_debug: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_fast_call_timeout() -> u64 {
    30
}

fn default_interrupt_grace() -> u64 {
    3000
}

impl Config {
    /// Load configuration from a TOML file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e)))
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for repo in &self.repository {
            if repo.name.is_empty() {
                return Err(Error::ConfigError("repository name is empty".to_string()));
            }
            if !seen.insert(repo.name.as_str()) {
                return Err(Error::ConfigError(format!(
                    "repository {} is configured twice",
                    repo.name
                )));
            }
        }
        if self.coupling.prefixes.is_empty() {
            return Err(Error::ConfigError(
                "coupling.prefixes must not be empty".to_string(),
            ));
        }
        if self.daemon.fast_call_timeout_secs == 0 {
            return Err(Error::ConfigError(
                "daemon.fast_call_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Repository names in search order
    pub fn repository_names(&self) -> Vec<String> {
        self.repository.iter().map(|r| r.name.clone()).collect()
    }

    /// Held packages plus the kernel coupling rule
    pub fn resolver_policy(&self) -> Result<ResolverPolicy> {
        Ok(ResolverPolicy {
            held: self.options.hold_pkg.iter().cloned().collect(),
            coupling: CouplingRule::new(&self.coupling.prefixes)?,
        })
    }

    pub fn catalog_source(&self) -> DirectorySource {
        DirectorySource::new(&self.paths.db_root, self.repository_names())
    }

    /// The file-backed engine for this configuration
    pub fn engine(&self) -> Result<LocalEngine> {
        let mut engine = LocalEngine::new(self.catalog_source(), self.resolver_policy()?)
            .with_ignored(self.options.ignore_pkg.clone());
        for repo in &self.repository {
            if let Some(server) = &repo.server {
                engine = engine.with_mirror(&repo.name, server);
            }
        }
        Ok(engine)
    }

    /// The remote index, when enabled
    pub fn remote_index(&self) -> Result<Option<HttpRemoteIndex>> {
        if !self.remote.enabled {
            return Ok(None);
        }
        HttpRemoteIndex::new(&self.remote.url, &self.remote.label).map(Some)
    }

    pub fn fast_call_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.fast_call_timeout_secs)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.daemon.interrupt_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(&temp_dir.path().join("absent.toml")).unwrap();
        assert!(config.repository.is_empty());
        assert_eq!(config.coupling.prefixes, vec!["linux"]);
        assert_eq!(config.daemon.fast_call_timeout_secs, 30);
        assert_eq!(config.daemon.interrupt_grace_ms, 3000);
        assert!(config.daemon.require_polkit);
        assert!(!config.remote.enabled);
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
[options]
hold_pkg = ["pacman", "glibc"]
sync_first = ["pacman"]
ignore_pkg = ["linux-firmware"]

[paths]
db_root = "/tmp/pkgwarden"

[[repository]]
name = "core"
server = "https://mirror.example.org/core"

[[repository]]
name = "extra"

[coupling]
prefixes = ["linux", "kernel"]

[daemon]
require_polkit = false
trusted_gids = [10]
"#,
        )
        .unwrap();

        assert_eq!(config.repository_names(), vec!["core", "extra"]);
        assert_eq!(config.paths.db_root, PathBuf::from("/tmp/pkgwarden"));
        assert_eq!(config.paths.socket, default_socket());
        assert_eq!(config.daemon.trusted_gids, vec![10]);

        let policy = config.resolver_policy().unwrap();
        assert!(policy.held.contains("glibc"));
        assert!(policy.coupling.key("kernel61").is_some());
    }

    #[test]
    fn test_duplicate_repository_rejected() {
        let err = Config::parse("[[repository]]\nname = \"core\"\n[[repository]]\nname = \"core\"\n")
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pkgwarden.toml");
        std::fs::write(&path, "[options\nhold_pkg = 3").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::ConfigError(_))));
    }
}
