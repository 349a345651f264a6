// src/catalog/source.rs

//! Catalog data sources
//!
//! A [`CatalogSource`] hands raw package lists to [`super::PackageCatalog`].
//! [`DirectorySource`] reads TOML files laid out as:
//!
//! ```text
//! <db_root>/local/installed.toml    installed packages
//! <db_root>/sync/<repo>.toml        one file per configured repository
//! ```
//!
//! Each file holds a `[[package]]` array of [`PackageRef`] tables.

use super::{FILE_REPO, LOCAL_REPO, PackageRef};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Supplies installed and repository package lists
pub trait CatalogSource: Send + Sync {
    /// Packages currently installed
    fn load_installed(&self) -> Result<Vec<PackageRef>>;

    /// Packages available in one repository
    fn load_repository(&self, name: &str) -> Result<Vec<PackageRef>>;

    /// Configured repository names, in search order
    fn repository_names(&self) -> Vec<String>;
}

/// On-disk layout of a package list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub package: Vec<PackageRef>,
}

impl CatalogFile {
    /// Read a package list; a missing file is an empty list
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Write a package list atomically (temp file + rename)
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::IoError(format!("Failed to encode {}: {}", path.display(), e)))?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Catalog stored as TOML files under a root directory
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    repos: Vec<String>,
}

impl DirectorySource {
    /// Create a source over `root` with repositories searched in `repos` order
    pub fn new<P: Into<PathBuf>>(root: P, repos: Vec<String>) -> Self {
        Self {
            root: root.into(),
            repos,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the installed package list
    pub fn installed_path(&self) -> PathBuf {
        self.root.join("local").join("installed.toml")
    }

    /// Path of one repository file
    pub fn repository_path(&self, name: &str) -> PathBuf {
        self.root.join("sync").join(format!("{}.toml", name))
    }

    /// Persist the installed set
    pub fn write_installed(&self, packages: Vec<PackageRef>) -> Result<()> {
        let file = CatalogFile { package: packages };
        file.write(&self.installed_path())
    }
}

impl CatalogSource for DirectorySource {
    fn load_installed(&self) -> Result<Vec<PackageRef>> {
        let mut packages = CatalogFile::read(&self.installed_path())?.package;
        for pkg in &mut packages {
            pkg.repo = LOCAL_REPO.to_string();
        }
        Ok(packages)
    }

    fn load_repository(&self, name: &str) -> Result<Vec<PackageRef>> {
        let path = self.repository_path(name);
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "database file for '{}' does not exist",
                name
            )));
        }
        Ok(CatalogFile::read(&path)?.package)
    }

    fn repository_names(&self) -> Vec<String> {
        self.repos.clone()
    }
}

/// Load a standalone package manifest (the target of `Load(path)`)
///
/// The manifest is a single [`PackageRef`] table at the top level.
pub fn load_package_file(path: &Path) -> Result<PackageRef> {
    let content = fs::read_to_string(path)
        .map_err(|_| Error::InvalidTarget(path.display().to_string()))?;
    let mut pkg: PackageRef =
        toml::from_str(&content).map_err(|_| Error::InvalidTarget(path.display().to_string()))?;
    pkg.repo = FILE_REPO.to_string();
    Ok(pkg)
}
