// src/catalog/mod.rs

//! Read-only snapshot of installed and available packages
//!
//! The catalog holds the installed set plus every configured sync repository
//! in configured order. It is refreshed explicitly through a
//! [`CatalogSource`]; nothing in this module re-reads data implicitly.
//!
//! Lookups that can match more than one package follow one explicit rule:
//! repositories are searched in configured order and the first match wins.
//! Within a single package set, a literal name match beats a `provides` match.

mod source;

pub use source::{CatalogFile, CatalogSource, DirectorySource, load_package_file};

use crate::error::Result;
use crate::version::{Dependency, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Repository label used for installed packages
pub const LOCAL_REPO: &str = "local";

/// Repository label used for packages loaded from a file path
pub const FILE_REPO: &str = "file";

/// A package snapshot: identity plus relations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRef {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub repo: String,
    /// Installed size in bytes
    #[serde(default)]
    pub size: u64,
    /// Bytes to download when installing from a repository
    #[serde(default)]
    pub download_size: u64,
    #[serde(default)]
    pub depends: Vec<Dependency>,
    #[serde(default)]
    pub conflicts: Vec<Dependency>,
    #[serde(default)]
    pub replaces: Vec<Dependency>,
    #[serde(default)]
    pub provides: Vec<Dependency>,
}

impl PackageRef {
    /// Create a package with no relations
    pub fn new(name: &str, version: Version, repo: &str) -> Self {
        Self {
            name: name.to_string(),
            version,
            repo: repo.to_string(),
            size: 0,
            download_size: 0,
            depends: Vec::new(),
            conflicts: Vec::new(),
            replaces: Vec::new(),
            provides: Vec::new(),
        }
    }

    /// Check whether this package satisfies a dependency
    ///
    /// Satisfied either by name (with the version constraint applied to the
    /// package version) or by a `provides` entry. An unversioned provision
    /// only satisfies an unversioned dependency.
    pub fn satisfies(&self, dep: &Dependency) -> bool {
        if self.name == dep.name && dep.constraint.satisfies(&self.version) {
            return true;
        }
        self.provides.iter().any(|p| {
            p.name == dep.name
                && (dep.constraint.is_any()
                    || p.exact_version()
                        .is_some_and(|v| dep.constraint.satisfies(v)))
        })
    }

    /// Whether this package satisfies `dep` through `provides` only
    pub fn satisfies_virtually(&self, dep: &Dependency) -> bool {
        self.name != dep.name && self.satisfies(dep)
    }

    /// `name-version`, as shown in summaries and download targets
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// One configured sync repository
#[derive(Debug, Clone, Default)]
pub struct Repository {
    pub name: String,
    packages: BTreeMap<String, PackageRef>,
}

impl Repository {
    /// Build a repository from its package list; later duplicates are ignored
    pub fn new(name: &str, packages: Vec<PackageRef>) -> Self {
        let mut map = BTreeMap::new();
        for mut pkg in packages {
            pkg.repo = name.to_string();
            map.entry(pkg.name.clone()).or_insert(pkg);
        }
        Self {
            name: name.to_string(),
            packages: map,
        }
    }

    pub fn get(&self, name: &str) -> Option<&PackageRef> {
        self.packages.get(name)
    }

    pub fn packages(&self) -> impl Iterator<Item = &PackageRef> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Snapshot of installed packages and sync repositories
#[derive(Debug, Clone, Default)]
pub struct PackageCatalog {
    installed: BTreeMap<String, PackageRef>,
    repos: Vec<Repository>,
}

impl PackageCatalog {
    /// Build a catalog from already loaded data
    pub fn new(installed: Vec<PackageRef>, repos: Vec<Repository>) -> Self {
        let installed = installed
            .into_iter()
            .map(|mut pkg| {
                pkg.repo = LOCAL_REPO.to_string();
                (pkg.name.clone(), pkg)
            })
            .collect();
        Self { installed, repos }
    }

    /// Load a fresh catalog from a source
    pub fn load(source: &dyn CatalogSource) -> Result<Self> {
        let mut catalog = Self::default();
        catalog.refresh(source)?;
        Ok(catalog)
    }

    /// Re-read the installed set and every configured repository
    pub fn refresh(&mut self, source: &dyn CatalogSource) -> Result<()> {
        let installed = source.load_installed()?;
        let mut repos = Vec::new();
        for name in source.repository_names() {
            let packages = source.load_repository(&name)?;
            debug!("Loaded {} packages from repository {}", packages.len(), name);
            repos.push(Repository::new(&name, packages));
        }
        *self = Self::new(installed, repos);
        Ok(())
    }

    /// Look up an installed package by name
    pub fn installed(&self, name: &str) -> Option<&PackageRef> {
        self.installed.get(name)
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.installed.contains_key(name)
    }

    /// Installed packages in name order
    pub fn installed_packages(&self) -> impl Iterator<Item = &PackageRef> + Clone {
        self.installed.values()
    }

    /// Sync repositories in configured order
    pub fn repositories(&self) -> &[Repository] {
        &self.repos
    }

    /// Find a package by name in the first repository that carries it
    pub fn find_sync(&self, name: &str) -> Option<&PackageRef> {
        self.repos.iter().find_map(|repo| repo.get(name))
    }

    /// Whether any configured repository carries `name`
    pub fn in_any_repository(&self, name: &str) -> bool {
        self.find_sync(name).is_some()
    }

    /// Find the installed package satisfying a dependency
    pub fn find_installed_satisfier(&self, dep: &Dependency) -> Option<&PackageRef> {
        find_satisfier(self.installed.values(), dep)
    }

    /// Find the first sync package satisfying a dependency
    ///
    /// A literal name match in any repository beats a provider.
    pub fn find_sync_satisfier(&self, dep: &Dependency) -> Option<&PackageRef> {
        self.repos
            .iter()
            .find_map(|repo| repo.get(&dep.name).filter(|p| p.satisfies(dep)))
            .or_else(|| self.sync_providers(dep).into_iter().next())
    }

    /// All sync packages satisfying a dependency, one per distinct name
    ///
    /// Ordered by repository, then by name within a repository.
    pub fn sync_providers(&self, dep: &Dependency) -> Vec<&PackageRef> {
        let mut seen = BTreeSet::new();
        let mut providers = Vec::new();
        for repo in &self.repos {
            for pkg in repo.packages() {
                if pkg.satisfies(dep) && seen.insert(pkg.name.as_str()) {
                    providers.push(pkg);
                }
            }
        }
        providers
    }

    /// Installed packages that declare a dependency satisfied by `name`
    pub fn required_by(&self, name: &str) -> Vec<String> {
        let Some(target) = self.installed.get(name) else {
            return Vec::new();
        };
        self.installed
            .values()
            .filter(|pkg| pkg.name != name)
            .filter(|pkg| pkg.depends.iter().any(|dep| target.satisfies(dep)))
            .map(|pkg| pkg.name.clone())
            .collect()
    }

    /// Installed packages not carried by any configured repository
    pub fn foreign_packages(&self) -> Vec<&PackageRef> {
        self.installed
            .values()
            .filter(|pkg| !self.in_any_repository(&pkg.name))
            .collect()
    }
}

/// Find a satisfier in a package list: name match first, then providers
pub fn find_satisfier<'a, I>(packages: I, dep: &Dependency) -> Option<&'a PackageRef>
where
    I: IntoIterator<Item = &'a PackageRef> + Clone,
{
    packages
        .clone()
        .into_iter()
        .find(|p| p.name == dep.name && p.satisfies(dep))
        .or_else(|| packages.into_iter().find(|p| p.satisfies(dep)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, version: &str) -> PackageRef {
        PackageRef::new(name, Version::parse(version).unwrap(), "")
    }

    fn dep(s: &str) -> Dependency {
        Dependency::parse(s).unwrap()
    }

    #[test]
    fn test_satisfies_by_name_and_provides() {
        let mut p = pkg("bash", "5.2-1");
        p.provides.push(dep("sh=5.2"));

        assert!(p.satisfies(&dep("bash")));
        assert!(p.satisfies(&dep("bash>=5")));
        assert!(!p.satisfies(&dep("bash>=6")));
        assert!(p.satisfies(&dep("sh")));
        assert!(p.satisfies(&dep("sh>=5")));
        assert!(p.satisfies_virtually(&dep("sh")));
        assert!(!p.satisfies_virtually(&dep("bash")));
    }

    #[test]
    fn test_unversioned_provide_only_satisfies_unversioned_dep() {
        let mut p = pkg("mawk", "1.3");
        p.provides.push(dep("awk"));
        assert!(p.satisfies(&dep("awk")));
        assert!(!p.satisfies(&dep("awk>=1")));
    }

    #[test]
    fn test_first_repository_wins() {
        let core = Repository::new("core", vec![pkg("foo", "1.0")]);
        let extra = Repository::new("extra", vec![pkg("foo", "2.0")]);
        let catalog = PackageCatalog::new(vec![], vec![core, extra]);

        let found = catalog.find_sync("foo").unwrap();
        assert_eq!(found.repo, "core");
        assert_eq!(found.version.to_string(), "1.0");
    }

    #[test]
    fn test_sync_providers_dedup_and_order() {
        let mut a = pkg("gawk", "5.0");
        a.provides.push(dep("awk"));
        let mut b = pkg("mawk", "1.3");
        b.provides.push(dep("awk"));
        let mut b2 = b.clone();
        b2.version = Version::parse("1.4").unwrap();

        let core = Repository::new("core", vec![b, a]);
        let extra = Repository::new("extra", vec![b2]);
        let catalog = PackageCatalog::new(vec![], vec![core, extra]);

        let names: Vec<_> = catalog
            .sync_providers(&dep("awk"))
            .iter()
            .map(|p| (p.name.as_str(), p.repo.as_str()))
            .collect();
        assert_eq!(names, vec![("gawk", "core"), ("mawk", "core")]);
    }

    #[test]
    fn test_required_by() {
        let openssl = pkg("openssl", "3.0");
        let mut curl = pkg("curl", "8.0");
        curl.depends.push(dep("openssl>=3"));
        let mut old = pkg("old", "1.0");
        old.depends.push(dep("openssl<2"));

        let catalog = PackageCatalog::new(vec![openssl, curl, old], vec![]);
        assert_eq!(catalog.required_by("openssl"), vec!["curl".to_string()]);
        assert!(catalog.required_by("missing").is_empty());
    }

    #[test]
    fn test_foreign_packages() {
        let catalog = PackageCatalog::new(
            vec![pkg("foo", "1.0"), pkg("yay", "12.0")],
            vec![Repository::new("core", vec![pkg("foo", "1.1")])],
        );
        let foreign: Vec<_> = catalog.foreign_packages().iter().map(|p| p.name.clone()).collect();
        assert_eq!(foreign, vec!["yay".to_string()]);
    }

    #[test]
    fn test_find_satisfier_prefers_name() {
        let mut provider = pkg("aaa", "1.0");
        provider.provides.push(dep("zzz"));
        let literal = pkg("zzz", "1.0");
        let list = [provider, literal];
        let found = find_satisfier(list.iter(), &dep("zzz")).unwrap();
        assert_eq!(found.name, "zzz");
    }
}
