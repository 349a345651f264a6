// src/resolver/mod.rs

//! Conflict-aware dependency expansion
//!
//! Given a [`DesiredStateSet`] and a [`PackageCatalog`] snapshot, the resolver
//! grows the set to a consistent closure in breadth-first layers. Each layer's
//! packages are checked for replacements, conflicts and dependencies. Whatever
//! they pull in becomes the next layer, and resolution stops once a layer adds
//! nothing new.
//!
//! Resolution never mutates its input. On success the expanded set is
//! returned as a [`Resolution`]. On failure every fatal error found is
//! returned with the warnings gathered so far.

mod conflict;
mod coupling;
mod plan;

pub use conflict::{ResolutionError, ResolutionFailure, ResolutionWarning};
pub use coupling::{CouplingKey, CouplingRule};
pub use plan::{Ambiguity, DesiredStateSet, FirstCandidate, ProviderChooser, Resolution};

use crate::catalog::{FILE_REPO, PackageCatalog, PackageRef, find_satisfier, load_package_file};
use crate::version::Dependency;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Site policy applied during resolution
#[derive(Debug, Clone)]
pub struct ResolverPolicy {
    /// Packages that must never be removed
    pub held: BTreeSet<String>,
    /// Kernel/module naming convention
    pub coupling: CouplingRule,
}

/// Expands a desired change set against a catalog snapshot
pub struct ConflictResolver<'a> {
    catalog: &'a PackageCatalog,
    policy: &'a ResolverPolicy,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(catalog: &'a PackageCatalog, policy: &'a ResolverPolicy) -> Self {
        Self { catalog, policy }
    }

    /// Resolve a change set
    pub fn resolve(
        &self,
        desired: &DesiredStateSet,
        chooser: &mut dyn ProviderChooser,
    ) -> Result<Resolution, ResolutionFailure> {
        self.run(desired, &[], false, chooser)
    }

    /// Resolve a full-system upgrade on top of `desired`
    ///
    /// `upgrades` are the newer candidates of installed packages. Installed
    /// packages that vanished from every repository are swapped for the
    /// repository package that replaces them.
    pub fn resolve_upgrade(
        &self,
        desired: &DesiredStateSet,
        upgrades: &[PackageRef],
        chooser: &mut dyn ProviderChooser,
    ) -> Result<Resolution, ResolutionFailure> {
        self.run(desired, upgrades, true, chooser)
    }

    fn run(
        &self,
        desired: &DesiredStateSet,
        upgrades: &[PackageRef],
        sysupgrade: bool,
        chooser: &mut dyn ProviderChooser,
    ) -> Result<Resolution, ResolutionFailure> {
        let mut pass = Pass::new(self.catalog, self.policy);

        for name in desired.to_add.intersection(&desired.to_remove) {
            pass.errors.push(ResolutionError::AddAndRemove(name.clone()));
        }
        if !pass.errors.is_empty() {
            return Err(pass.fail());
        }

        // Layer 0: explicit targets, file targets and upgrade candidates
        let mut layer = Vec::new();
        for path in &desired.to_load {
            match load_package_file(path) {
                Ok(pkg) => {
                    pass.loaded.insert(pkg.name.clone(), path.clone());
                    pass.select(&pkg, &mut layer);
                }
                Err(e) => pass.errors.push(ResolutionError::InvalidFile {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }),
            }
        }
        for name in &desired.to_add {
            pass.select_target(name, chooser, &mut layer);
        }
        pass.requested = pass.selected.keys().cloned().collect();
        for pkg in upgrades {
            pass.select(pkg, &mut layer);
        }
        if sysupgrade {
            pass.select_replacers(&mut layer);
        }
        for name in &desired.to_remove {
            if !self.catalog.is_installed(name) {
                pass.errors.push(ResolutionError::UnknownTarget(name.clone()));
            }
        }
        if !pass.errors.is_empty() {
            return Err(pass.fail());
        }

        for name in &desired.to_remove {
            if let Err(e) = pass.schedule_removal(name) {
                pass.errors.push(e);
                return Err(pass.fail());
            }
        }

        let mut depth = 0;
        while !layer.is_empty() {
            debug!("Resolving layer {} ({} packages)", depth, layer.len());
            let mut next = Vec::new();
            for pkg in &layer {
                if let Err(e) = pass.expand(pkg, chooser, &mut next) {
                    pass.errors.push(e);
                    return Err(pass.fail());
                }
            }
            layer = next;
            depth += 1;
        }

        pass.check_dropped_dependencies();
        if !pass.errors.is_empty() {
            return Err(pass.fail());
        }
        pass.keep_required();
        if !pass.errors.is_empty() {
            return Err(pass.fail());
        }

        let resolution = pass.finish();
        info!(
            "Resolved {} package(s) to add, {} to remove",
            resolution.packages.len(),
            resolution.desired.to_remove.len()
        );
        Ok(resolution)
    }
}

/// Working state of one resolution pass
struct Pass<'a> {
    catalog: &'a PackageCatalog,
    policy: &'a ResolverPolicy,
    desired: DesiredStateSet,
    /// Concrete packages being installed, keyed by name
    selected: BTreeMap<String, PackageRef>,
    /// Package files, keyed by the name they declare
    loaded: BTreeMap<String, PathBuf>,
    /// Explicit targets and package files, as selected in the first layer
    requested: BTreeSet<String>,
    /// Packages dropped by a mutual conflict; never selected again
    dropped: BTreeMap<String, PackageRef>,
    /// Installed packages removed for a conflict, with the package that
    /// conflicts with them
    conflict_removals: BTreeMap<String, String>,
    /// Names already queued for expansion
    queued: BTreeSet<String>,
    /// Provider decisions by virtual name, so each prompt is asked once
    decisions: BTreeMap<String, Vec<String>>,
    answered: Vec<(Ambiguity, Vec<String>)>,
    warnings: Vec<ResolutionWarning>,
    errors: Vec<ResolutionError>,
}

impl<'a> Pass<'a> {
    fn new(catalog: &'a PackageCatalog, policy: &'a ResolverPolicy) -> Self {
        Self {
            catalog,
            policy,
            desired: DesiredStateSet::default(),
            selected: BTreeMap::new(),
            loaded: BTreeMap::new(),
            requested: BTreeSet::new(),
            dropped: BTreeMap::new(),
            conflict_removals: BTreeMap::new(),
            queued: BTreeSet::new(),
            decisions: BTreeMap::new(),
            answered: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn select(&mut self, pkg: &PackageRef, next: &mut Vec<PackageRef>) {
        if self.dropped.contains_key(&pkg.name)
            || self.desired.to_remove.contains(&pkg.name)
            || self.selected.contains_key(&pkg.name)
        {
            return;
        }
        if pkg.repo == FILE_REPO {
            if let Some(path) = self.loaded.get(&pkg.name) {
                self.desired.to_load.insert(path.clone());
            }
        } else {
            self.desired.to_add.insert(pkg.name.clone());
        }
        self.selected.insert(pkg.name.clone(), pkg.clone());
        if self.queued.insert(pkg.name.clone()) {
            next.push(pkg.clone());
        }
    }

    /// Select an explicitly requested name, by package name or provision
    fn select_target(
        &mut self,
        name: &str,
        chooser: &mut dyn ProviderChooser,
        next: &mut Vec<PackageRef>,
    ) {
        let catalog = self.catalog;
        if let Some(pkg) = catalog.find_sync(name) {
            self.select(pkg, next);
            return;
        }
        let providers = catalog.sync_providers(&Dependency::any(name));
        match providers.as_slice() {
            [] => self.errors.push(ResolutionError::UnknownTarget(name.to_string())),
            [only] => self.select(only, next),
            _ => self.choose(name, &providers, chooser, next),
        }
    }

    /// Repository packages replacing installed packages no repository carries
    fn select_replacers(&mut self, next: &mut Vec<PackageRef>) {
        let catalog = self.catalog;
        for repo in catalog.repositories() {
            for candidate in repo.packages() {
                if catalog.is_installed(&candidate.name) {
                    continue;
                }
                for replaced in &candidate.replaces {
                    if catalog.in_any_repository(&replaced.name) {
                        continue;
                    }
                    let Some(old) = catalog.installed(&replaced.name) else {
                        continue;
                    };
                    if !old.satisfies(replaced) {
                        continue;
                    }
                    debug!("{} replaces foreign package {}", candidate.name, old.name);
                    self.select(candidate, next);
                }
            }
        }
    }

    fn choose(
        &mut self,
        virtual_name: &str,
        providers: &[&'a PackageRef],
        chooser: &mut dyn ProviderChooser,
        next: &mut Vec<PackageRef>,
    ) {
        let candidates: Vec<String> = providers.iter().map(|p| p.name.clone()).collect();
        let picked = match self.decisions.get(virtual_name) {
            Some(previous) => previous.clone(),
            None => {
                let ambiguity = Ambiguity {
                    virtual_name: virtual_name.to_string(),
                    candidates: candidates.clone(),
                };
                info!(
                    "{} providers available for {}: {}",
                    candidates.len(),
                    virtual_name,
                    candidates.join(", ")
                );
                let mut choice: Vec<String> = chooser
                    .choose(&ambiguity)
                    .into_iter()
                    .filter(|c| candidates.contains(c))
                    .collect();
                if choice.is_empty() {
                    choice = candidates[..1].to_vec();
                }
                self.decisions
                    .insert(virtual_name.to_string(), choice.clone());
                self.answered.push((ambiguity, choice.clone()));
                choice
            }
        };
        for name in picked {
            if let Some(pkg) = providers.iter().find(|p| p.name == name) {
                self.select(pkg, next);
            }
        }
    }

    fn expand(
        &mut self,
        pkg: &PackageRef,
        chooser: &mut dyn ProviderChooser,
        next: &mut Vec<PackageRef>,
    ) -> Result<(), ResolutionError> {
        if !self.selected.contains_key(&pkg.name) {
            return Ok(());
        }
        if self.drop_mutual_conflict(pkg) {
            return Ok(());
        }
        self.check_selected_conflicts(pkg)?;
        self.expand_coupled(pkg, next);
        self.apply_replaces(pkg)?;
        self.apply_conflicts(pkg)?;
        for dep in &pkg.depends {
            self.resolve_dependency(pkg, dep, chooser, next);
        }
        Ok(())
    }

    /// Installed satisfier that is not scheduled for removal
    fn installed_satisfier(&self, dep: &Dependency) -> Option<&'a PackageRef> {
        let removing = &self.desired.to_remove;
        find_satisfier(
            self.catalog
                .installed_packages()
                .filter(|p| !removing.contains(&p.name)),
            dep,
        )
    }

    fn resolve_dependency(
        &mut self,
        pkg: &PackageRef,
        dep: &Dependency,
        chooser: &mut dyn ProviderChooser,
        next: &mut Vec<PackageRef>,
    ) {
        let catalog = self.catalog;
        let coupled = self.policy.coupling.is_marked(dep);

        if let Some(installed) = self.installed_satisfier(dep) {
            if coupled && installed.name != dep.name {
                self.add_coupled(dep, next);
            }
            return;
        }
        if find_satisfier(self.selected.values(), dep).is_some() {
            return;
        }

        let literal = catalog
            .repositories()
            .iter()
            .find_map(|repo| repo.get(&dep.name).filter(|p| p.satisfies(dep)));
        if let Some(literal) = literal {
            self.select(literal, next);
            return;
        }
        if coupled && self.add_coupled(dep, next) {
            return;
        }

        let providers = catalog.sync_providers(dep);
        match providers.as_slice() {
            [] => {
                warn!("Unable to satisfy {} required by {}", dep, pkg.name);
                self.warnings.push(ResolutionWarning::Unsatisfiable {
                    dependency: dep.to_string(),
                    required_by: pkg.name.clone(),
                });
            }
            [only] => self.select(only, next),
            _ => self.choose(&dep.name, &providers, chooser, next),
        }
    }

    /// Kernels installed (and staying) or being added
    fn known_kernels(&self) -> BTreeSet<String> {
        let coupling = &self.policy.coupling;
        self.catalog
            .installed_packages()
            .map(|p| &p.name)
            .filter(|name| !self.desired.to_remove.contains(*name))
            .chain(self.selected.keys())
            .filter_map(|name| coupling.key(name))
            .filter(CouplingKey::is_kernel)
            .map(|key| key.kernel)
            .collect()
    }

    /// Add the providers of a coupled dependency built for a known kernel
    fn add_coupled(&mut self, dep: &Dependency, next: &mut Vec<PackageRef>) -> bool {
        let catalog = self.catalog;
        let policy = self.policy;
        let kernels = self.known_kernels();
        let mut added = false;
        for provider in catalog.sync_providers(dep) {
            if catalog.is_installed(&provider.name) || self.selected.contains_key(&provider.name) {
                continue;
            }
            if let Some(key) = policy.coupling.key(&provider.name)
                && kernels.contains(&key.kernel)
            {
                debug!("Coupled provider {} selected for {}", provider.name, dep);
                self.select(provider, next);
                added = true;
            }
        }
        added
    }

    /// A new kernel brings the module packages installed for other kernels;
    /// a new module package is installed for every kernel
    fn expand_coupled(&mut self, pkg: &PackageRef, next: &mut Vec<PackageRef>) {
        let catalog = self.catalog;
        let policy = self.policy;
        let coupling = &policy.coupling;
        let Some(key) = coupling.key(&pkg.name) else {
            return;
        };

        let wanted: Vec<String> = if key.is_kernel() {
            let suffixes: BTreeSet<String> = catalog
                .installed_packages()
                .filter_map(|p| coupling.key(&p.name))
                .filter(|k| !k.is_kernel())
                .map(|k| k.suffix)
                .collect();
            suffixes
                .into_iter()
                .map(|suffix| format!("{}{}", key.kernel, suffix))
                .collect()
        } else if key.is_module() {
            self.known_kernels()
                .into_iter()
                .map(|kernel| format!("{}{}", kernel, key.suffix))
                .collect()
        } else {
            Vec::new()
        };

        for name in wanted {
            if name == pkg.name || catalog.is_installed(&name) {
                continue;
            }
            if let Some(module) = catalog.find_sync(&name) {
                debug!("{} pulls in {}", pkg.name, name);
                self.select(module, next);
            }
        }
    }

    fn apply_replaces(&mut self, pkg: &PackageRef) -> Result<(), ResolutionError> {
        for replaced in &pkg.replaces {
            let Some(old) = self.installed_satisfier(replaced) else {
                continue;
            };
            if old.name == pkg.name || self.desired.to_add.contains(&old.name) {
                continue;
            }
            self.schedule_removal(&old.name)?;
            info!("{} will be replaced by {}", old.name, pkg.name);
            self.warnings.push(ResolutionWarning::Replaced {
                old: old.name.clone(),
                new: pkg.name.clone(),
            });
        }
        Ok(())
    }

    /// Drop two requested packages, neither installed, that conflict with
    /// each other
    fn drop_mutual_conflict(&mut self, pkg: &PackageRef) -> bool {
        let catalog = self.catalog;
        if catalog.is_installed(&pkg.name) || !self.requested.contains(&pkg.name) {
            return false;
        }
        let rival = self
            .selected
            .values()
            .filter(|other| {
                other.name != pkg.name
                    && self.requested.contains(&other.name)
                    && !catalog.is_installed(&other.name)
            })
            .find(|other| in_conflict(pkg, other))
            .map(|other| other.name.clone());
        let Some(rival) = rival else {
            return false;
        };

        for name in [&pkg.name, &rival] {
            if let Some(dropped) = self.selected.remove(name) {
                self.dropped.insert(name.clone(), dropped);
            }
            self.desired.to_add.remove(name);
            if let Some(path) = self.loaded.get(name) {
                self.desired.to_load.remove(path);
            }
        }
        warn!("{} conflicts with {}, neither will be installed", pkg.name, rival);
        self.warnings.push(ResolutionWarning::MutualConflict {
            first: pkg.name.clone(),
            second: rival,
        });
        true
    }

    /// A package being installed may not conflict with another one
    fn check_selected_conflicts(&self, pkg: &PackageRef) -> Result<(), ResolutionError> {
        match self
            .selected
            .values()
            .find(|other| other.name != pkg.name && in_conflict(pkg, other))
        {
            Some(other) => Err(ResolutionError::Incompatible {
                first: pkg.name.clone(),
                second: other.name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Conflicts with installed packages that stay at their installed version
    ///
    /// An installed package that is also selected is checked in its new
    /// version by [`Pass::check_selected_conflicts`].
    fn apply_conflicts(&mut self, pkg: &PackageRef) -> Result<(), ResolutionError> {
        let catalog = self.catalog;
        for installed in catalog.installed_packages() {
            if installed.name == pkg.name || self.selected.contains_key(&installed.name) {
                continue;
            }
            if in_conflict(pkg, installed) {
                self.resolve_conflict(pkg, installed)?;
            }
        }
        Ok(())
    }

    fn resolve_conflict(
        &mut self,
        pkg: &PackageRef,
        installed: &PackageRef,
    ) -> Result<(), ResolutionError> {
        if self.desired.to_remove.contains(&installed.name) {
            self.conflict_removals
                .entry(installed.name.clone())
                .or_insert_with(|| pkg.name.clone());
            return Ok(());
        }
        let required_by = self.dependents_left_unsatisfied(&installed.name);
        if !required_by.is_empty() {
            let err = ResolutionError::ConflictRequired {
                new: pkg.name.clone(),
                installed: installed.name.clone(),
                required_by,
            };
            if !self.errors.contains(&err) {
                self.errors.push(err);
            }
            return Ok(());
        }
        self.schedule_removal(&installed.name)?;
        self.conflict_removals
            .insert(installed.name.clone(), pkg.name.clone());
        info!("{} conflicts with {}, removing {}", pkg.name, installed.name, installed.name);
        self.warnings.push(ResolutionWarning::Conflict {
            new: pkg.name.clone(),
            installed: installed.name.clone(),
        });
        Ok(())
    }

    /// Whether anything other than `excluded` will satisfy `dep` afterwards
    fn satisfied_without(&self, dep: &Dependency, excluded: &str) -> bool {
        self.catalog.installed_packages().any(|p| {
            p.name != excluded && !self.desired.to_remove.contains(&p.name) && p.satisfies(dep)
        }) || self
            .selected
            .values()
            .any(|p| p.name != excluded && p.satisfies(dep))
    }

    /// Installed packages that would lose a dependency if `name` were removed
    fn dependents_left_unsatisfied(&self, name: &str) -> Vec<String> {
        let Some(target) = self.catalog.installed(name) else {
            return Vec::new();
        };
        self.catalog
            .installed_packages()
            .filter(|e| e.name != name && !self.desired.to_remove.contains(&e.name))
            .filter(|e| {
                let effective = self.selected.get(&e.name).unwrap_or(e);
                effective
                    .depends
                    .iter()
                    .any(|dep| target.satisfies(dep) && !self.satisfied_without(dep, name))
            })
            .map(|e| e.name.clone())
            .collect()
    }

    /// Remove an installed package and everything that depends only on it
    fn schedule_removal(&mut self, name: &str) -> Result<(), ResolutionError> {
        if self.policy.held.contains(name) {
            return Err(ResolutionError::Held {
                name: name.to_string(),
            });
        }
        if !self.catalog.is_installed(name) || !self.desired.to_remove.insert(name.to_string()) {
            return Ok(());
        }
        debug!("Scheduling removal of {}", name);

        let policy = self.policy;
        let coupling = &policy.coupling;
        if let Some(key) = coupling.key(name)
            && key.is_kernel()
        {
            let modules: Vec<String> = self
                .catalog
                .installed_packages()
                .filter(|p| {
                    coupling
                        .key(&p.name)
                        .is_some_and(|k| k.kernel == key.kernel && !k.is_kernel())
                })
                .map(|p| p.name.clone())
                .collect();
            for module in modules {
                self.schedule_removal(&module)?;
            }
        }

        for dependent in self.dependents_left_unsatisfied(name) {
            if self.desired.to_add.contains(&dependent) {
                continue;
            }
            self.schedule_removal(&dependent)?;
        }
        Ok(())
    }

    /// Keep scheduled removals the final package set still depends on
    fn keep_required(&mut self) {
        let mut kept = BTreeSet::new();
        let mut queue: Vec<PackageRef> = self.selected.values().cloned().collect();
        while let Some(pkg) = queue.pop() {
            for dep in &pkg.depends {
                let satisfier = find_satisfier(self.selected.values(), dep)
                    .or_else(|| self.installed_satisfier(dep))
                    .or_else(|| self.catalog.find_installed_satisfier(dep))
                    .cloned();
                let Some(satisfier) = satisfier else {
                    continue;
                };
                if !kept.insert(satisfier.name.clone()) {
                    continue;
                }
                if let Some(new) = self.conflict_removals.get(&satisfier.name) {
                    let err = ResolutionError::ConflictRequired {
                        new: new.clone(),
                        installed: satisfier.name.clone(),
                        required_by: vec![pkg.name.clone()],
                    };
                    if !self.errors.contains(&err) {
                        self.errors.push(err);
                    }
                } else if self.desired.to_remove.contains(&satisfier.name) {
                    info!("{} is still required by {}", satisfier.name, pkg.name);
                    self.warnings.push(ResolutionWarning::KeptRequired {
                        name: satisfier.name.clone(),
                        required_by: pkg.name.clone(),
                    });
                }
                queue.push(satisfier);
            }
        }

        let adding: BTreeSet<&String> = self.selected.keys().collect();
        self.desired
            .to_remove
            .retain(|name| !kept.contains(name) && !adding.contains(name));
    }

    /// Selected packages may not depend on a package a mutual conflict
    /// dropped
    fn check_dropped_dependencies(&mut self) {
        let mut found = Vec::new();
        for pkg in self.selected.values() {
            for dep in &pkg.depends {
                if find_satisfier(self.selected.values(), dep).is_some()
                    || self.installed_satisfier(dep).is_some()
                {
                    continue;
                }
                if let Some(dropped) = find_satisfier(self.dropped.values(), dep) {
                    found.push(ResolutionError::NeedsDropped {
                        name: pkg.name.clone(),
                        dependency: dropped.name.clone(),
                    });
                }
            }
        }
        self.errors.extend(found);
    }

    fn fail(self) -> ResolutionFailure {
        ResolutionFailure {
            errors: self.errors,
            warnings: self.warnings,
        }
    }

    fn finish(self) -> Resolution {
        Resolution {
            desired: self.desired,
            packages: self.selected,
            warnings: self.warnings,
            answered: self.answered,
        }
    }
}

/// Whether either package declares a conflict the other satisfies
fn in_conflict(a: &PackageRef, b: &PackageRef) -> bool {
    a.conflicts.iter().any(|c| b.satisfies(c)) || b.conflicts.iter().any(|c| a.satisfies(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Repository;
    use crate::version::Version;

    trait Relations {
        fn depends(self, dep: &str) -> Self;
        fn conflicts(self, dep: &str) -> Self;
        fn replaces(self, dep: &str) -> Self;
        fn provides(self, dep: &str) -> Self;
    }

    impl Relations for PackageRef {
        fn depends(mut self, dep: &str) -> Self {
            self.depends.push(Dependency::parse(dep).unwrap());
            self
        }
        fn conflicts(mut self, dep: &str) -> Self {
            self.conflicts.push(Dependency::parse(dep).unwrap());
            self
        }
        fn replaces(mut self, dep: &str) -> Self {
            self.replaces.push(Dependency::parse(dep).unwrap());
            self
        }
        fn provides(mut self, dep: &str) -> Self {
            self.provides.push(Dependency::parse(dep).unwrap());
            self
        }
    }

    fn pkg(name: &str, version: &str) -> PackageRef {
        PackageRef::new(name, Version::parse(version).unwrap(), "")
    }

    fn catalog(installed: Vec<PackageRef>, sync: Vec<PackageRef>) -> PackageCatalog {
        PackageCatalog::new(installed, vec![Repository::new("core", sync)])
    }

    fn policy(held: &[&str]) -> ResolverPolicy {
        ResolverPolicy {
            held: held.iter().map(|s| s.to_string()).collect(),
            coupling: CouplingRule::new(&["kernel".to_string()]).unwrap(),
        }
    }

    fn names(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_dependencies_expand_in_layers() {
        let catalog = catalog(
            vec![],
            vec![
                pkg("foo", "1.0").depends("bar"),
                pkg("bar", "1.0").depends("baz>=2"),
                pkg("baz", "2.1"),
            ],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("foo"), &mut FirstCandidate)
            .unwrap();

        assert_eq!(names(&resolution.desired.to_add), vec!["bar", "baz", "foo"]);
        assert!(resolution.desired.to_remove.is_empty());
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn test_installed_dependency_is_not_added() {
        let catalog = catalog(
            vec![pkg("bar", "1.0")],
            vec![pkg("foo", "1.0").depends("bar"), pkg("bar", "1.1")],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("foo"), &mut FirstCandidate)
            .unwrap();
        assert_eq!(names(&resolution.desired.to_add), vec!["foo"]);
    }

    #[test]
    fn test_outdated_installed_dependency_is_upgraded() {
        let catalog = catalog(
            vec![pkg("bar", "1.0")],
            vec![pkg("foo", "2.0").depends("bar>=1.5"), pkg("bar", "1.5")],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("foo"), &mut FirstCandidate)
            .unwrap();
        assert_eq!(names(&resolution.desired.to_add), vec!["bar", "foo"]);
        assert_eq!(resolution.upgrades(|n| catalog.is_installed(n)), vec!["bar"]);
    }

    #[test]
    fn test_ambiguity_is_asked_once_and_defaults_to_first() {
        let catalog = catalog(
            vec![],
            vec![
                pkg("a", "1.0").depends("awk"),
                pkg("b", "1.0").depends("awk"),
                pkg("gawk", "5.0").provides("awk"),
                pkg("mawk", "1.3").provides("awk"),
            ],
        );
        let policy = policy(&[]);
        let mut asked = 0;
        let mut chooser = |ambiguity: &Ambiguity| {
            asked += 1;
            assert_eq!(ambiguity.virtual_name, "awk");
            assert_eq!(ambiguity.candidates, vec!["gawk", "mawk"]);
            Vec::<String>::new()
        };
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("a").add("b"), &mut chooser)
            .unwrap();

        assert_eq!(asked, 1);
        assert!(resolution.desired.to_add.contains("gawk"));
        assert!(!resolution.desired.to_add.contains("mawk"));
        assert_eq!(resolution.answered.len(), 1);
    }

    #[test]
    fn test_ambiguity_choice_is_respected() {
        let catalog = catalog(
            vec![],
            vec![
                pkg("a", "1.0").depends("awk"),
                pkg("gawk", "5.0").provides("awk"),
                pkg("mawk", "1.3").provides("awk"),
            ],
        );
        let policy = policy(&[]);
        let mut chooser = |_: &Ambiguity| vec!["mawk".to_string()];
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("a"), &mut chooser)
            .unwrap();
        assert_eq!(names(&resolution.desired.to_add), vec!["a", "mawk"]);
    }

    #[test]
    fn test_new_kernel_pulls_installed_module_suffixes() {
        let catalog = catalog(
            vec![pkg("kernel42", "4.2"), pkg("kernel42-extra-modules", "4.2")],
            vec![
                pkg("kernel42", "4.2"),
                pkg("kernel42-extra-modules", "4.2"),
                pkg("kernel43", "4.3"),
                pkg("kernel43-extra-modules", "4.3"),
            ],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("kernel43"), &mut FirstCandidate)
            .unwrap();
        assert_eq!(
            names(&resolution.desired.to_add),
            vec!["kernel43", "kernel43-extra-modules"]
        );
    }

    #[test]
    fn test_coupled_dependency_is_never_prompted() {
        let catalog = catalog(
            vec![
                pkg("kernel42", "4.2"),
                pkg("kernel42-nvidia", "550").provides("nvidia-modules"),
                pkg("nvidia-utils", "550").depends("nvidia-modules"),
            ],
            vec![
                pkg("kernel43", "4.3"),
                pkg("kernel42-nvidia", "550").provides("nvidia-modules"),
                pkg("kernel43-nvidia", "550").provides("nvidia-modules"),
                pkg("nvidia-utils", "555").depends("nvidia-modules"),
            ],
        );
        let policy = policy(&[]);
        let mut chooser = |_: &Ambiguity| -> Vec<String> { panic!("coupled providers must not prompt") };
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(
                &DesiredStateSet::new().add("kernel43").add("nvidia-utils"),
                &mut chooser,
            )
            .unwrap();
        assert!(resolution.desired.to_add.contains("kernel43-nvidia"));
        assert!(!resolution.desired.to_add.contains("kernel42-nvidia"));
    }

    #[test]
    fn test_module_package_installed_for_every_kernel() {
        let catalog = catalog(
            vec![pkg("kernel42", "4.2"), pkg("kernel43", "4.3")],
            vec![
                pkg("kernel42-zfs-modules", "2.2"),
                pkg("kernel43-zfs-modules", "2.2"),
            ],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(
                &DesiredStateSet::new().add("kernel43-zfs-modules"),
                &mut FirstCandidate,
            )
            .unwrap();
        assert_eq!(
            names(&resolution.desired.to_add),
            vec!["kernel42-zfs-modules", "kernel43-zfs-modules"]
        );
    }

    #[test]
    fn test_mutual_conflict_drops_both() {
        let catalog = catalog(
            vec![],
            vec![pkg("x", "1.0").conflicts("y"), pkg("y", "1.0")],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("x").add("y"), &mut FirstCandidate)
            .unwrap();

        assert!(resolution.desired.to_add.is_empty());
        assert_eq!(
            resolution.warnings,
            vec![ResolutionWarning::MutualConflict {
                first: "x".to_string(),
                second: "y".to_string(),
            }]
        );
    }

    #[test]
    fn test_replaces_schedules_removal() {
        let mut libfoo = pkg("libfoo", "1.0");
        libfoo.replaces.push(Dependency::any("libfoo-old"));
        let catalog = catalog(
            vec![
                pkg("libfoo-old", "0.9"),
                pkg("app", "1.0").depends("libfoo-old"),
            ],
            vec![libfoo.provides("libfoo-old")],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("libfoo"), &mut FirstCandidate)
            .unwrap();

        assert_eq!(names(&resolution.desired.to_add), vec!["libfoo"]);
        assert_eq!(names(&resolution.desired.to_remove), vec!["libfoo-old"]);
        assert!(resolution.warnings.contains(&ResolutionWarning::Replaced {
            old: "libfoo-old".to_string(),
            new: "libfoo".to_string(),
        }));
    }

    #[test]
    fn test_conflict_with_required_package_fails() {
        let catalog = catalog(
            vec![pkg("c", "1.0"), pkg("e", "1.0").depends("c")],
            vec![pkg("d", "1.0").conflicts("c")],
        );
        let policy = policy(&[]);
        let desired = DesiredStateSet::new().add("d");
        let failure = ConflictResolver::new(&catalog, &policy)
            .resolve(&desired, &mut FirstCandidate)
            .unwrap_err();

        assert_eq!(failure.errors.len(), 1);
        assert_eq!(
            failure.to_string(),
            "d conflicts with c but c is required by e"
        );
        assert_eq!(desired, DesiredStateSet::new().add("d"));
    }

    #[test]
    fn test_conflict_with_unneeded_package_removes_it() {
        let catalog = catalog(
            vec![pkg("c", "1.0")],
            vec![pkg("d", "1.0").conflicts("c")],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("d"), &mut FirstCandidate)
            .unwrap();
        assert_eq!(names(&resolution.desired.to_remove), vec!["c"]);
        assert!(matches!(
            resolution.warnings[0],
            ResolutionWarning::Conflict { .. }
        ));
    }

    #[test]
    fn test_installed_side_conflict_detected() {
        let catalog = catalog(
            vec![pkg("c", "1.0").conflicts("d")],
            vec![pkg("d", "1.0")],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("d"), &mut FirstCandidate)
            .unwrap();
        assert_eq!(names(&resolution.desired.to_remove), vec!["c"]);
    }

    #[test]
    fn test_upgrade_clears_conflict() {
        let catalog = catalog(
            vec![pkg("c", "1.0").conflicts("d")],
            vec![pkg("c", "2.0"), pkg("d", "1.0")],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("c").add("d"), &mut FirstCandidate)
            .unwrap();
        assert!(resolution.desired.to_remove.is_empty());
        assert_eq!(names(&resolution.desired.to_add), vec!["c", "d"]);
    }

    #[test]
    fn test_dependency_conflicting_with_target_is_fatal() {
        let catalog = catalog(
            vec![],
            vec![
                pkg("a", "1.0").depends("b"),
                pkg("b", "1.0").conflicts("c"),
                pkg("c", "1.0"),
            ],
        );
        let policy = policy(&[]);
        let failure = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("a").add("c"), &mut FirstCandidate)
            .unwrap_err();

        assert_eq!(
            failure.errors,
            vec![ResolutionError::Incompatible {
                first: "c".to_string(),
                second: "b".to_string(),
            }]
        );
        assert!(
            !failure
                .warnings
                .iter()
                .any(|w| matches!(w, ResolutionWarning::MutualConflict { .. }))
        );
    }

    #[test]
    fn test_upgrade_that_still_conflicts_is_fatal() {
        let catalog = catalog(
            vec![pkg("c", "1.0").conflicts("d")],
            vec![pkg("c", "2.0").conflicts("d"), pkg("d", "1.0")],
        );
        let policy = policy(&[]);
        let failure = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("c").add("d"), &mut FirstCandidate)
            .unwrap_err();

        assert_eq!(
            failure.errors,
            vec![ResolutionError::Incompatible {
                first: "c".to_string(),
                second: "d".to_string(),
            }]
        );
        assert!(failure.warnings.is_empty());
    }

    #[test]
    fn test_target_needing_dropped_package_is_fatal() {
        let catalog = catalog(
            vec![],
            vec![
                pkg("a", "1.0").depends("x"),
                pkg("x", "1.0").conflicts("y"),
                pkg("y", "1.0"),
            ],
        );
        let policy = policy(&[]);
        let failure = ConflictResolver::new(&catalog, &policy)
            .resolve(
                &DesiredStateSet::new().add("a").add("x").add("y"),
                &mut FirstCandidate,
            )
            .unwrap_err();

        assert_eq!(
            failure.errors,
            vec![ResolutionError::NeedsDropped {
                name: "a".to_string(),
                dependency: "x".to_string(),
            }]
        );
    }

    #[test]
    fn test_conflict_removal_needed_by_new_package_is_fatal() {
        let catalog = catalog(
            vec![pkg("c", "1.0")],
            vec![pkg("app", "1.0").depends("c"), pkg("d", "1.0").conflicts("c")],
        );
        let policy = policy(&[]);
        let failure = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("app").add("d"), &mut FirstCandidate)
            .unwrap_err();

        assert_eq!(
            failure.to_string(),
            "d conflicts with c but c is required by app"
        );
    }

    #[test]
    fn test_resolutions_never_keep_conflicting_packages() {
        let catalog = catalog(
            vec![
                pkg("c", "1.0").conflicts("d"),
                pkg("lib", "1.0"),
                pkg("app", "1.0").depends("lib"),
                pkg("oldtool", "1.0"),
            ],
            vec![
                pkg("c", "2.0"),
                pkg("d", "1.0"),
                pkg("e", "1.0").conflicts("lib"),
                pkg("newtool", "2.0").replaces("oldtool").conflicts("oldtool"),
                pkg("x", "1.0").conflicts("y"),
                pkg("y", "1.0"),
                pkg("a", "1.0").depends("b"),
                pkg("b", "1.0").conflicts("z"),
                pkg("z", "1.0"),
                pkg("tool", "1.0").depends("oldtool"),
            ],
        );
        let policy = policy(&[]);
        let resolver = ConflictResolver::new(&catalog, &policy);
        let targets = ["a", "c", "d", "e", "newtool", "tool", "x", "y", "z"];

        let mut resolved = 0;
        for mask in 0u32..(1 << targets.len()) {
            let mut desired = DesiredStateSet::new();
            for (i, name) in targets.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    desired = desired.add(*name);
                }
            }
            let Ok(resolution) = resolver.resolve(&desired, &mut FirstCandidate) else {
                continue;
            };
            resolved += 1;

            let plan = &resolution.desired;
            assert!(plan.to_add.is_disjoint(&plan.to_remove), "{:?}", desired);
            let staying: Vec<&PackageRef> = catalog
                .installed_packages()
                .filter(|p| !plan.to_remove.contains(&p.name))
                .filter(|p| !resolution.packages.contains_key(&p.name))
                .collect();
            for pkg in resolution.packages.values() {
                for other in resolution.packages.values().chain(staying.iter().copied()) {
                    assert!(
                        other.name == pkg.name || !in_conflict(pkg, other),
                        "{} and {} both kept for {:?}",
                        pkg.name,
                        other.name,
                        desired
                    );
                }
            }
        }
        assert!(resolved > 0);
    }

    #[test]
    fn test_removal_cascades_to_dependents() {
        let catalog = catalog(
            vec![
                pkg("lib", "1.0"),
                pkg("app", "1.0").depends("lib"),
                pkg("plugin", "1.0").depends("app"),
                pkg("other", "1.0"),
            ],
            vec![],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().remove("lib"), &mut FirstCandidate)
            .unwrap();
        assert_eq!(
            names(&resolution.desired.to_remove),
            vec!["app", "lib", "plugin"]
        );
    }

    #[test]
    fn test_held_package_blocks_removal() {
        let catalog = catalog(
            vec![pkg("lib", "1.0"), pkg("pacman", "6.0").depends("lib")],
            vec![],
        );
        let policy = policy(&["pacman"]);
        let failure = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().remove("lib"), &mut FirstCandidate)
            .unwrap_err();
        assert_eq!(
            failure.errors,
            vec![ResolutionError::Held {
                name: "pacman".to_string()
            }]
        );

        let failure = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().remove("pacman"), &mut FirstCandidate)
            .unwrap_err();
        assert!(failure.errors[0].is_held());
    }

    #[test]
    fn test_kernel_removal_takes_its_modules() {
        let catalog = catalog(
            vec![
                pkg("kernel42", "4.2"),
                pkg("kernel42-extra-modules", "4.2"),
                pkg("kernel43", "4.3"),
                pkg("kernel43-extra-modules", "4.3"),
            ],
            vec![],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().remove("kernel42"), &mut FirstCandidate)
            .unwrap();
        assert_eq!(
            names(&resolution.desired.to_remove),
            vec!["kernel42", "kernel42-extra-modules"]
        );
    }

    #[test]
    fn test_add_and_remove_same_name_is_fatal() {
        let catalog = catalog(vec![pkg("foo", "1.0")], vec![pkg("foo", "1.1")]);
        let policy = policy(&[]);
        let failure = ConflictResolver::new(&catalog, &policy)
            .resolve(
                &DesiredStateSet::new().add("foo").remove("foo"),
                &mut FirstCandidate,
            )
            .unwrap_err();
        assert_eq!(
            failure.errors,
            vec![ResolutionError::AddAndRemove("foo".to_string())]
        );
    }

    #[test]
    fn test_unknown_targets() {
        let catalog = catalog(vec![], vec![]);
        let policy = policy(&[]);
        let failure = ConflictResolver::new(&catalog, &policy)
            .resolve(
                &DesiredStateSet::new().add("ghost").remove("phantom"),
                &mut FirstCandidate,
            )
            .unwrap_err();
        assert_eq!(failure.errors.len(), 2);
    }

    #[test]
    fn test_unsatisfiable_dependency_is_a_warning() {
        let catalog = catalog(vec![], vec![pkg("foo", "1.0").depends("missing")]);
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().add("foo"), &mut FirstCandidate)
            .unwrap();
        assert_eq!(names(&resolution.desired.to_add), vec!["foo"]);
        assert!(matches!(
            resolution.warnings[0],
            ResolutionWarning::Unsatisfiable { .. }
        ));
    }

    #[test]
    fn test_removal_kept_when_new_package_needs_it() {
        let catalog = catalog(
            vec![pkg("lib", "1.0")],
            vec![pkg("app", "1.0").depends("lib")],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(
                &DesiredStateSet::new().add("app").remove("lib"),
                &mut FirstCandidate,
            )
            .unwrap();
        assert!(resolution.desired.to_remove.is_empty());
        assert!(resolution.warnings.contains(&ResolutionWarning::KeptRequired {
            name: "lib".to_string(),
            required_by: "app".to_string(),
        }));
    }

    #[test]
    fn test_sysupgrade_swaps_dropped_package_for_replacer() {
        let catalog = catalog(
            vec![pkg("oldtool", "1.0")],
            vec![pkg("newtool", "2.0").replaces("oldtool")],
        );
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve_upgrade(&DesiredStateSet::new(), &[], &mut FirstCandidate)
            .unwrap();
        assert_eq!(names(&resolution.desired.to_add), vec!["newtool"]);
        assert_eq!(names(&resolution.desired.to_remove), vec!["oldtool"]);
    }

    #[test]
    fn test_load_file_target() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("tool.pkg.toml");
        std::fs::write(
            &path,
            "name = \"tool\"\nversion = \"1.0-1\"\ndepends = [\"lib\"]\n",
        )
        .unwrap();
        let catalog = catalog(vec![], vec![pkg("lib", "1.0")]);
        let policy = policy(&[]);
        let resolution = ConflictResolver::new(&catalog, &policy)
            .resolve(&DesiredStateSet::new().load(&path), &mut FirstCandidate)
            .unwrap();

        assert_eq!(names(&resolution.desired.to_add), vec!["lib"]);
        assert!(resolution.desired.to_load.contains(&path));
        assert!(resolution.packages.contains_key("tool"));
    }
}
