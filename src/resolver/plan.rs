// src/resolver/plan.rs

//! Resolution input and output data structures

use super::conflict::ResolutionWarning;
use crate::catalog::PackageRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// The change set a planning session is composing
///
/// Owned by exactly one planning session. Sets keep membership idempotent and
/// iteration deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredStateSet {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
    pub to_load: BTreeSet<PathBuf>,
}

impl DesiredStateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request installation (or upgrade) of a package by name
    pub fn add(mut self, name: impl Into<String>) -> Self {
        self.to_add.insert(name.into());
        self
    }

    /// Request removal of an installed package
    pub fn remove(mut self, name: impl Into<String>) -> Self {
        self.to_remove.insert(name.into());
        self
    }

    /// Request installation of a package file
    pub fn load(mut self, path: impl Into<PathBuf>) -> Self {
        self.to_load.insert(path.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_load.is_empty()
    }
}

/// A choice point: several packages provide the same virtual dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiguity {
    pub virtual_name: String,
    pub candidates: Vec<String>,
}

/// Answers provider ambiguities during resolution
///
/// Returning an empty list selects the first candidate.
pub trait ProviderChooser {
    fn choose(&mut self, ambiguity: &Ambiguity) -> Vec<String>;
}

/// Chooser for environments that cannot prompt
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstCandidate;

impl ProviderChooser for FirstCandidate {
    fn choose(&mut self, _ambiguity: &Ambiguity) -> Vec<String> {
        Vec::new()
    }
}

impl<F> ProviderChooser for F
where
    F: FnMut(&Ambiguity) -> Vec<String>,
{
    fn choose(&mut self, ambiguity: &Ambiguity) -> Vec<String> {
        self(ambiguity)
    }
}

/// A successful resolution
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The expanded change set
    pub desired: DesiredStateSet,
    /// Concrete packages to install, keyed by name (repository and file targets)
    pub packages: BTreeMap<String, PackageRef>,
    pub warnings: Vec<ResolutionWarning>,
    /// Provider prompts answered during this pass, with the chosen names
    pub answered: Vec<(Ambiguity, Vec<String>)>,
}

impl Resolution {
    /// Names in `to_add` that are already installed (upgrades or reinstalls)
    pub fn upgrades<'a>(&'a self, installed: impl Fn(&str) -> bool + 'a) -> Vec<&'a str> {
        self.desired
            .to_add
            .iter()
            .map(String::as_str)
            .filter(|name| installed(name))
            .collect()
    }

    /// Total bytes to download for the packages being added
    pub fn download_size(&self) -> u64 {
        self.packages.values().map(|p| p.download_size).sum()
    }
}
