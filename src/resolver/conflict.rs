// src/resolver/conflict.rs

//! Side-channel output of the resolver
//!
//! Warnings are advisory and never stop the pipeline. Errors are fatal: the
//! resolver returns them instead of a plan and nothing is handed to the
//! worker.

use std::fmt;

/// An automatic decision the user should be told about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionWarning {
    /// An installed package is removed because a new one replaces it
    Replaced { old: String, new: String },
    /// An installed package is removed because it conflicts with a new one
    Conflict { new: String, installed: String },
    /// Two requested packages conflict; neither is installed
    MutualConflict { first: String, second: String },
    /// Nothing installed or available satisfies a dependency
    Unsatisfiable {
        dependency: String,
        required_by: String,
    },
    /// A requested removal was dropped because the new set still needs it
    KeptRequired { name: String, required_by: String },
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionWarning::Replaced { old, new } => {
                write!(f, "{} will be replaced by {}", old, new)
            }
            ResolutionWarning::Conflict { new, installed } => {
                write!(f, "{} conflicts with {}", new, installed)
            }
            ResolutionWarning::MutualConflict { first, second } => write!(
                f,
                "{} conflicts with {}\nNone of them will be installed",
                first, second
            ),
            ResolutionWarning::Unsatisfiable {
                dependency,
                required_by,
            } => write!(
                f,
                "unable to satisfy dependency '{}' required by {}",
                dependency, required_by
            ),
            ResolutionWarning::KeptRequired { name, required_by } => write!(
                f,
                "{} will not be removed because it is required by {}",
                name, required_by
            ),
        }
    }
}

/// A reason the change set cannot be carried out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// Removing a conflicting package would break another installed package
    ConflictRequired {
        new: String,
        installed: String,
        required_by: Vec<String>,
    },
    /// Two packages the result needs conflict with each other
    Incompatible { first: String, second: String },
    /// A package needs one that a mutual conflict dropped
    NeedsDropped { name: String, dependency: String },
    /// A held package would have to be removed
    Held { name: String },
    /// A requested name matches nothing in any repository
    UnknownTarget(String),
    /// The same name was requested for installation and removal
    AddAndRemove(String),
    /// A package file could not be loaded
    InvalidFile { path: String, reason: String },
}

impl ResolutionError {
    pub fn is_held(&self) -> bool {
        matches!(self, ResolutionError::Held { .. })
    }
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionError::ConflictRequired {
                new,
                installed,
                required_by,
            } => write!(
                f,
                "{} conflicts with {} but {} is required by {}",
                new,
                installed,
                installed,
                required_by.join(", ")
            ),
            ResolutionError::Incompatible { first, second } => write!(
                f,
                "{} conflicts with {} and both are needed",
                first, second
            ),
            ResolutionError::NeedsDropped { name, dependency } => write!(
                f,
                "{} depends on {} which will not be installed",
                name, dependency
            ),
            ResolutionError::Held { name } => write!(
                f,
                "The transaction cannot be performed because it needs to remove {} which is a locked package",
                name
            ),
            ResolutionError::UnknownTarget(name) => write!(f, "target not found: {}", name),
            ResolutionError::AddAndRemove(name) => {
                write!(f, "{} is requested for both installation and removal", name)
            }
            ResolutionError::InvalidFile { path, reason } => {
                write!(f, "{} is not a valid package file: {}", path, reason)
            }
        }
    }
}

/// A failed resolution: every error found plus the warnings gathered so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionFailure {
    pub errors: Vec<ResolutionError>,
    pub warnings: Vec<ResolutionWarning>,
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", lines.join("\n"))
    }
}

impl std::error::Error for ResolutionFailure {}

impl From<ResolutionFailure> for crate::Error {
    fn from(failure: ResolutionFailure) -> Self {
        if failure.errors.iter().any(ResolutionError::is_held) {
            crate::Error::LockedPackage(failure.to_string())
        } else {
            crate::Error::Resolution(failure.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_required_names_all_parties() {
        let err = ResolutionError::ConflictRequired {
            new: "d".to_string(),
            installed: "c".to_string(),
            required_by: vec!["e".to_string()],
        };
        assert_eq!(err.to_string(), "d conflicts with c but c is required by e");
    }

    #[test]
    fn test_failure_maps_held_to_locked_package() {
        let failure = ResolutionFailure {
            errors: vec![ResolutionError::Held {
                name: "glibc".to_string(),
            }],
            warnings: vec![],
        };
        let err: crate::Error = failure.into();
        assert!(matches!(err, crate::Error::LockedPackage(_)));
        assert!(err.to_string().contains("glibc"));
    }

    #[test]
    fn test_warning_text() {
        let w = ResolutionWarning::Replaced {
            old: "foo".to_string(),
            new: "foo-ng".to_string(),
        };
        assert_eq!(w.to_string(), "foo will be replaced by foo-ng");
    }
}
