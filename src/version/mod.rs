// src/version/mod.rs

//! Version handling and dependency constraint satisfaction
//!
//! Versions use the `[epoch:]pkgver[-pkgrel]` layout. Comparison is
//! segment-wise: runs of digits compare numerically, runs of letters compare
//! lexically, a numeric segment is always newer than an alphabetic one, and a
//! trailing alphabetic segment (a pre-release suffix such as `1.0rc1`) sorts
//! lower than the bare release it precedes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A parsed package version with epoch, pkgver and pkgrel components
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub epoch: u64,
    pub pkgver: String,
    pub pkgrel: Option<String>,
}

impl Version {
    /// Parse a version string
    ///
    /// Format: [epoch:]pkgver[-pkgrel]
    /// Examples:
    /// - "1.2.3" → epoch=0, pkgver="1.2.3", pkgrel=None
    /// - "2:1.2.3-1" → epoch=2, pkgver="1.2.3", pkgrel=Some("1")
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (epoch, rest) = match s.split_once(':') {
            Some((e, r)) if !e.is_empty() => {
                let epoch = e.parse::<u64>().map_err(|err| {
                    Error::ParseError(format!("Invalid epoch in version '{}': {}", s, err))
                })?;
                (epoch, r)
            }
            Some((_, r)) => (0, r),
            None => (0, s),
        };

        // pkgver never contains '-', so the release starts after the last one
        let (pkgver, pkgrel) = match rest.rsplit_once('-') {
            Some((v, r)) => (v.to_string(), Some(r.to_string())),
            None => (rest.to_string(), None),
        };

        if pkgver.is_empty() {
            return Err(Error::ParseError(format!(
                "Empty version component in '{}'",
                s
            )));
        }

        Ok(Self {
            epoch,
            pkgver,
            pkgrel,
        })
    }

    /// Compare two versions
    ///
    /// The release is only compared when both sides carry one, so a
    /// constraint like `=1.0` matches `1.0-3`.
    pub fn compare(&self, other: &Version) -> Ordering {
        match self.epoch.cmp(&other.epoch) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match segment_cmp(&self.pkgver, &other.pkgver) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match (&self.pkgrel, &other.pkgrel) {
            (Some(a), Some(b)) => segment_cmp(a, b),
            _ => Ordering::Equal,
        }
    }

    /// Whether `self` is strictly newer than `other`
    pub fn is_newer_than(&self, other: &Version) -> bool {
        self.compare(other) == Ordering::Greater
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch > 0 {
            write!(f, "{}:", self.epoch)?;
        }
        write!(f, "{}", self.pkgver)?;
        if let Some(ref rel) = self.pkgrel {
            write!(f, "-{}", rel)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Version::parse(&value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

/// Compare two version strings without parsing epoch or release
///
/// Convenience for callers holding raw strings from a remote index.
pub fn vercmp(a: &str, b: &str) -> Result<Ordering> {
    Ok(Version::parse(a)?.compare(&Version::parse(b)?))
}

/// Segment-wise comparison of a single version component
fn segment_cmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);

    while i < a.len() && j < b.len() {
        let (seg_a, seg_b) = (i, j);

        while i < a.len() && !a[i].is_ascii_alphanumeric() {
            i += 1;
        }
        while j < b.len() && !b[j].is_ascii_alphanumeric() {
            j += 1;
        }

        if i >= a.len() || j >= b.len() {
            break;
        }

        // Different separator lengths decide the comparison
        if i - seg_a != j - seg_b {
            return (i - seg_a).cmp(&(j - seg_b));
        }

        let numeric = a[i].is_ascii_digit();
        let (start_a, start_b) = (i, j);
        if numeric {
            while i < a.len() && a[i].is_ascii_digit() {
                i += 1;
            }
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
        } else {
            while i < a.len() && a[i].is_ascii_alphabetic() {
                i += 1;
            }
            while j < b.len() && b[j].is_ascii_alphabetic() {
                j += 1;
            }
        }

        let part_a = &a[start_a..i];
        let part_b = &b[start_b..j];

        // Segment types differ: numeric is newer than alphabetic
        if part_b.is_empty() {
            return if numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let ord = if numeric {
            let trimmed_a = trim_leading_zeros(part_a);
            let trimmed_b = trim_leading_zeros(part_b);
            trimmed_a
                .len()
                .cmp(&trimmed_b.len())
                .then_with(|| trimmed_a.cmp(trimmed_b))
        } else {
            part_a.cmp(part_b)
        };

        if ord != Ordering::Equal {
            return ord;
        }
    }

    let rest_a = &a[i.min(a.len())..];
    let rest_b = &b[j.min(b.len())..];

    if rest_a.is_empty() && rest_b.is_empty() {
        return Ordering::Equal;
    }

    // A remaining alphabetic tail never beats an empty string
    let b_alpha = rest_b.first().is_some_and(|c| c.is_ascii_alphabetic());
    let a_alpha = rest_a.first().is_some_and(|c| c.is_ascii_alphabetic());
    if (rest_a.is_empty() && !b_alpha) || a_alpha {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

fn trim_leading_zeros(s: &[u8]) -> &[u8] {
    let first = s.iter().position(|&c| c != b'0').unwrap_or(s.len());
    &s[first..]
}

/// Version constraint operators
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionConstraint {
    /// Any version is acceptable
    Any,
    /// Exact version match
    Exact(Version),
    /// Greater than
    GreaterThan(Version),
    /// Greater than or equal
    GreaterOrEqual(Version),
    /// Less than
    LessThan(Version),
    /// Less than or equal
    LessOrEqual(Version),
}

impl VersionConstraint {
    /// Check if a version satisfies this constraint
    pub fn satisfies(&self, version: &Version) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Exact(v) => version.compare(v) == Ordering::Equal,
            VersionConstraint::GreaterThan(v) => version.compare(v) == Ordering::Greater,
            VersionConstraint::GreaterOrEqual(v) => version.compare(v) != Ordering::Less,
            VersionConstraint::LessThan(v) => version.compare(v) == Ordering::Less,
            VersionConstraint::LessOrEqual(v) => version.compare(v) != Ordering::Greater,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, VersionConstraint::Any)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => Ok(()),
            VersionConstraint::Exact(v) => write!(f, "={}", v),
            VersionConstraint::GreaterThan(v) => write!(f, ">{}", v),
            VersionConstraint::GreaterOrEqual(v) => write!(f, ">={}", v),
            VersionConstraint::LessThan(v) => write!(f, "<{}", v),
            VersionConstraint::LessOrEqual(v) => write!(f, "<={}", v),
        }
    }
}

/// A package relation: a name with an optional version constraint
///
/// Used for `depends`, `conflicts`, `replaces` and `provides` alike. For
/// `provides` entries only the exact form (`name=version`) is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dependency {
    pub name: String,
    pub constraint: VersionConstraint,
}

impl Dependency {
    /// Parse a relation string such as `glibc`, `openssl>=3.0` or `sh=5.2`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let Some(op_start) = s.find(['<', '>', '=']) else {
            if s.is_empty() {
                return Err(Error::ParseError("Empty dependency".to_string()));
            }
            return Ok(Self::any(s));
        };

        let name = s[..op_start].trim();
        if name.is_empty() {
            return Err(Error::ParseError(format!(
                "Dependency '{}' has no package name",
                s
            )));
        }

        let rest = &s[op_start..];
        let constraint = if let Some(v) = rest.strip_prefix(">=") {
            VersionConstraint::GreaterOrEqual(Version::parse(v)?)
        } else if let Some(v) = rest.strip_prefix("<=") {
            VersionConstraint::LessOrEqual(Version::parse(v)?)
        } else if let Some(v) = rest.strip_prefix('>') {
            VersionConstraint::GreaterThan(Version::parse(v)?)
        } else if let Some(v) = rest.strip_prefix('<') {
            VersionConstraint::LessThan(Version::parse(v)?)
        } else if let Some(v) = rest.strip_prefix('=') {
            VersionConstraint::Exact(Version::parse(v)?)
        } else {
            return Err(Error::ParseError(format!("Bad operator in '{}'", s)));
        };

        Ok(Self {
            name: name.to_string(),
            constraint,
        })
    }

    /// A dependency on any version of `name`
    pub fn any(name: &str) -> Self {
        Self {
            name: name.to_string(),
            constraint: VersionConstraint::Any,
        }
    }

    /// The version this entry pins, if it is an exact (`provides`-style) entry
    pub fn exact_version(&self) -> Option<&Version> {
        match &self.constraint {
            VersionConstraint::Exact(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.constraint)
    }
}

impl TryFrom<String> for Dependency {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Dependency::parse(&value)
    }
}

impl From<Dependency> for String {
    fn from(value: Dependency) -> Self {
        value.to_string()
    }
}
