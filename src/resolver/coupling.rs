// src/resolver/coupling.rs

//! Kernel and kernel-module naming convention
//!
//! Kernel packages are named `<prefix><2-3 digits>` (`linux61`), and packages
//! built against one kernel append a suffix (`linux61-nvidia`,
//! `linux61-extra-modules`). The kernel part is the coupling key that ties a
//! module package to its kernel.

use crate::error::{Error, Result};
use crate::version::Dependency;
use regex::Regex;

/// Marker that flags a dependency as belonging to the coupling convention
const MODULES_MARKER: &str = "-modules";

/// A package name split by the coupling convention
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouplingKey {
    /// Kernel part, e.g. `linux61`
    pub kernel: String,
    /// Everything after the kernel part; empty for the kernel itself
    pub suffix: String,
}

impl CouplingKey {
    pub fn is_kernel(&self) -> bool {
        self.suffix.is_empty()
    }

    /// Module packages are installed for every kernel
    pub fn is_module(&self) -> bool {
        self.suffix.ends_with(MODULES_MARKER)
    }
}

/// Matches package names against configured kernel prefixes
#[derive(Debug, Clone)]
pub struct CouplingRule {
    pattern: Regex,
}

impl CouplingRule {
    /// Build a rule from kernel family prefixes such as `linux`
    pub fn new(prefixes: &[String]) -> Result<Self> {
        if prefixes.is_empty() {
            return Err(Error::ConfigError(
                "coupling rule needs at least one prefix".to_string(),
            ));
        }
        let alternatives: Vec<String> = prefixes.iter().map(|p| regex::escape(p)).collect();
        let pattern = Regex::new(&format!(
            "^((?:{})[0-9]{{2,3}})(.*)$",
            alternatives.join("|")
        ))
        .map_err(|e| Error::ConfigError(format!("invalid coupling prefix: {}", e)))?;

        Ok(Self { pattern })
    }

    /// Split a package name into its coupling key
    pub fn key(&self, name: &str) -> Option<CouplingKey> {
        let caps = self.pattern.captures(name)?;
        Some(CouplingKey {
            kernel: caps.get(1)?.as_str().to_string(),
            suffix: caps.get(2).map(|m| m.as_str()).unwrap_or_default().to_string(),
        })
    }

    /// Whether a dependency names a kernel-bound package or a module
    /// provision
    pub fn is_marked(&self, dep: &Dependency) -> bool {
        dep.name.ends_with(MODULES_MARKER) || self.pattern.is_match(&dep.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> CouplingRule {
        CouplingRule::new(&["linux".to_string(), "kernel".to_string()]).unwrap()
    }

    #[test]
    fn test_kernel_key() {
        let key = rule().key("linux61").unwrap();
        assert_eq!(key.kernel, "linux61");
        assert!(key.is_kernel());
    }

    #[test]
    fn test_module_key() {
        let key = rule().key("kernel42-extra-modules").unwrap();
        assert_eq!(key.kernel, "kernel42");
        assert_eq!(key.suffix, "-extra-modules");
        assert!(key.is_module());

        let key = rule().key("linux61-headers").unwrap();
        assert!(!key.is_kernel());
        assert!(!key.is_module());
    }

    #[test]
    fn test_non_matching_names() {
        assert!(rule().key("linux-firmware").is_none());
        assert!(rule().key("firefox").is_none());
        assert!(rule().key("linux6").is_none());
    }

    #[test]
    fn test_marker() {
        let rule = rule();
        assert!(rule.is_marked(&Dependency::any("nvidia-modules")));
        assert!(rule.is_marked(&Dependency::any("linux61-headers")));
        assert!(rule.is_marked(&Dependency::any("kernel42")));
        assert!(!rule.is_marked(&Dependency::any("glibc")));
        assert!(!rule.is_marked(&Dependency::any("util-linux")));
        assert!(!rule.is_marked(&Dependency::any("linux-firmware")));
        assert!(!rule.is_marked(&Dependency::any("linux-api-headers")));
    }

    #[test]
    fn test_empty_prefixes_rejected() {
        assert!(CouplingRule::new(&[]).is_err());
    }
}
