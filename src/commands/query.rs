// src/commands/query.rs
//! Dry-run resolution

use super::session::load_catalog;
use anyhow::Result;
use pkgwarden::config::Config;
use pkgwarden::resolver::{ConflictResolver, DesiredStateSet, FirstCandidate};
use pkgwarden::updates::UpdateChecker;

/// Print what a request would change, without contacting the worker
///
/// Provider questions take the first candidate and are listed.
pub fn cmd_resolve(
    config: &Config,
    packages: &[String],
    remove: &[String],
    sysupgrade: bool,
) -> Result<()> {
    let catalog = load_catalog(config)?;
    let policy = config.resolver_policy()?;
    let resolver = ConflictResolver::new(&catalog, &policy);

    let mut desired = DesiredStateSet::new();
    desired.to_add.extend(packages.iter().cloned());
    desired.to_remove.extend(remove.iter().cloned());

    let result = if sysupgrade {
        let updates = UpdateChecker::new(&catalog)
            .with_ignored(config.options.ignore_pkg.iter().cloned())
            .compute_updates();
        resolver.resolve_upgrade(&desired, &updates.candidates(&catalog), &mut FirstCandidate)
    } else {
        resolver.resolve(&desired, &mut FirstCandidate)
    };

    let resolution = match result {
        Ok(resolution) => resolution,
        Err(failure) => {
            for warning in &failure.warnings {
                println!("warning: {}", warning);
            }
            for error in &failure.errors {
                println!("error: {}", error);
            }
            anyhow::bail!("resolution failed");
        }
    };

    for warning in &resolution.warnings {
        println!("warning: {}", warning);
    }
    for (ambiguity, chosen) in &resolution.answered {
        println!(
            "provider for {}: {} (from {})",
            ambiguity.virtual_name,
            chosen.join(", "),
            ambiguity.candidates.join(", ")
        );
    }
    for name in &resolution.desired.to_remove {
        println!("remove  {}", name);
    }
    for pkg in resolution.packages.values() {
        let verb = if catalog.is_installed(&pkg.name) { "upgrade" } else { "install" };
        println!("{:<8}{} ({})", verb, pkg.full_name(), pkg.repo);
    }
    if resolution.desired.is_empty() {
        println!("Nothing to do.");
    }
    Ok(())
}
