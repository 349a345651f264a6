// src/cli/mod.rs
//! CLI definitions for pkgwarden
//!
//! This module contains the command-line interface definitions using clap.
//! The command implementations are in the `commands` module.
//!
//! - `daemon` - Run the privileged worker
//! - `install` / `remove` / `load` / `upgrade` - Plan and commit a transaction
//! - `updates` - List available updates
//! - `refresh` - Refresh the repository databases
//! - `resolve` - Dry-run resolution against the local catalog
//! - `stop` - Stop a running worker

use clap::{Parser, Subcommand};
use pkgwarden::config::DEFAULT_CONFIG_PATH;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pkgwarden")]
#[command(version)]
#[command(about = "Privilege-separated package transactions", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the privileged worker
    Daemon,

    /// Install or upgrade packages
    Install {
        /// Package names or virtual names
        #[arg(required = true)]
        packages: Vec<String>,

        /// Skip packages already installed at the candidate version
        #[arg(long)]
        needed: bool,

        /// Download packages without installing them
        #[arg(long)]
        download_only: bool,

        /// Do not ask for confirmation; pick the first provider
        #[arg(short = 'y', long)]
        noconfirm: bool,
    },

    /// Remove installed packages and what depends on them
    Remove {
        #[arg(required = true)]
        packages: Vec<String>,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        noconfirm: bool,
    },

    /// Install package files
    Load {
        /// Package manifest paths
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        noconfirm: bool,
    },

    /// Upgrade every package with a newer candidate
    Upgrade {
        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        noconfirm: bool,
    },

    /// List available updates
    Updates {
        /// Ask the worker instead of reading the local catalog
        #[arg(long)]
        remote: bool,
    },

    /// Refresh the repository databases
    Refresh {
        /// Refresh even if the databases look current
        #[arg(short, long)]
        force: bool,
    },

    /// Show what a request would change, without contacting the worker
    Resolve {
        /// Packages to add
        packages: Vec<String>,

        /// Packages to remove
        #[arg(short, long)]
        remove: Vec<String>,

        /// Resolve as a full system upgrade
        #[arg(long)]
        sysupgrade: bool,
    },

    /// Stop the running worker
    Stop,
}
