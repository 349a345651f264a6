// src/lib.rs

//! pkgwarden
//!
//! Plans package-state changes in an unprivileged client and applies them
//! through a privileged worker that alone owns the package database.
//!
//! # Architecture
//!
//! - `catalog` / `version`: read-only package snapshots and version rules
//! - `resolver`: expands a requested change set to a consistent closure
//! - `updates`: finds installed packages with newer candidates
//! - `engine`: the package engine boundary the worker drives
//! - `daemon`: the worker, its socket protocol, locks and authorization
//! - `transaction`: the client side of one locked session
//! - `progress`: engine events translated into client signals

pub mod catalog;
pub mod config;
pub mod daemon;
pub mod engine;
mod error;
pub mod history;
pub mod progress;
pub mod resolver;
pub mod transaction;
pub mod updates;
pub mod version;

pub use catalog::{PackageCatalog, PackageRef};
pub use error::{Error, Result};
pub use resolver::{ConflictResolver, DesiredStateSet, Resolution, ResolverPolicy};
pub use transaction::{SessionOutcome, TransactionSession, TransactionSummary};
