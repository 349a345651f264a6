// src/commands/mod.rs
//! Command handlers for the pkgwarden CLI

mod install;
pub mod progress;
mod query;
mod remove;
mod session;
mod system;
mod update;

// Re-export all command handlers
pub use install::{cmd_install, cmd_load};
pub use query::cmd_resolve;
pub use remove::cmd_remove;
pub use system::{cmd_daemon, cmd_stop};
pub use update::{cmd_refresh, cmd_updates, cmd_upgrade};
