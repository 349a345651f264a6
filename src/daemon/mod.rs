// src/daemon/mod.rs

//! The privileged worker
//!
//! The worker owns the package engine and is the only process that mutates
//! the package database. Unprivileged clients plan against their own catalog
//! snapshot and drive the worker over a Unix socket:
//!
//! ```text
//! client                                   worker
//!   │                                        │ holds pid_file
//!   ├─ Init / Add / Remove / Load ──────────►│ takes lock_file
//!   ├─ Prepare ─────────────────────────────►│ engine dry run
//!   │◄──────────── ready | providers | none ─┤
//!   ├─ Commit ──────────────────────────────►│ authorization, engine thread
//!   │◄──────── Action/Percent/... signals ───┤
//!   │◄─────────────────────────── reply ─────┤ lock_file released
//! ```
//!
//! # Module Structure
//!
//! - `lock` - PID lock files for the instance and the session
//! - `auth` - Peer credentials, authorization, audit trail
//! - `protocol` - Frames on the wire
//! - `worker` - The session state machine
//! - `socket` - Listener and per-connection tasks
//! - `client` - Async client used by the CLI

pub mod auth;
pub mod client;
pub mod lock;
pub mod protocol;
pub mod socket;
pub mod worker;

pub use auth::{Action, AuditEntry, AuditLogger, AuthChecker, Authorizer, PeerCredentials, Permission};
pub use client::DaemonClient;
pub use lock::SessionLock;
pub use protocol::{AddEntry, Frame, PrepareReply, RemoveEntry, Request, Response};
pub use worker::{Caller, SessionState, TransactionProtocol, WorkerSettings};

use crate::config::Config;
use crate::updates::RemoteIndex;
use crate::{Error, Result};
use std::sync::Arc;

/// Authorization policy from the `[daemon]` section
pub fn auth_checker(config: &Config) -> AuthChecker {
    let mut checker = AuthChecker::new();
    if !config.daemon.require_polkit {
        checker = checker.disable_polkit();
    }
    for gid in &config.daemon.trusted_gids {
        checker = checker.add_trusted_gid(*gid);
    }
    checker
}

/// Build the worker for a configuration
pub fn build_protocol(config: &Config) -> Result<TransactionProtocol> {
    let engine = Arc::new(config.engine()?);
    let mut protocol = TransactionProtocol::new(
        engine,
        Arc::new(auth_checker(config)),
        WorkerSettings::from_config(config),
    );
    if let Some(remote) = config.remote_index()? {
        let remote: Arc<dyn RemoteIndex> = Arc::new(remote);
        protocol = protocol.with_remote(remote);
    }
    Ok(protocol)
}

/// Whether a worker is running for this configuration
pub fn is_daemon_running(config: &Config) -> bool {
    SessionLock::is_held(&config.paths.pid_file)
}

/// Run the worker until `StopDaemon` or a shutdown signal
///
/// This:
/// 1. Takes the instance lock (`paths.pid_file`)
/// 2. Binds the Unix socket
/// 3. Serves connections until asked to stop
pub async fn run_daemon(config: Config) -> Result<()> {
    log::info!("Starting pkgwarden worker version {}", env!("CARGO_PKG_VERSION"));

    let instance = SessionLock::try_acquire(&config.paths.pid_file)?.ok_or_else(|| {
        let holder = SessionLock::holder_pid(&config.paths.pid_file)
            .map(|pid| format!(" (pid {})", pid))
            .unwrap_or_default();
        Error::ConcurrentSession(format!("another worker is already running{}", holder))
    })?;
    log::info!("Worker PID: {}", std::process::id());

    let protocol = Arc::new(build_protocol(&config)?);
    let mut shutdown = protocol.shutdown_requested();

    let mut socket_manager = socket::SocketManager::new(socket::SocketConfig::new(
        &config.paths.socket,
    ));
    socket_manager.bind()?;
    let listener = socket_manager
        .take_unix_listener()
        .ok_or_else(|| Error::IoError("Unix listener was not bound".to_string()))?;

    log::info!("Worker ready, accepting connections");

    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = socket::serve(listener, Arc::clone(&protocol)) => {}
        _ = shutdown.wait_for(|stop| *stop) => {
            log::info!("StopDaemon received");
            // Let the StopDaemon reply reach its caller
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received interrupt signal");
        }
        _ = terminate.recv() => {
            log::info!("Received termination signal");
        }
    }

    // Release a session a client left behind
    let _ = protocol.release().await;
    log::info!("Worker shutting down");
    drop(socket_manager);
    drop(instance);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_checker_from_config() {
        let config = Config::parse(
            "[daemon]\nrequire_polkit = false\ntrusted_gids = [10]\n",
        )
        .unwrap();
        let checker = auth_checker(&config);
        let user = PeerCredentials {
            pid: 100,
            uid: 1000,
            gid: 1000,
        };
        assert!(checker.is_allowed(&user, Action::Commit));
    }

    #[test]
    fn test_default_config_denies_regular_commit() {
        let checker = auth_checker(&Config::default());
        let user = PeerCredentials {
            pid: 100,
            uid: 1000,
            gid: 1000,
        };
        assert!(!checker.is_allowed(&user, Action::Commit));
        assert!(checker.is_allowed(&user, Action::Plan));
    }
}
