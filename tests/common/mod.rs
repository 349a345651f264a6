// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use pkgwarden::catalog::{DirectorySource, PackageCatalog};
use pkgwarden::daemon::{
    Action, AuthChecker, Authorizer, DaemonClient, PeerCredentials, TransactionProtocol,
    WorkerSettings, socket,
};
use pkgwarden::engine::LocalEngine;
use pkgwarden::resolver::{CouplingRule, ResolverPolicy};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::UnixListener;

/// Installed packages of the standard fixture.
pub const INSTALLED: &str = r#"
[[package]]
name = "foo"
version = "1.0-1"

[[package]]
name = "glibc"
version = "2.39-1"

[[package]]
name = "kernel42"
version = "4.2-1"

[[package]]
name = "kernel42-extra-modules"
version = "4.2-1"
depends = ["kernel42"]

[[package]]
name = "oldtool"
version = "1.0-1"

[[package]]
name = "cron"
version = "1.0-1"

[[package]]
name = "mailer"
version = "1.0-1"

[[package]]
name = "reporter"
version = "1.0-1"
depends = ["mailer"]
"#;

/// Repository `core` of the standard fixture.
pub const CORE: &str = r#"
[[package]]
name = "foo"
version = "2.0-1"
download_size = 4096

[[package]]
name = "glibc"
version = "2.39-1"

[[package]]
name = "kernel43"
version = "4.3-1"
download_size = 100000

[[package]]
name = "kernel43-extra-modules"
version = "4.3-1"
depends = ["kernel43"]

[[package]]
name = "newtool"
version = "2.0-1"
replaces = ["oldtool"]
conflicts = ["oldtool"]

[[package]]
name = "x"
version = "1.0-1"
conflicts = ["y"]

[[package]]
name = "y"
version = "1.0-1"
conflicts = ["x"]

[[package]]
name = "z"
version = "1.0-1"

[[package]]
name = "chrony"
version = "4.5-1"
conflicts = ["cron"]

[[package]]
name = "postfix"
version = "3.9-1"
conflicts = ["mailer"]
"#;

/// A catalog directory with the standard fixture.
pub struct CatalogFixture {
    pub temp_dir: TempDir,
    pub source: DirectorySource,
}

impl CatalogFixture {
    pub fn new() -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = temp_dir.path().join("db");
        fs::create_dir_all(db.join("local")).unwrap();
        fs::create_dir_all(db.join("sync")).unwrap();
        let source = DirectorySource::new(&db, vec!["core".to_string()]);
        fs::write(source.installed_path(), INSTALLED).unwrap();
        fs::write(source.repository_path("core"), CORE).unwrap();
        Self { temp_dir, source }
    }

    pub fn catalog(&self) -> PackageCatalog {
        PackageCatalog::load(&self.source).unwrap()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }
}

/// Resolver policy holding `glibc`, with `kernel` as the coupling prefix.
pub fn policy() -> ResolverPolicy {
    ResolverPolicy {
        held: BTreeSet::from(["glibc".to_string()]),
        coupling: CouplingRule::new(&["kernel".to_string()]).unwrap(),
    }
}

/// Authorizer refusing everything.
pub struct DenyAll;

#[async_trait]
impl Authorizer for DenyAll {
    async fn authorize(&self, _creds: &PeerCredentials, _action: Action) -> pkgwarden::Result<bool> {
        Ok(false)
    }
}

/// A worker serving the fixture on a Unix socket.
pub struct WorkerFixture {
    pub catalog: CatalogFixture,
    pub socket_path: PathBuf,
    pub history_path: PathBuf,
    pub lock_path: PathBuf,
}

impl WorkerFixture {
    /// Worker that authorizes every caller.
    pub fn start() -> Self {
        Self::start_with(Arc::new(AuthChecker::new().disable_polkit()))
    }

    pub fn start_with(authorizer: Arc<dyn Authorizer>) -> Self {
        let catalog = CatalogFixture::new();
        let socket_path = catalog.path("worker.sock");
        let history_path = catalog.path("pkgwarden.log");
        let lock_path = catalog.path("db.lck");

        let engine = LocalEngine::new(catalog.source.clone(), policy());
        let settings = WorkerSettings::new(&lock_path).with_history(&history_path);
        let worker = Arc::new(TransactionProtocol::new(Arc::new(engine), authorizer, settings));

        let listener = UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(socket::serve(listener, worker));

        Self {
            catalog,
            socket_path,
            history_path,
            lock_path,
        }
    }

    pub async fn client(&self) -> DaemonClient {
        DaemonClient::connect(&self.socket_path).await.unwrap()
    }

    pub fn history(&self) -> String {
        fs::read_to_string(&self.history_path).unwrap_or_default()
    }
}
