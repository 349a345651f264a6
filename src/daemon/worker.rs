// src/daemon/worker.rs

//! The privileged transaction protocol
//!
//! One [`TransactionProtocol`] owns the package engine and the single
//! system-wide session:
//!
//! ```text
//!            Init                       Prepare (ready)
//!   Idle ──────────► Accumulating ────────────────────► Prepared
//!    ▲                 │   ▲   Add/Remove/Load            │
//!    │                 │   └──── Prepare (providers)      │ Commit
//!    │   Release,      │                                  ▼
//!    └── error, ───────┴──────────────────────────── Committing
//!        nothing to do                 completion, Interrupt
//! ```
//!
//! `Refresh` runs through the same machinery as `Commit` in a
//! `Refreshing` state. Engine work runs on a blocking thread; the calling
//! task pumps its events through a [`ProgressTranslator`], the history log
//! and the signal broadcast until the thread finishes or is abandoned.
//!
//! Every error returned while a session is being planned releases it. A
//! commit releases the session itself when it completes, whatever the
//! outcome.

use super::auth::{Action, AuditEntry, AuditLogger, Authorizer, PeerCredentials};
use super::lock::SessionLock;
use super::protocol::{AddEntry, PrepareReply, RemoveEntry, Request, Response};
use crate::catalog::PackageCatalog;
use crate::config::Config;
use crate::engine::{EnginePlan, EventSink, PackageEngine, PendingSet, PrepareOutcome, TransactionFlags};
use crate::error::{Error, Result};
use crate::history::HistoryLog;
use crate::progress::{EngineEvent, ProgressTranslator, Signal};
use crate::updates::{RemoteIndex, UpdateChecker, UpdateSet};
use crate::version::Dependency;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Capacity of the signal broadcast; slow clients skip what they missed
const SIGNAL_CAPACITY: usize = 1024;

/// Worker settings taken from the configuration
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Database lock shared with other package tools
    pub lock_path: PathBuf,
    /// Operation log; `None` disables it
    pub history: Option<HistoryLog>,
    pub interrupt_grace: Duration,
    pub forward_debug: bool,
    pub sync_first: Vec<String>,
    pub ignored: Vec<String>,
}

impl WorkerSettings {
    pub fn new<P: Into<PathBuf>>(lock_path: P) -> Self {
        Self {
            lock_path: lock_path.into(),
            history: None,
            interrupt_grace: Duration::from_millis(3000),
            forward_debug: false,
            sync_first: Vec::new(),
            ignored: Vec::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_path: config.paths.lock_file.clone(),
            history: Some(HistoryLog::new(&config.paths.log_file)),
            interrupt_grace: config.interrupt_grace(),
            forward_debug: config.daemon.forward_debug,
            sync_first: config.options.sync_first.clone(),
            ignored: config.options.ignore_pkg.clone(),
        }
    }

    pub fn with_history<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.history = Some(HistoryLog::new(path));
        self
    }

    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }
}

/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    Accumulating,
    Prepared,
    Committing,
    Refreshing,
}

impl SessionState {
    /// States an error releases from
    fn is_planning(self) -> bool {
        matches!(
            self,
            SessionState::Initializing | SessionState::Accumulating | SessionState::Prepared
        )
    }

    fn is_running(self) -> bool {
        matches!(self, SessionState::Committing | SessionState::Refreshing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Accumulating => "accumulating",
            SessionState::Prepared => "prepared",
            SessionState::Committing => "committing",
            SessionState::Refreshing => "refreshing",
        };
        f.write_str(name)
    }
}

/// The connection a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub connection: u64,
    pub credentials: PeerCredentials,
}

/// Handles the session keeps on a running engine thread
struct RunningJob {
    generation: u64,
    cancel: Arc<AtomicBool>,
    finished: watch::Receiver<bool>,
    abandon: Arc<Notify>,
}

/// What the task driving a job needs
struct JobHandle {
    generation: u64,
    task: JoinHandle<Result<()>>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    abandon: Arc<Notify>,
    finished: watch::Sender<bool>,
}

struct Session {
    state: SessionState,
    flags: TransactionFlags,
    pending: PendingSet,
    catalog: Option<PackageCatalog>,
    plan: Option<EnginePlan>,
    lock: Option<SessionLock>,
    owner: Option<u64>,
    job: Option<RunningJob>,
    generation: u64,
    /// Identifies the session in log lines
    id: Option<Uuid>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            flags: TransactionFlags::default(),
            pending: PendingSet::default(),
            catalog: None,
            plan: None,
            lock: None,
            owner: None,
            job: None,
            generation: 0,
            id: None,
        }
    }

    /// Back to `Idle`, dropping the database lock
    fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.flags = TransactionFlags::default();
        self.pending = PendingSet::default();
        self.catalog = None;
        self.plan = None;
        self.owner = None;
        self.job = None;
        self.lock = None;
        if let Some(id) = self.id.take() {
            log::debug!("Session {} closed", id);
        }
    }

    /// Release a session being planned before handing back `err`
    fn fail(&mut self, err: Error) -> Error {
        if self.state.is_planning() {
            log::info!("Releasing session after error: {}", err);
            self.reset();
        }
        err
    }

    fn invalid_state(&mut self, operation: &'static str) -> Error {
        let err = Error::InvalidState {
            operation,
            state: self.state.to_string(),
        };
        self.fail(err)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.job.as_ref().is_some_and(|job| job.generation == generation)
    }
}

/// The worker's RPC surface
pub struct TransactionProtocol {
    engine: Arc<dyn PackageEngine>,
    authorizer: Arc<dyn Authorizer>,
    remote: Option<Arc<dyn RemoteIndex>>,
    settings: WorkerSettings,
    session: Mutex<Session>,
    audit: Mutex<AuditLogger>,
    signals: broadcast::Sender<Signal>,
    shutdown: watch::Sender<bool>,
}

impl TransactionProtocol {
    pub fn new(
        engine: Arc<dyn PackageEngine>,
        authorizer: Arc<dyn Authorizer>,
        settings: WorkerSettings,
    ) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            authorizer,
            remote: None,
            settings,
            session: Mutex::new(Session::new()),
            audit: Mutex::new(AuditLogger::new()),
            signals,
            shutdown,
        }
    }

    /// Consult an out-of-band index for foreign packages in `CheckUpdates`
    pub fn with_remote(mut self, remote: Arc<dyn RemoteIndex>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    /// Flips to `true` once `StopDaemon` succeeded
    pub fn shutdown_requested(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.session.lock().await.state
    }

    pub async fn recent_audit(&self, count: usize) -> Vec<AuditEntry> {
        self.audit.lock().await.recent_entries(count).to_vec()
    }

    /// Dispatch one request
    pub async fn handle(&self, caller: &Caller, request: Request) -> Response {
        log::debug!(
            "{} from uid {} (connection {})",
            request.method(),
            caller.credentials.uid,
            caller.connection
        );
        match request {
            Request::Init { options } => Response::from_result(self.init(caller, &options).await),
            Request::Add { name } => Response::from_result(self.add(&name).await),
            Request::Remove { name } => Response::from_result(self.remove(&name).await),
            Request::Load { path } => Response::from_result(self.load(&path).await),
            Request::Prepare => match self.prepare().await {
                Ok(reply) => Response::Prepared(reply),
                Err(e) => Response::error(&e),
            },
            Request::ToAdd => Response::ToAdd {
                packages: self.to_add().await,
            },
            Request::ToRemove => Response::ToRemove {
                packages: self.to_remove().await,
            },
            Request::Commit => Response::from_result(self.commit(caller).await),
            Request::Interrupt => Response::from_result(self.interrupt().await),
            Request::Release => Response::from_result(self.release().await),
            Request::StopDaemon => Response::from_result(self.stop(caller).await),
            Request::Refresh { force } => Response::from_result(self.refresh(caller, force).await),
            Request::CheckUpdates => match self.check_updates().await {
                Ok(updates) => Response::Updates(updates),
                Err(e) => Response::error(&e),
            },
        }
    }

    /// Lock the database and start accumulating targets
    pub async fn init(&self, caller: &Caller, options: &BTreeMap<String, bool>) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.state != SessionState::Idle {
            return Err(Error::ConcurrentSession(format!(
                "a transaction is already {}",
                session.state
            )));
        }

        session.lock = Some(self.take_database_lock()?);
        session.state = SessionState::Initializing;
        session.owner = Some(caller.connection);
        session.flags = TransactionFlags::from_options(options);
        let id = Uuid::new_v4();
        session.id = Some(id);

        match self.load_catalog().await {
            Ok(catalog) => {
                session.catalog = Some(catalog);
                session.state = SessionState::Accumulating;
                log::info!(
                    "Session {} initialized for uid {} ({:?})",
                    id,
                    caller.credentials.uid,
                    session.flags
                );
                Ok(())
            }
            Err(e) => Err(session.fail(e)),
        }
    }

    pub async fn add(&self, name: &str) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.state != SessionState::Accumulating {
            return Err(session.invalid_state("Add"));
        }
        let known = session.catalog.as_ref().is_some_and(|catalog| {
            catalog.find_sync(name).is_some()
                || !catalog.sync_providers(&Dependency::any(name)).is_empty()
        });
        if !known {
            return Err(session.fail(Error::InvalidTarget(name.to_string())));
        }
        session.pending.add.insert(name.to_string());
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.state != SessionState::Accumulating {
            return Err(session.invalid_state("Remove"));
        }
        let installed = session
            .catalog
            .as_ref()
            .is_some_and(|catalog| catalog.is_installed(name));
        if !installed {
            return Err(session.fail(Error::InvalidTarget(name.to_string())));
        }
        session.pending.remove.insert(name.to_string());
        Ok(())
    }

    pub async fn load(&self, path: &Path) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.state != SessionState::Accumulating {
            return Err(session.invalid_state("Load"));
        }

        let engine = Arc::clone(&self.engine);
        let owned = path.to_path_buf();
        let loaded = tokio::task::spawn_blocking(move || engine.load_package(&owned))
            .await
            .map_err(|e| Error::Engine(format!("load task failed: {}", e)))
            .and_then(|result| result);

        match loaded {
            Ok(pkg) => {
                log::debug!("Loaded {} from {}", pkg.full_name(), path.display());
                session.pending.load.insert(path.to_path_buf());
                Ok(())
            }
            Err(e) => {
                log::warn!("Cannot load {}: {}", path.display(), e);
                Err(session.fail(Error::InvalidTarget(path.display().to_string())))
            }
        }
    }

    /// Dry-run the accumulated targets through the engine
    pub async fn prepare(&self) -> Result<PrepareReply> {
        let mut session = self.session.lock().await;
        if session.state != SessionState::Accumulating {
            return Err(session.invalid_state("Prepare"));
        }

        let pending = session.pending.clone();
        let flags = session.flags;
        let engine = Arc::clone(&self.engine);
        let (tx, mut events) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        let result = tokio::task::spawn_blocking(move || engine.prepare(&pending, flags, &sink))
            .await
            .map_err(|e| Error::Engine(format!("prepare task failed: {}", e)))
            .and_then(|result| result);

        // The sink went away with the closure; everything is queued
        let mut translator = ProgressTranslator::new(self.settings.forward_debug);
        while let Ok(event) = events.try_recv() {
            self.forward(&mut translator, &event);
        }
        if let Some(signal) = translator.flush_warnings() {
            self.broadcast(signal);
        }

        match result {
            Ok(PrepareOutcome::Ready(plan)) => {
                log::info!(
                    "Prepared {} to add, {} to remove",
                    plan.to_add.len(),
                    plan.to_remove.len()
                );
                let reply = PrepareReply::from(&plan);
                session.plan = Some(plan);
                session.state = SessionState::Prepared;
                Ok(reply)
            }
            Ok(PrepareOutcome::NothingToDo) => {
                log::info!("Nothing to do");
                session.reset();
                Ok(PrepareReply::NothingToDo)
            }
            Ok(outcome @ PrepareOutcome::Providers(_)) => Ok(PrepareReply::from(&outcome)),
            Err(e) => Err(session.fail(e)),
        }
    }

    pub async fn to_add(&self) -> Vec<AddEntry> {
        let session = self.session.lock().await;
        session
            .plan
            .as_ref()
            .map(|plan| plan.to_add.iter().map(AddEntry::from).collect())
            .unwrap_or_default()
    }

    pub async fn to_remove(&self) -> Vec<RemoveEntry> {
        let session = self.session.lock().await;
        session
            .plan
            .as_ref()
            .map(|plan| plan.to_remove.iter().map(RemoveEntry::from).collect())
            .unwrap_or_default()
    }

    /// Apply the prepared plan; resolves when the engine is done
    pub async fn commit(&self, caller: &Caller) -> Result<()> {
        {
            let mut session = self.session.lock().await;
            if session.state != SessionState::Prepared {
                return Err(session.invalid_state("Commit"));
            }
        }

        // PolicyKit may wait on the user; keep the session unlocked meanwhile
        let allowed = self.authorize(caller, Action::Commit).await;

        let mut session = self.session.lock().await;
        if session.state != SessionState::Prepared {
            return Err(session.invalid_state("Commit"));
        }
        if !allowed {
            session.reset();
            return Err(Error::Authorization(
                "not authorized to commit transactions".to_string(),
            ));
        }
        let Some(plan) = session.plan.take() else {
            return Err(session.fail(Error::Engine("no prepared plan".to_string())));
        };

        let job = self.start_job(&mut session, SessionState::Committing, move |engine, sink, cancel| {
            engine.commit(&plan, sink, cancel)
        });
        drop(session);
        self.run_job(job, "Transaction successfully finished").await
    }

    /// Ask the running commit or refresh to stop
    ///
    /// Waits up to the grace period for the engine to honor the request,
    /// then abandons its thread and releases the session regardless.
    pub async fn interrupt(&self) -> Result<()> {
        let (generation, mut finished, abandon) = {
            let session = self.session.lock().await;
            match (&session.job, session.state.is_running()) {
                (Some(job), true) => {
                    job.cancel.store(true, Ordering::SeqCst);
                    (job.generation, job.finished.clone(), Arc::clone(&job.abandon))
                }
                _ => {
                    return Err(Error::InvalidState {
                        operation: "Interrupt",
                        state: session.state.to_string(),
                    });
                }
            }
        };
        log::info!("Interrupt requested");

        let grace = self.settings.interrupt_grace;
        if tokio::time::timeout(grace, finished.wait_for(|done| *done))
            .await
            .is_err()
        {
            log::warn!(
                "Engine ignored the interrupt for {:?}, abandoning it",
                grace
            );
            abandon.notify_one();
            let mut session = self.session.lock().await;
            if session.is_current(generation) {
                session.reset();
            }
        }
        Ok(())
    }

    /// Drop the session; always succeeds
    pub async fn release(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        match session.state {
            SessionState::Idle => log::debug!("Release with no session"),
            state if state.is_running() => {
                log::debug!("Release ignored while {}; completion releases", state)
            }
            _ => {
                log::info!("Session released");
                session.reset();
            }
        }
        Ok(())
    }

    /// Re-read every sync repository
    pub async fn refresh(&self, caller: &Caller, force: bool) -> Result<()> {
        if !self.authorize(caller, Action::Refresh).await {
            return Err(Error::Authorization(
                "not authorized to refresh databases".to_string(),
            ));
        }

        let mut session = self.session.lock().await;
        if session.state != SessionState::Idle {
            return Err(Error::ConcurrentSession(format!(
                "a transaction is already {}",
                session.state
            )));
        }
        session.lock = Some(self.take_database_lock()?);
        session.owner = Some(caller.connection);

        let job = self.start_job(&mut session, SessionState::Refreshing, move |engine, sink, cancel| {
            engine.refresh(force, sink, cancel)
        });
        drop(session);
        self.run_job(job, "Package databases refreshed").await
    }

    /// Compute available updates and broadcast them
    pub async fn check_updates(&self) -> Result<UpdateSet> {
        let engine = Arc::clone(&self.engine);
        let remote = self.remote.clone();
        let ignored = self.settings.ignored.clone();
        let sync_first = self.settings.sync_first.clone();

        let updates = tokio::task::spawn_blocking(move || -> Result<UpdateSet> {
            let catalog = engine.catalog()?;
            let mut checker = UpdateChecker::new(&catalog)
                .with_ignored(ignored)
                .with_sync_first(sync_first);
            if let Some(remote) = remote.as_deref() {
                checker = checker.with_remote(remote);
            }
            Ok(checker.compute_updates())
        })
        .await
        .map_err(|e| Error::Engine(format!("update check failed: {}", e)))??;

        log::info!(
            "{} update(s) available{}",
            updates.entries.len(),
            if updates.syncfirst { " (sync first)" } else { "" }
        );
        self.broadcast(Signal::AvailableUpdates(updates.clone()));
        Ok(updates)
    }

    /// Release everything and ask the accept loop to exit
    pub async fn stop(&self, caller: &Caller) -> Result<()> {
        if !self.authorize(caller, Action::Stop).await {
            return Err(Error::Authorization(
                "not authorized to stop the worker".to_string(),
            ));
        }

        let mut session = self.session.lock().await;
        if let Some(job) = &session.job {
            job.cancel.store(true, Ordering::SeqCst);
            job.abandon.notify_one();
        }
        session.reset();
        drop(session);

        log::info!("Stop requested by uid {}", caller.credentials.uid);
        let _ = self.shutdown.send(true);
        Ok(())
    }

    /// Release a session whose client went away without doing so
    pub async fn disconnect(&self, connection: u64) {
        let mut session = self.session.lock().await;
        if session.owner == Some(connection) && session.state.is_planning() {
            log::warn!(
                "Connection {} closed with a {} session, releasing it",
                connection,
                session.state
            );
            session.reset();
        }
    }

    fn take_database_lock(&self) -> Result<SessionLock> {
        let path = &self.settings.lock_path;
        SessionLock::try_acquire(path)?.ok_or_else(|| {
            let holder = SessionLock::holder_pid(path)
                .map(|pid| format!("held by process {}", pid))
                .unwrap_or_else(|| "held by another package manager".to_string());
            Error::ConcurrentSession(format!("{} is {}", path.display(), holder))
        })
    }

    async fn load_catalog(&self) -> Result<PackageCatalog> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || engine.catalog())
            .await
            .map_err(|e| Error::Engine(format!("catalog task failed: {}", e)))?
    }

    async fn authorize(&self, caller: &Caller, action: Action) -> bool {
        let allowed = match self.authorizer.authorize(&caller.credentials, action).await {
            Ok(allowed) => allowed,
            Err(e) => {
                log::warn!("Authorization check failed: {}", e);
                false
            }
        };
        self.audit
            .lock()
            .await
            .log_action(caller.credentials, action, allowed, None);
        allowed
    }

    fn start_job<F>(&self, session: &mut Session, state: SessionState, work: F) -> JobHandle
    where
        F: FnOnce(&dyn PackageEngine, &EventSink, &AtomicBool) -> Result<()> + Send + 'static,
    {
        session.generation += 1;
        let generation = session.generation;
        let cancel = Arc::new(AtomicBool::new(false));
        let abandon = Arc::new(Notify::new());
        let (finished_tx, finished_rx) = watch::channel(false);
        let (tx, events) = mpsc::unbounded_channel();

        let engine = Arc::clone(&self.engine);
        let flag = Arc::clone(&cancel);
        let task = tokio::task::spawn_blocking(move || {
            let sink = EventSink::new(tx);
            work(engine.as_ref(), &sink, &flag)
        });

        session.state = state;
        session.job = Some(RunningJob {
            generation,
            cancel,
            finished: finished_rx,
            abandon: Arc::clone(&abandon),
        });

        JobHandle {
            generation,
            task,
            events,
            abandon,
            finished: finished_tx,
        }
    }

    /// Pump a job's events until it finishes or is abandoned
    async fn run_job(&self, job: JobHandle, done_message: &str) -> Result<()> {
        let JobHandle {
            generation,
            mut task,
            mut events,
            abandon,
            finished,
        } = job;
        let mut translator = ProgressTranslator::new(self.settings.forward_debug);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.forward(&mut translator, &event),
                joined = &mut task => {
                    while let Ok(event) = events.try_recv() {
                        self.forward(&mut translator, &event);
                    }
                    break joined.unwrap_or_else(|e| {
                        Err(Error::Engine(format!("engine task failed: {}", e)))
                    });
                }
                _ = abandon.notified() => break Err(Error::Interrupted),
            }
        };
        let _ = finished.send(true);
        if let Some(signal) = translator.flush_warnings() {
            self.broadcast(signal);
        }

        {
            let mut session = self.session.lock().await;
            if session.is_current(generation) {
                session.reset();
            }
        }

        match &outcome {
            Ok(()) => {
                log::info!("{}", done_message);
                self.broadcast(Signal::TransactionDone(done_message.to_string()));
            }
            Err(e) => {
                log::warn!("Job failed: {}", e);
                self.broadcast(Signal::TransactionError(e.to_string()));
            }
        }
        outcome
    }

    fn forward(&self, translator: &mut ProgressTranslator, event: &EngineEvent) {
        if let Some(history) = &self.settings.history
            && let Err(e) = history.record(event)
        {
            log::warn!("Failed to write {}: {}", history.path().display(), e);
        }
        for signal in translator.translate(event) {
            self.broadcast(signal);
        }
    }

    fn broadcast(&self, signal: Signal) {
        // No subscribers is fine
        let _ = self.signals.send(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PackageRef, Repository};
    use crate::daemon::auth::AuthChecker;
    use crate::version::Version;
    use std::time::Instant;
    use tempfile::TempDir;

    /// Engine whose commit loops until cancelled, or ignores cancellation
    struct SlowEngine {
        honor_cancel: bool,
    }

    impl PackageEngine for SlowEngine {
        fn catalog(&self) -> Result<PackageCatalog> {
            let foo = PackageRef::new("foo", Version::parse("1.0-1").unwrap(), "core");
            Ok(PackageCatalog::new(
                Vec::new(),
                vec![Repository::new("core", vec![foo])],
            ))
        }

        fn refresh(&self, _force: bool, _events: &EventSink, _cancel: &AtomicBool) -> Result<()> {
            Ok(())
        }

        fn load_package(&self, path: &Path) -> Result<PackageRef> {
            Err(Error::InvalidTarget(path.display().to_string()))
        }

        fn prepare(
            &self,
            pending: &PendingSet,
            _flags: TransactionFlags,
            events: &EventSink,
        ) -> Result<PrepareOutcome> {
            events.emit(EngineEvent::CheckDepsStart);
            if pending.is_empty() {
                return Ok(PrepareOutcome::NothingToDo);
            }
            let foo = PackageRef::new("foo", Version::parse("1.0-1").unwrap(), "core");
            Ok(PrepareOutcome::Ready(EnginePlan {
                to_add: vec![foo],
                to_remove: Vec::new(),
                flags: TransactionFlags::default(),
            }))
        }

        fn commit(&self, _plan: &EnginePlan, _events: &EventSink, cancel: &AtomicBool) -> Result<()> {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if self.honor_cancel && cancel.load(Ordering::SeqCst) {
                    return Err(Error::Interrupted);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        }
    }

    fn root() -> Caller {
        Caller {
            connection: 1,
            credentials: PeerCredentials {
                pid: 1,
                uid: 0,
                gid: 0,
            },
        }
    }

    fn protocol(temp_dir: &TempDir, honor_cancel: bool) -> Arc<TransactionProtocol> {
        let settings = WorkerSettings::new(temp_dir.path().join("db.lck"))
            .with_interrupt_grace(Duration::from_millis(200));
        Arc::new(TransactionProtocol::new(
            Arc::new(SlowEngine { honor_cancel }),
            Arc::new(AuthChecker::new()),
            settings,
        ))
    }

    async fn prepared(worker: &TransactionProtocol) {
        worker.init(&root(), &BTreeMap::new()).await.unwrap();
        worker.add("foo").await.unwrap();
        assert!(matches!(
            worker.prepare().await.unwrap(),
            PrepareReply::Ready { .. }
        ));
    }

    #[tokio::test]
    async fn test_second_init_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let worker = protocol(&temp_dir, true);

        worker.init(&root(), &BTreeMap::new()).await.unwrap();
        let err = worker.init(&root(), &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentSession(_)));
        assert_eq!(worker.state().await, SessionState::Accumulating);
    }

    #[tokio::test]
    async fn test_external_lock_blocks_init() {
        let temp_dir = TempDir::new().unwrap();
        let worker = protocol(&temp_dir, true);
        std::fs::write(temp_dir.path().join("db.lck"), "").unwrap();

        let err = worker.init(&root(), &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentSession(_)));
        assert_eq!(worker.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_add_after_prepare_releases() {
        let temp_dir = TempDir::new().unwrap();
        let worker = protocol(&temp_dir, true);
        prepared(&worker).await;

        let err = worker.add("foo").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(worker.state().await, SessionState::Idle);
        assert!(!temp_dir.path().join("db.lck").exists());
    }

    #[tokio::test]
    async fn test_unknown_target_releases() {
        let temp_dir = TempDir::new().unwrap();
        let worker = protocol(&temp_dir, true);
        worker.init(&root(), &BTreeMap::new()).await.unwrap();

        let err = worker.add("nope").await.unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
        assert_eq!(worker.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_interrupt_outside_commit_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let worker = protocol(&temp_dir, true);
        let err = worker.interrupt().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_interrupt_honored_by_engine() {
        let temp_dir = TempDir::new().unwrap();
        let worker = protocol(&temp_dir, true);
        prepared(&worker).await;
        let mut signals = worker.subscribe();

        let committing = Arc::clone(&worker);
        let commit = tokio::spawn(async move { committing.commit(&root()).await });
        while worker.state().await != SessionState::Committing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        worker.interrupt().await.unwrap();
        assert!(matches!(commit.await.unwrap(), Err(Error::Interrupted)));
        assert_eq!(worker.state().await, SessionState::Idle);

        let mut saw_error = false;
        while let Ok(signal) = signals.try_recv() {
            if let Signal::TransactionError(message) = signal {
                assert_eq!(message, "Transaction interrupted");
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_interrupt_abandons_stuck_engine() {
        let temp_dir = TempDir::new().unwrap();
        let worker = protocol(&temp_dir, false);
        prepared(&worker).await;

        let committing = Arc::clone(&worker);
        let commit = tokio::spawn(async move { committing.commit(&root()).await });
        while worker.state().await != SessionState::Committing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = Instant::now();
        worker.interrupt().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(commit.await.unwrap(), Err(Error::Interrupted)));
        assert_eq!(worker.state().await, SessionState::Idle);
        assert!(!temp_dir.path().join("db.lck").exists());

        // A fresh session is possible right away
        worker.init(&root(), &BTreeMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_during_commit_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let worker = protocol(&temp_dir, true);
        prepared(&worker).await;

        let committing = Arc::clone(&worker);
        let commit = tokio::spawn(async move { committing.commit(&root()).await });
        while worker.state().await != SessionState::Committing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        worker.release().await.unwrap();
        assert_eq!(worker.state().await, SessionState::Committing);
        worker.interrupt().await.unwrap();
        let _ = commit.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_releases_owned_session() {
        let temp_dir = TempDir::new().unwrap();
        let worker = protocol(&temp_dir, true);
        worker.init(&root(), &BTreeMap::new()).await.unwrap();

        worker.disconnect(2).await;
        assert_eq!(worker.state().await, SessionState::Accumulating);
        worker.disconnect(1).await;
        assert_eq!(worker.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_stop_requires_authorization() {
        let temp_dir = TempDir::new().unwrap();
        let worker = protocol(&temp_dir, true);
        let user = Caller {
            connection: 3,
            credentials: PeerCredentials {
                pid: 99,
                uid: 1000,
                gid: 1000,
            },
        };

        assert!(matches!(
            worker.stop(&user).await,
            Err(Error::Authorization(_))
        ));
        let mut shutdown = worker.shutdown_requested();
        worker.stop(&root()).await.unwrap();
        assert!(*shutdown.borrow_and_update());
    }
}
