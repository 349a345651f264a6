// src/daemon/client.rs

//! Client side of the worker socket
//!
//! Every call gets its own completion channel keyed by request id, so any
//! number of calls may be in flight on one connection. Calls expected to be
//! fast are bounded by a timeout and fail with [`Error::Timeout`], which is
//! transient; `Commit`, `Refresh` and `CheckUpdates` wait as long as the
//! worker needs.
//!
//! # Example
//!
//! ```ignore
//! use pkgwarden::daemon::DaemonClient;
//!
//! let client = DaemonClient::connect("/run/pkgwarden/pkgwarden.sock").await?;
//! let mut signals = client.subscribe();
//! client.init(&Default::default()).await?;
//! client.add("foo").await?;
//! match client.prepare().await? {
//!     PrepareReply::Ready { .. } => client.commit().await?,
//!     _ => client.release().await?,
//! }
//! ```

use super::protocol::{self, AddEntry, Frame, PrepareReply, RemoveEntry, Request, Response};
use crate::error::{Error, Result};
use crate::progress::Signal;
use crate::updates::UpdateSet;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;

/// Default bound for fast calls
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type PendingCalls = Arc<StdMutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Connection to a running worker
pub struct DaemonClient {
    socket_path: PathBuf,
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingCalls,
    signals: broadcast::Sender<Signal>,
    next_id: AtomicU64,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl DaemonClient {
    /// Connect to the worker socket
    pub async fn connect<P: AsRef<Path>>(socket_path: P) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            Error::IoError(format!(
                "Cannot reach the worker at {}: {}",
                socket_path.display(),
                e
            ))
        })?;

        let (read_half, write_half) = stream.into_split();
        let pending: PendingCalls = Arc::new(StdMutex::new(HashMap::new()));
        let (signals, _) = broadcast::channel(1024);
        let reader = tokio::spawn(read_frames(
            read_half,
            Arc::clone(&pending),
            signals.clone(),
        ));

        Ok(Self {
            socket_path,
            writer: Mutex::new(write_half),
            pending,
            signals,
            next_id: AtomicU64::new(1),
            timeout: DEFAULT_CALL_TIMEOUT,
            reader,
        })
    }

    /// Bound for fast calls
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Signals broadcast by the worker from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    /// Send one request and wait for its reply
    ///
    /// Error replies are returned as `Err`.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let method = request.method();
        let bounded = !request.is_long_running();
        let line = protocol::encode(&Frame::Request { id, request })?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                lock_pending(&self.pending).remove(&id);
                return Err(Error::IoError(format!("Failed to send {}: {}", method, e)));
            }
        }

        let reply = if bounded {
            match tokio::time::timeout(self.timeout, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    lock_pending(&self.pending).remove(&id);
                    return Err(Error::Timeout(method.to_string()));
                }
            }
        } else {
            rx.await
        };

        reply
            .map_err(|_| Error::Protocol(format!("worker closed the connection during {}", method)))?
            .into_result()
    }

    async fn call_ok(&self, request: Request) -> Result<()> {
        let method = request.method();
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(method, &other)),
        }
    }

    pub async fn init(&self, options: &BTreeMap<String, bool>) -> Result<()> {
        self.call_ok(Request::Init {
            options: options.clone(),
        })
        .await
    }

    pub async fn add(&self, name: &str) -> Result<()> {
        self.call_ok(Request::Add {
            name: name.to_string(),
        })
        .await
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.call_ok(Request::Remove {
            name: name.to_string(),
        })
        .await
    }

    pub async fn load(&self, path: &Path) -> Result<()> {
        self.call_ok(Request::Load {
            path: path.to_path_buf(),
        })
        .await
    }

    pub async fn prepare(&self) -> Result<PrepareReply> {
        match self.call(Request::Prepare).await? {
            Response::Prepared(reply) => Ok(reply),
            other => Err(unexpected("Prepare", &other)),
        }
    }

    pub async fn to_add(&self) -> Result<Vec<AddEntry>> {
        match self.call(Request::ToAdd).await? {
            Response::ToAdd { packages } => Ok(packages),
            other => Err(unexpected("To_Add", &other)),
        }
    }

    pub async fn to_remove(&self) -> Result<Vec<RemoveEntry>> {
        match self.call(Request::ToRemove).await? {
            Response::ToRemove { packages } => Ok(packages),
            other => Err(unexpected("To_Remove", &other)),
        }
    }

    /// Apply the prepared transaction; resolves when the worker is done
    pub async fn commit(&self) -> Result<()> {
        self.call_ok(Request::Commit).await
    }

    pub async fn interrupt(&self) -> Result<()> {
        self.call_ok(Request::Interrupt).await
    }

    pub async fn release(&self) -> Result<()> {
        self.call_ok(Request::Release).await
    }

    pub async fn stop_daemon(&self) -> Result<()> {
        self.call_ok(Request::StopDaemon).await
    }

    pub async fn refresh(&self, force: bool) -> Result<()> {
        self.call_ok(Request::Refresh { force }).await
    }

    pub async fn check_updates(&self) -> Result<UpdateSet> {
        match self.call(Request::CheckUpdates).await? {
            Response::Updates(updates) => Ok(updates),
            other => Err(unexpected("CheckUpdates", &other)),
        }
    }
}

impl Drop for DaemonClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock_pending(
    pending: &PendingCalls,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Response>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unexpected(method: &str, response: &Response) -> Error {
    Error::Protocol(format!("unexpected reply to {}: {:?}", method, response))
}

/// Route responses to their callers and signals to subscribers
async fn read_frames(
    read_half: OwnedReadHalf,
    pending: PendingCalls,
    signals: broadcast::Sender<Signal>,
) {
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match protocol::decode(&line) {
            Ok(Frame::Response { id, response }) => {
                if let Some(tx) = lock_pending(&pending).remove(&id) {
                    let _ = tx.send(response);
                } else {
                    log::debug!("Dropping reply {} nobody waits for", id);
                }
            }
            Ok(Frame::Signal { signal }) => {
                let _ = signals.send(signal);
            }
            Ok(Frame::Request { .. }) => log::warn!("Worker sent a request frame"),
            Err(e) => log::warn!("{}", e),
        }
    }
    // Wake every waiting caller with a closed channel
    lock_pending(&pending).clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    /// Worker stand-in answering every request with `reply`, after one signal
    async fn fake_worker(listener: UnixListener, reply: Option<Response>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Frame::Request { id, .. } = protocol::decode(&line).unwrap() else {
                continue;
            };
            let signal = Frame::Signal {
                signal: Signal::Action("Checking dependencies...".to_string()),
            };
            write_half
                .write_all(protocol::encode(&signal).unwrap().as_bytes())
                .await
                .unwrap();
            if let Some(response) = &reply {
                let frame = Frame::Response {
                    id,
                    response: response.clone(),
                };
                write_half
                    .write_all(protocol::encode(&frame).unwrap().as_bytes())
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_call_receives_reply_and_signal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("worker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_worker(listener, Some(Response::Ok)));

        let client = DaemonClient::connect(&path).await.unwrap();
        let mut signals = client.subscribe();
        client.release().await.unwrap();
        assert_eq!(
            signals.recv().await.unwrap(),
            Signal::Action("Checking dependencies...".to_string())
        );
    }

    #[tokio::test]
    async fn test_error_reply_becomes_err() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("worker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let err = Error::ConcurrentSession("a transaction is already prepared".to_string());
        tokio::spawn(fake_worker(listener, Some(Response::error(&err))));

        let client = DaemonClient::connect(&path).await.unwrap();
        let result = client.init(&BTreeMap::new()).await;
        assert!(matches!(result, Err(Error::ConcurrentSession(_))));
    }

    #[tokio::test]
    async fn test_fast_call_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("worker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_worker(listener, None));

        let client = DaemonClient::connect(&path)
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(100));
        let err = client.add("foo").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(ref method) if method == "Add"));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_connect_without_worker_fails() {
        let temp_dir = TempDir::new().unwrap();
        let result = DaemonClient::connect(temp_dir.path().join("absent.sock")).await;
        assert!(matches!(result, Err(Error::IoError(_))));
    }
}
