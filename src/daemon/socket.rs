// src/daemon/socket.rs

//! Unix socket listener for the worker
//!
//! Each accepted connection is identified by its peer credentials
//! (`SO_PEERCRED`) and served by two tasks: a reader that spawns one task
//! per request, and a writer that serializes responses together with the
//! signal broadcast. Long calls such as `Commit` therefore never block
//! `Interrupt` arriving on the same connection.

use super::auth::PeerCredentials;
use super::protocol::{self, Frame};
use super::worker::{Caller, TransactionProtocol};
use crate::Result;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};

/// Socket configuration
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub unix_path: PathBuf,
    /// Socket file permissions
    pub unix_mode: u32,
}

impl SocketConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            unix_path: path.into(),
            unix_mode: 0o666,
        }
    }
}

/// Owns the listening socket file
pub struct SocketManager {
    config: SocketConfig,
    unix_listener: Option<UnixListener>,
}

impl SocketManager {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            unix_listener: None,
        }
    }

    /// Bind the socket, replacing a leftover file
    pub fn bind(&mut self) -> Result<()> {
        if self.config.unix_path.exists() {
            std::fs::remove_file(&self.config.unix_path)?;
        }

        if let Some(parent) = self.config.unix_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let unix_listener = UnixListener::bind(&self.config.unix_path).map_err(|e| {
            crate::Error::IoError(format!(
                "Failed to bind Unix socket at {:?}: {}",
                self.config.unix_path, e
            ))
        })?;

        let perms = std::fs::Permissions::from_mode(self.config.unix_mode);
        std::fs::set_permissions(&self.config.unix_path, perms)?;

        log::info!(
            "Listening on Unix socket: {:?} (mode: {:o})",
            self.config.unix_path,
            self.config.unix_mode
        );

        self.unix_listener = Some(unix_listener);
        Ok(())
    }

    pub fn take_unix_listener(&mut self) -> Option<UnixListener> {
        self.unix_listener.take()
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.unix_path
    }

    /// Remove the socket file
    pub fn cleanup(&self) {
        if self.config.unix_path.exists()
            && let Err(e) = std::fs::remove_file(&self.config.unix_path)
        {
            log::warn!("Failed to remove socket file: {}", e);
        }
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Accept connections until the listener fails
pub async fn serve(listener: UnixListener, protocol: Arc<TransactionProtocol>) {
    let next_connection = AtomicU64::new(1);
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let connection = next_connection.fetch_add(1, Ordering::Relaxed);
                let protocol = Arc::clone(&protocol);
                tokio::spawn(async move {
                    serve_connection(stream, connection, protocol).await;
                });
            }
            Err(e) => {
                log::error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Serve one client until it disconnects
pub async fn serve_connection(
    stream: UnixStream,
    connection: u64,
    protocol: Arc<TransactionProtocol>,
) {
    let credentials = match PeerCredentials::from_stream(&stream) {
        Ok(creds) => creds,
        Err(e) => {
            log::warn!("Rejecting connection {}: no peer credentials: {}", connection, e);
            return;
        }
    };
    let caller = Caller {
        connection,
        credentials,
    };
    log::debug!(
        "Connection {} from pid {} uid {}",
        connection,
        credentials.pid,
        credentials.uid
    );

    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let mut signals = protocol.subscribe();

    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                signal = signals.recv() => match signal {
                    Ok(signal) => Frame::Signal { signal },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("Connection {} skipped {} signal(s)", connection, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            let line = match protocol::encode(&frame) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::debug!("Connection {} read error: {}", connection, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match protocol::decode(&line) {
            Ok(Frame::Request { id, request }) => {
                let protocol = Arc::clone(&protocol);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let response = protocol.handle(&caller, request).await;
                    let _ = out_tx.send(Frame::Response { id, response });
                });
            }
            Ok(_) => log::warn!("Connection {} sent a non-request frame", connection),
            Err(e) => log::warn!("Connection {}: {}", connection, e),
        }
    }

    protocol.disconnect(connection).await;
    drop(out_tx);
    // Signals would keep the writer alive forever
    writer.abort();
    log::debug!("Connection {} closed", connection);
}
