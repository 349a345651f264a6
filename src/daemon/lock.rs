// src/daemon/lock.rs

//! PID lock files
//!
//! Two files guard the package database:
//!
//! - **Session lock** (`paths.lock_file`): present while a transaction
//!   session or refresh is active. External package tools create the same
//!   file, so their concurrent mutations are detected and rejected.
//! - **Instance lock** (`paths.pid_file`): held for the worker's lifetime so
//!   only one worker runs at a time.
//!
//! Both are a file created exclusively, `flock`ed and filled with the
//! holder's PID. A file left behind by a dead process is recovered. A file
//! with no readable PID belongs to a tool that does not write one and is
//! always treated as held.
//!
//! # Example
//!
//! ```ignore
//! use pkgwarden::daemon::lock::SessionLock;
//!
//! let lock = SessionLock::try_acquire("/var/lib/pkgwarden/db.lck")?
//!     .ok_or_else(|| Error::ConcurrentSession("database is locked".into()))?;
//!
//! // ... mutate ...
//!
//! // File removed and lock released on drop
//! ```

use crate::Result;
use fs2::FileExt;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Exclusive PID lock file, removed on drop
pub struct SessionLock {
    /// Kept open to hold the flock
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Try to take the lock without blocking
    ///
    /// Returns:
    /// - `Ok(Some(lock))` if the lock was taken
    /// - `Ok(None)` if another live process holds it
    /// - `Err` on I/O errors
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // One retry after clearing a stale file
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = file.try_lock_exclusive() {
                        let _ = fs::remove_file(&path);
                        return Err(crate::Error::IoError(format!(
                            "Failed to lock {}: {}",
                            path.display(),
                            e
                        )));
                    }
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    log::debug!("Acquired lock at {:?}", path);
                    return Ok(Some(Self { file, path }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !Self::clear_stale(&path)? {
                        log::debug!("Lock already held at {:?}", path);
                        return Ok(None);
                    }
                }
                Err(e) => {
                    return Err(crate::Error::IoError(format!(
                        "Failed to create lock file {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }

        Ok(None)
    }

    /// Remove the lock file if its holder is gone
    ///
    /// Returns whether a stale file was removed.
    pub fn clear_stale<P: AsRef<Path>>(path: P) -> Result<bool> {
        let path = path.as_ref();
        let Some(pid) = Self::holder_pid(path) else {
            return Ok(false);
        };

        if process_alive(pid) {
            return Ok(false);
        }

        // A live flock means the file was reused by someone else meanwhile
        if let Ok(file) = File::open(path) {
            if file.try_lock_exclusive().is_err() {
                return Ok(false);
            }
            let _ = file.unlock();
        }

        log::warn!("Removing stale lock {:?} left by process {}", path, pid);
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the lock file exists and belongs to a live holder
    pub fn is_held<P: AsRef<Path>>(path: P) -> bool {
        let path = path.as_ref();
        if !path.exists() {
            return false;
        }
        match Self::holder_pid(path) {
            Some(pid) => process_alive(pid),
            None => true,
        }
    }

    /// PID recorded in the lock file, if any
    pub fn holder_pid<P: AsRef<Path>>(path: P) -> Option<u32> {
        fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            log::warn!("Failed to remove lock file {:?}: {}", self.path, e);
        }
        log::debug!("Released lock at {:?}", self.path);
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // EPERM still means the process exists
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("db.lck");

        let lock = SessionLock::try_acquire(&lock_path).unwrap().unwrap();
        assert!(lock_path.exists());
        assert!(SessionLock::is_held(&lock_path));
        assert_eq!(
            SessionLock::holder_pid(&lock_path),
            Some(std::process::id())
        );

        drop(lock);
        assert!(!lock_path.exists());
        assert!(!SessionLock::is_held(&lock_path));
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("db.lck");

        let _lock = SessionLock::try_acquire(&lock_path).unwrap().unwrap();
        assert!(SessionLock::try_acquire(&lock_path).unwrap().is_none());
    }

    #[test]
    fn test_foreign_lock_without_pid_is_held() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("db.lck");
        fs::write(&lock_path, "").unwrap();

        assert!(SessionLock::is_held(&lock_path));
        assert!(SessionLock::try_acquire(&lock_path).unwrap().is_none());
        assert!(lock_path.exists());
    }

    #[test]
    fn test_stale_lock_is_recovered() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("db.lck");
        // Beyond the default pid_max, so never a live process
        fs::write(&lock_path, "4194399\n").unwrap();

        assert!(!SessionLock::is_held(&lock_path));
        let lock = SessionLock::try_acquire(&lock_path).unwrap();
        assert!(lock.is_some());
        assert_eq!(
            SessionLock::holder_pid(&lock_path),
            Some(std::process::id())
        );
    }

    #[test]
    fn test_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("run/pkgwarden/pkgwarden.pid");

        let _lock = SessionLock::try_acquire(&lock_path).unwrap().unwrap();
        assert!(lock_path.exists());
    }
}
