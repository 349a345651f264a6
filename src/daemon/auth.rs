// src/daemon/auth.rs

//! Authentication and authorization for the worker
//!
//! Provides:
//! - Peer credential extraction (SO_PEERCRED)
//! - Permission checking (root, trusted groups, PolicyKit)
//! - Audit logging
//!
//! # Security Model
//!
//! - **Root users** (UID 0): every operation
//! - **Trusted groups** (`daemon.trusted_gids`): every operation
//! - **Other users**: planning and queries; `Commit`, `Refresh` and
//!   `StopDaemon` need PolicyKit (feature `polkit`) or
//!   `daemon.require_polkit = false`
//!
//! Policy actions:
//! - `org.pkgwarden.commit` - Apply a prepared transaction
//! - `org.pkgwarden.refresh` - Refresh the sync repositories
//! - `org.pkgwarden.stop` - Stop the worker

use crate::Result;
use async_trait::async_trait;
use std::io;
use std::os::unix::io::AsRawFd;

/// Peer credentials from a Unix socket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl PeerCredentials {
    /// Extract peer credentials from a connected Unix socket
    pub fn from_stream<S: AsRawFd>(stream: &S) -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            let fd = stream.as_raw_fd();

            let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

            let result = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_PEERCRED,
                    &mut cred as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };

            if result == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(PeerCredentials {
                pid: cred.pid as u32,
                uid: cred.uid,
                gid: cred.gid,
            })
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = stream;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "Peer credentials not supported on this platform",
            ))
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Permission level for a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Permission {
    Denied,
    /// Planning and queries only
    ReadOnly,
    Full,
}

/// Operations subject to authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Update checks, `To_Add`/`To_Remove`
    Query,
    /// `Init`, `Add`, `Remove`, `Load`, `Prepare`, `Release`, `Interrupt`
    Plan,
    /// Apply a prepared transaction
    Commit,
    /// Refresh the sync repositories
    Refresh,
    /// Stop the worker
    Stop,
}

impl Action {
    /// PolicyKit action ID
    pub fn polkit_action(&self) -> &'static str {
        match self {
            Action::Query => "org.pkgwarden.query",
            Action::Plan => "org.pkgwarden.plan",
            Action::Commit => "org.pkgwarden.commit",
            Action::Refresh => "org.pkgwarden.refresh",
            Action::Stop => "org.pkgwarden.stop",
        }
    }

    /// Whether the action leaves the system untouched
    pub fn is_read_only(&self) -> bool {
        matches!(self, Action::Query | Action::Plan)
    }
}

/// Decides whether a caller may perform an action
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, creds: &PeerCredentials, action: Action) -> Result<bool>;
}

/// Credential-based authorization with an optional PolicyKit fallback
#[derive(Debug, Clone)]
pub struct AuthChecker {
    /// Require PolicyKit for non-root write operations
    require_polkit: bool,
    /// GIDs that get full access
    trusted_gids: Vec<u32>,
}

impl Default for AuthChecker {
    fn default() -> Self {
        Self {
            require_polkit: true,
            trusted_gids: vec![0],
        }
    }
}

impl AuthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable PolicyKit requirement (all authenticated users get full access)
    pub fn disable_polkit(mut self) -> Self {
        self.require_polkit = false;
        self
    }

    pub fn add_trusted_gid(mut self, gid: u32) -> Self {
        if !self.trusted_gids.contains(&gid) {
            self.trusted_gids.push(gid);
        }
        self
    }

    /// Permission from credentials alone
    pub fn check(&self, creds: &PeerCredentials, action: Action) -> Permission {
        if creds.is_root() || self.trusted_gids.contains(&creds.gid) {
            return Permission::Full;
        }

        if action.is_read_only() {
            return Permission::ReadOnly;
        }

        if self.require_polkit {
            return Permission::Denied;
        }

        Permission::Full
    }

    pub fn is_allowed(&self, creds: &PeerCredentials, action: Action) -> bool {
        match self.check(creds, action) {
            Permission::Full => true,
            Permission::ReadOnly => action.is_read_only(),
            Permission::Denied => false,
        }
    }
}

#[async_trait]
impl Authorizer for AuthChecker {
    async fn authorize(&self, creds: &PeerCredentials, action: Action) -> Result<bool> {
        if self.is_allowed(creds, action) {
            return Ok(true);
        }
        if !self.require_polkit {
            return Ok(false);
        }

        #[cfg(feature = "polkit")]
        {
            polkit::check_authorization(creds, action).await
        }

        #[cfg(not(feature = "polkit"))]
        {
            log::debug!(
                "PolicyKit support not built in, denying {:?} for uid {}",
                action,
                creds.uid
            );
            Ok(false)
        }
    }
}

#[cfg(feature = "polkit")]
mod polkit {
    use super::{Action, PeerCredentials};
    use crate::{Error, Result};
    use std::collections::HashMap;
    use zbus::zvariant::Value;

    /// Allow the agent to ask the user for a password
    const ALLOW_USER_INTERACTION: u32 = 1;

    /// Start time of a process in clock ticks, field 22 of /proc/<pid>/stat
    fn process_start_time(pid: u32) -> Result<u64> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid))?;
        // The command name may contain spaces; fields resume after the last ')'
        let rest = stat
            .rsplit_once(')')
            .map(|(_, rest)| rest)
            .ok_or_else(|| Error::Authorization(format!("malformed stat for {}", pid)))?;
        rest.split_whitespace()
            .nth(19)
            .and_then(|field| field.parse().ok())
            .ok_or_else(|| Error::Authorization(format!("no start time for {}", pid)))
    }

    pub(super) async fn check_authorization(
        creds: &PeerCredentials,
        action: Action,
    ) -> Result<bool> {
        let start_time = process_start_time(creds.pid)?;
        let connection = zbus::Connection::system()
            .await
            .map_err(|e| Error::Authorization(format!("system bus unavailable: {}", e)))?;

        let mut subject_details: HashMap<&str, Value<'_>> = HashMap::new();
        subject_details.insert("pid", Value::from(creds.pid));
        subject_details.insert("start-time", Value::from(start_time));
        let subject = ("unix-process", subject_details);
        let details: HashMap<&str, &str> = HashMap::new();

        let reply = connection
            .call_method(
                Some("org.freedesktop.PolicyKit1"),
                "/org/freedesktop/PolicyKit1/Authority",
                Some("org.freedesktop.PolicyKit1.Authority"),
                "CheckAuthorization",
                &(
                    subject,
                    action.polkit_action(),
                    details,
                    ALLOW_USER_INTERACTION,
                    "",
                ),
            )
            .await
            .map_err(|e| Error::Authorization(format!("PolicyKit check failed: {}", e)))?;

        let (authorized, _challenge, _details): (bool, bool, HashMap<String, String>) = reply
            .body()
            .deserialize()
            .map_err(|e| Error::Authorization(format!("bad PolicyKit reply: {}", e)))?;
        Ok(authorized)
    }
}

/// Audit log entry
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub credentials: PeerCredentials,
    pub action: Action,
    pub allowed: bool,
    pub details: Option<String>,
}

impl AuditEntry {
    pub fn new(credentials: PeerCredentials, action: Action, allowed: bool) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            credentials,
            action,
            allowed,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Format as log message
    pub fn to_log_message(&self) -> String {
        let allowed_str = if self.allowed { "ALLOWED" } else { "DENIED" };
        let details_str = self.details.as_deref().unwrap_or("");

        format!(
            "[{}] {} {:?} uid={} gid={} pid={} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            allowed_str,
            self.action,
            self.credentials.uid,
            self.credentials.gid,
            self.credentials.pid,
            details_str
        )
    }
}

/// In-memory audit trail mirrored to the logger
pub struct AuditLogger {
    entries: Vec<AuditEntry>,
    max_entries: usize,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            max_entries: 1000,
        }
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn log(&mut self, entry: AuditEntry) {
        let msg = entry.to_log_message();
        if entry.allowed {
            log::info!("AUDIT: {}", msg);
        } else {
            log::warn!("AUDIT: {}", msg);
        }

        self.entries.push(entry);

        if self.entries.len() > self.max_entries {
            let drain_count = self.entries.len() - self.max_entries;
            self.entries.drain(0..drain_count);
        }
    }

    pub fn log_action(
        &mut self,
        credentials: PeerCredentials,
        action: Action,
        allowed: bool,
        details: Option<&str>,
    ) {
        let mut entry = AuditEntry::new(credentials, action, allowed);
        if let Some(d) = details {
            entry = entry.with_details(d);
        }
        self.log(entry);
    }

    /// Most recent `count` entries
    pub fn recent_entries(&self, count: usize) -> &[AuditEntry] {
        let start = self.entries.len().saturating_sub(count);
        &self.entries[start..]
    }

    pub fn all_entries(&self) -> &[AuditEntry] {
        &self.entries
    }
}
