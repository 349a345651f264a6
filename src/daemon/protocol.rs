// src/daemon/protocol.rs

//! Wire format between clients and the worker
//!
//! Newline-delimited JSON over the Unix socket. Every line is one
//! [`Frame`]. Clients send `request` frames tagged with an id of their
//! choosing; the worker answers each with a `response` frame carrying the
//! same id, in completion order, and interleaves `signal` frames that every
//! connected client receives.
//!
//! ```text
//! {"frame":"request","id":1,"request":{"method":"init","params":{"options":{}}}}
//! {"frame":"response","id":1,"response":{"status":"ok"}}
//! {"frame":"signal","signal":{"signal":"Action","value":"Checking dependencies..."}}
//! ```

use crate::catalog::PackageRef;
use crate::engine::{EnginePlan, PrepareOutcome};
use crate::error::{Error, Result};
use crate::progress::Signal;
use crate::resolver::Ambiguity;
use crate::updates::UpdateSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Calls a client can make
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    Init { options: BTreeMap<String, bool> },
    Add { name: String },
    Remove { name: String },
    Load { path: PathBuf },
    Prepare,
    ToAdd,
    ToRemove,
    Commit,
    Interrupt,
    Release,
    StopDaemon,
    Refresh { force: bool },
    CheckUpdates,
}

impl Request {
    /// Name used in logs and timeout errors
    pub fn method(&self) -> &'static str {
        match self {
            Request::Init { .. } => "Init",
            Request::Add { .. } => "Add",
            Request::Remove { .. } => "Remove",
            Request::Load { .. } => "Load",
            Request::Prepare => "Prepare",
            Request::ToAdd => "To_Add",
            Request::ToRemove => "To_Remove",
            Request::Commit => "Commit",
            Request::Interrupt => "Interrupt",
            Request::Release => "Release",
            Request::StopDaemon => "StopDaemon",
            Request::Refresh { .. } => "Refresh",
            Request::CheckUpdates => "CheckUpdates",
        }
    }

    /// Whether the call may legitimately run unbounded
    pub fn is_long_running(&self) -> bool {
        matches!(
            self,
            Request::Commit | Request::Refresh { .. } | Request::CheckUpdates
        )
    }
}

/// A package the prepared transaction installs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddEntry {
    pub name: String,
    pub version: String,
    pub download_size: u64,
}

impl From<&PackageRef> for AddEntry {
    fn from(pkg: &PackageRef) -> Self {
        Self {
            name: pkg.name.clone(),
            version: pkg.version.to_string(),
            download_size: pkg.download_size,
        }
    }
}

/// A package the prepared transaction removes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveEntry {
    pub name: String,
    pub version: String,
}

impl From<&PackageRef> for RemoveEntry {
    fn from(pkg: &PackageRef) -> Self {
        Self {
            name: pkg.name.clone(),
            version: pkg.version.to_string(),
        }
    }
}

/// Answer to `Prepare`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PrepareReply {
    Ready {
        to_add: Vec<AddEntry>,
        to_remove: Vec<RemoveEntry>,
    },
    NothingToDo,
    Providers { choices: Vec<Ambiguity> },
}

impl From<&PrepareOutcome> for PrepareReply {
    fn from(outcome: &PrepareOutcome) -> Self {
        match outcome {
            PrepareOutcome::Ready(plan) => PrepareReply::from(plan),
            PrepareOutcome::NothingToDo => PrepareReply::NothingToDo,
            PrepareOutcome::Providers(choices) => PrepareReply::Providers {
                choices: choices.clone(),
            },
        }
    }
}

impl From<&EnginePlan> for PrepareReply {
    fn from(plan: &EnginePlan) -> Self {
        PrepareReply::Ready {
            to_add: plan.to_add.iter().map(AddEntry::from).collect(),
            to_remove: plan.to_remove.iter().map(RemoveEntry::from).collect(),
        }
    }
}

/// Error categories that survive the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Engine,
    Authorization,
    LockedPackage,
    ConcurrentSession,
    Interrupted,
    InvalidTarget,
    InvalidState,
    Timeout,
    Other,
}

/// An error as sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        let (kind, message) = match err {
            Error::Engine(m) => (ErrorKind::Engine, m.clone()),
            Error::Authorization(m) => (ErrorKind::Authorization, m.clone()),
            Error::LockedPackage(m) => (ErrorKind::LockedPackage, m.clone()),
            Error::ConcurrentSession(m) => (ErrorKind::ConcurrentSession, m.clone()),
            Error::Interrupted => (ErrorKind::Interrupted, String::new()),
            Error::InvalidTarget(m) => (ErrorKind::InvalidTarget, m.clone()),
            Error::InvalidState { .. } => (ErrorKind::InvalidState, err.to_string()),
            Error::Timeout(m) => (ErrorKind::Timeout, m.clone()),
            other => (ErrorKind::Other, other.to_string()),
        };
        Self { kind, message }
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        match err.kind {
            ErrorKind::Engine => Error::Engine(err.message),
            ErrorKind::Authorization => Error::Authorization(err.message),
            ErrorKind::LockedPackage => Error::LockedPackage(err.message),
            ErrorKind::ConcurrentSession => Error::ConcurrentSession(err.message),
            ErrorKind::Interrupted => Error::Interrupted,
            ErrorKind::InvalidTarget => Error::InvalidTarget(err.message),
            ErrorKind::Timeout => Error::Timeout(err.message),
            // The state name does not survive the trip; keep the text
            ErrorKind::InvalidState | ErrorKind::Other => Error::Engine(err.message),
        }
    }
}

/// Replies from the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Error(WireError),
    Prepared(PrepareReply),
    ToAdd { packages: Vec<AddEntry> },
    ToRemove { packages: Vec<RemoveEntry> },
    Updates(UpdateSet),
}

impl Response {
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Response::Ok,
            Err(e) => Response::error(&e),
        }
    }

    pub fn error(err: &Error) -> Self {
        Response::Error(WireError::from(err))
    }

    /// Turn an error reply back into an `Err`
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error(err) => Err(err.into()),
            other => Ok(other),
        }
    }
}

/// One line on the socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Request { id: u64, request: Request },
    Response { id: u64, response: Response },
    Signal { signal: Signal },
}

/// Serialize a frame as one newline-terminated line
pub fn encode(frame: &Frame) -> Result<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line into a frame
pub fn decode(line: &str) -> Result<Frame> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| Error::Protocol(format!("invalid frame: {}", e)))
}
