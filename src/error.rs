// src/error.rs

//! Error types shared by the planner, the worker and the client
//!
//! The variants follow the failure taxonomy of the transaction protocol.
//! Ambiguity prompts and "nothing to do" are not errors: they are
//! successful outcomes of `Prepare`, see [`crate::engine::PrepareOutcome`].

use thiserror::Error;

/// Errors raised anywhere in pkgwarden
#[derive(Error, Debug)]
pub enum Error {
    /// The package engine refused an operation
    #[error("{0}")]
    Engine(String),

    /// The caller failed the privilege check
    #[error("Authentication failed: {0}")]
    Authorization(String),

    /// Resolution would remove a held package
    #[error("{0}")]
    LockedPackage(String),

    /// Another session already holds the transaction lock
    #[error("Unable to lock database: {0}")]
    ConcurrentSession(String),

    /// The commit was cancelled by the user
    #[error("Transaction interrupted")]
    Interrupted,

    /// A name or path does not resolve to a real package
    #[error("{0} is not a valid path or package name")]
    InvalidTarget(String),

    /// An operation was called in a state that does not accept it
    #[error("{operation} is not allowed while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// The client-side resolver refused the change set
    #[error("{0}")]
    Resolution(String),

    /// A fast RPC call did not answer in time
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Malformed RPC frame or unexpected reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration could not be read
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A catalog, manifest or version string could not be parsed
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A requested resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O failure with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Raw I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error is transient and the call may be retried after `Release`
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::ConcurrentSession(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::ParseError(err.to_string())
    }
}

/// Result type used throughout pkgwarden
pub type Result<T> = std::result::Result<T, Error>;
