//! # Error Handling
//!
//! This module defines the error type shared by the relay core. Errors here are
//! always connection-scoped: the handler that detects one logs it and drops the
//! offending message, it never tears down the event loop or another session.
//!
//! ## Error Categories:
//! - **Session errors**: sending on a session that was finished or cascaded closed
//! - **Worker errors**: no worker available, or the worker connection is gone
//! - **Protocol errors**: malformed JSON or binary frames from a device or worker
//!
//! Startup problems (bad configuration, a listener that cannot bind) are not
//! relay errors; they abort `main` through `anyhow`.
//!
//! ## Key Rust Concepts:
//! - **enum**: Each variant represents a different kind of failure
//! - **Display trait**: Defines how errors are formatted for log lines
//! - **From trait**: Lets the `?` operator convert library errors automatically

use std::fmt;

/// Errors produced by the session relay and worker-pool core.
///
/// ## Usage Example:
/// ```rust,ignore
/// if self.is_closed() {
///     return Err(RelayError::SessionClosed(self.id.clone()));
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// The session was finished or closed by its worker
    SessionClosed(String),

    /// The pool has no live worker to bind a device to
    WorkerUnavailable,

    /// The worker connection is closed; carries the worker key or session id
    WorkerGone(String),

    /// A JSON message could not be parsed or had the wrong shape
    InvalidMessage(String),

    /// A binary session frame was truncated or malformed
    Frame(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::SessionClosed(id) => write!(f, "Session {} is closed", id),
            RelayError::WorkerUnavailable => write!(f, "No ASR worker available"),
            RelayError::WorkerGone(what) => write!(f, "Worker connection gone ({})", what),
            RelayError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            RelayError::Frame(msg) => write!(f, "Invalid session frame: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

/// JSON parse failures always come from a peer sending bad data, so they are
/// protocol errors rather than internal ones.
impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::InvalidMessage(format!("JSON parsing error: {}", err))
    }
}

/// Shorthand for `Result<T, RelayError>`.
pub type RelayResult<T> = Result<T, RelayError>;
