//! Error types and result handling for mongo-river.
//!
//! This module defines the main error type [`Error`], a convenience
//! [`Result`] type alias, and the [`FailureKind`] classification the
//! supervisor uses to decide whether a failed startup attempt is retried.
//!
//! # Example
//!
//! ```rust
//! use mongo_river::{Error, FailureKind, Result};
//!
//! fn probe() -> Result<()> {
//!     Err(Error::Network("connection reset by peer".to_string()))
//! }
//!
//! match probe() {
//!     Ok(()) => println!("reachable"),
//!     Err(e) if e.failure_kind() == FailureKind::TransientNetwork => eprintln!("retrying: {}", e),
//!     Err(e) => eprintln!("giving up: {}", e),
//! }
//! ```

use mongodb::error::ErrorKind;
use thiserror::Error;

/// Server error codes reported when an operation was interrupted.
const INTERRUPTED_CODES: [i32; 3] = [
    11600, // InterruptedAtShutdown
    11601, // Interrupted
    11602, // InterruptedDueToReplStateChange
];

/// The main error type for mongo-river operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// MongoDB driver error.
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Socket-level or connectivity failure not raised by the driver itself.
    #[error("Network error: {0}")]
    Network(String),

    /// A command reached the server and was rejected.
    #[error("Command failed: {message}")]
    CommandFailed {
        /// Server error code, when one was reported
        code: Option<i32>,
        /// Server error message
        message: String,
    },

    /// Cooperative cancellation of the current operation.
    #[error("Operation interrupted")]
    Interrupted,

    /// A `host[:port]` token could not be parsed.
    #[error("Invalid endpoint '{token}': {reason}")]
    InvalidEndpoint {
        /// The offending token
        token: String,
        /// Why it was rejected
        reason: String,
    },

    /// Host name resolution failed.
    #[error("Unknown host '{host}': {reason}")]
    UnknownHost {
        /// The host that failed to resolve
        host: String,
        /// Resolver message
        reason: String,
    },

    /// A connection was requested for an empty endpoint set.
    #[error("Empty endpoint set")]
    EmptyEndpointSet,

    /// I/O error, typically from checkpoint file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error when persisting checkpoints.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// BSON encoding error.
    #[error("BSON encoding error: {0}")]
    BsonSer(#[from] bson::ser::Error),

    /// BSON decoding error.
    #[error("BSON decoding error: {0}")]
    BsonDe(#[from] bson::de::Error),

    /// Invalid or corrupt checkpoint file.
    #[error("Checkpoint error: {message}")]
    Checkpoint {
        /// Description of what was invalid
        message: String,
    },

    /// A spawned task panicked or was cancelled.
    #[error("Task failed: {0}")]
    Task(String),

    /// Graceful shutdown was requested (e.g., via Ctrl+C).
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly leave long-running loops.
    #[error("Shutdown requested")]
    Shutdown,
}

/// How a startup failure is handled by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connectivity trouble; the whole startup attempt is restarted.
    TransientNetwork,
    /// Cancellation; the supervisor stops without starting anything.
    Interrupted,
    /// Anything else; the supervisor gives up.
    ProtocolFatal,
}

impl Error {
    /// Classifies this error for the supervisor's retry policy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Network(_) | Error::Io(_) => FailureKind::TransientNetwork,
            Error::Interrupted | Error::Shutdown => FailureKind::Interrupted,
            Error::CommandFailed { code: Some(code), .. } if INTERRUPTED_CODES.contains(code) => {
                FailureKind::Interrupted
            }
            Error::Mongo(e) => classify_driver_error(e),
            _ => FailureKind::ProtocolFatal,
        }
    }

    /// Returns true when the server answered a command with a failure reply,
    /// as opposed to the command never reaching the server.
    pub fn is_command_failure(&self) -> bool {
        match self {
            Error::CommandFailed { code, .. } => {
                !code.is_some_and(|c| INTERRUPTED_CODES.contains(&c))
            }
            Error::Mongo(e) => match e.kind.as_ref() {
                ErrorKind::Command(cmd) => !INTERRUPTED_CODES.contains(&cmd.code),
                _ => false,
            },
            _ => false,
        }
    }
}

fn classify_driver_error(e: &mongodb::error::Error) -> FailureKind {
    match e.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => FailureKind::TransientNetwork,
        ErrorKind::Command(cmd) if INTERRUPTED_CODES.contains(&cmd.code) => {
            FailureKind::Interrupted
        }
        _ => FailureKind::ProtocolFatal,
    }
}

/// A convenient Result type alias for mongo-river operations.
///
/// This is equivalent to `std::result::Result<T, mongo_river::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
