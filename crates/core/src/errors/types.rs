//! Core error type definitions

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for kvcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for kvcache operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed settings, e.g. an unknown region or storage tier
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Socket create/connect/send/receive failure
    #[error("connectivity error during {operation} with '{endpoint}': {source}")]
    Connectivity {
        endpoint: String,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A blocking receive waited longer than the configured timeout
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: &'static str,
        duration: Duration,
    },

    /// Malformed reply from the remote store, numbered by call site
    #[error("protocol error #{code} during {context}: {detail}")]
    Protocol {
        code: u16,
        context: &'static str,
        detail: String,
    },

    /// Start/queue/commit failure of a multi-command write, numbered by phase
    #[error("transaction failed in {phase} phase (#{code}): {detail}")]
    Transaction {
        phase: TransactionPhase,
        code: u16,
        detail: String,
    },

    /// Missing parent directory, write failure or rename failure
    #[error("file system {operation} operation failed for '{}': {source}", .path.display())]
    FileSystem {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Key validation failure
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// A value or record could not be encoded for writing
    #[error("serialization error during {operation}: {message}")]
    Serialization {
        operation: &'static str,
        message: String,
    },

    /// The lock manager could not acquire or release a named lock
    #[error("lock '{name}' error: {message}")]
    Lock { name: String, message: String },
}

/// Phase of a multi-command write in which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionPhase {
    /// Opening the transaction
    Begin,
    /// Queueing the metadata field write
    QueueMetadata,
    /// Queueing the metadata record expiry
    QueueExpiry,
    /// Queueing a payload chunk
    QueuePayload,
    /// Queueing the payload record expiry
    QueuePayloadExpiry,
    /// Executing the queued commands
    Commit,
    /// Re-arming expiry without rewriting the record
    Refresh,
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Begin => "begin",
            Self::QueueMetadata => "queue-metadata",
            Self::QueueExpiry => "queue-expiry",
            Self::QueuePayload => "queue-payload",
            Self::QueuePayloadExpiry => "queue-payload-expiry",
            Self::Commit => "commit",
            Self::Refresh => "refresh",
        };
        f.write_str(name)
    }
}
