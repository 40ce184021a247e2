//! Builder methods for creating errors with context

use super::types::{Error, TransactionPhase};
use std::path::PathBuf;
use std::time::Duration;

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a connectivity error for a socket operation against `endpoint`
    #[must_use]
    pub fn connectivity(
        endpoint: impl Into<String>,
        operation: &'static str,
        source: std::io::Error,
    ) -> Self {
        Error::Connectivity {
            endpoint: endpoint.into(),
            operation,
            source,
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: &'static str, duration: Duration) -> Self {
        Error::Timeout {
            operation,
            duration,
        }
    }

    /// Create a protocol error tagged with the call site that hit it
    #[must_use]
    pub fn protocol(code: u16, context: &'static str, detail: impl Into<String>) -> Self {
        Error::Protocol {
            code,
            context,
            detail: detail.into(),
        }
    }

    /// Create a transaction error for the given phase
    #[must_use]
    pub fn transaction(phase: TransactionPhase, code: u16, detail: impl Into<String>) -> Self {
        Error::Transaction {
            phase,
            code,
            detail: detail.into(),
        }
    }

    /// Create a file system error with context
    #[must_use]
    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: &'static str,
        source: std::io::Error,
    ) -> Self {
        Error::FileSystem {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Create an invalid key error
    #[must_use]
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Serialization {
            operation,
            message: message.into(),
        }
    }

    /// Create a lock error
    #[must_use]
    pub fn lock(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Lock {
            name: name.into(),
            message: message.into(),
        }
    }
}
