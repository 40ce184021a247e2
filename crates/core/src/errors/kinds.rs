//! Classification helpers for errors

use super::types::Error;

impl Error {
    /// Stable lowercase label of the error category, used as a log field
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Connectivity { .. } => "connectivity",
            Self::Timeout { .. } => "timeout",
            Self::Protocol { .. } => "protocol",
            Self::Transaction { .. } => "transaction",
            Self::FileSystem { .. } => "filesystem",
            Self::InvalidKey { .. } => "invalid-argument",
            Self::Serialization { .. } => "serialization",
            Self::Lock { .. } => "lock",
        }
    }

    /// Whether the error was raised by key validation
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidKey { .. })
    }

    /// Check if this error is transient and the operation could be retried
    /// on a fresh connection
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connectivity { .. })
    }

    /// Numeric code carried by protocol and transaction errors
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::Protocol { code, .. } | Self::Transaction { code, .. } => Some(*code),
            _ => None,
        }
    }
}
