//! Conversion implementations for error types

use super::types::Error;

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization {
            operation: "encode value",
            message: error.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::Serialization {
            operation: "encode record",
            message: error.to_string(),
        }
    }
}
