//! Error types for kvcache operations

mod builders;
mod conversions;
mod kinds;
mod types;

pub use types::{Error, Result, TransactionPhase};
