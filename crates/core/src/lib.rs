//! Core errors and constants shared by the `kvcache` crates.
//!
//! - **`errors`**: the `Error` enum and `Result` alias covering every failure a
//!   storage backend can report, grouped by the medium that produced it.
//! - **`constants`**: wire names, file naming and default tuning values.

pub mod constants;
pub mod errors;

pub use self::{
    constants::*,
    errors::{Error, Result, TransactionPhase},
};
