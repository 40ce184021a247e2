//! Shared utilities for kvcache
//!
//! Filesystem helpers and the lock manager collaborator used by the storage
//! backends. Nothing in here knows about envelopes or wire formats.

pub mod atomic_file;
pub mod lock;
pub mod xdg;

pub use atomic_file::*;
pub use lock::*;
pub use xdg::*;
