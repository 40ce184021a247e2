//! Filesystem backend: one file per record, optionally sharded over a
//! 256×256 folder tree keyed by the SHA-512 digest of the key

pub mod paths;
pub mod store;

pub use paths::{key_digest, RecordPaths};
pub use store::FileStore;
