//! Key-value cache with interchangeable storage backends
//!
//! Values are stored under string or integer keys with a time-to-live, in
//! one of two media:
//! - [`FileStore`]: one file per record, written atomically, optionally
//!   sharded over a two-level folder tree
//! - [`NetworkStore`]: a remote server reached over an inline text protocol,
//!   with chunked compressed payloads written in transactions
//!
//! Both implement [`Storage`]; the typed surface is [`StorageExt`].
//!
//! ```no_run
//! use kvcache::{FileSettings, FileStore, StorageExt};
//! use std::time::Duration;
//!
//! # fn main() -> kvcache::Result<()> {
//! let store = FileStore::new(FileSettings::new().with_folder("/tmp/kv"))?;
//! store.set_value("answer", &42u32, Duration::from_secs(60))?;
//! assert_eq!(store.get::<u32>("answer")?, Some(42));
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod envelope;
pub mod file;
pub mod key;
pub mod metrics;
pub mod network;
pub mod prefix;
pub mod storage;
pub mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CommonSettings, FileSettings, HostEnvironment, NetworkSettings, RegionScope, StorageTier,
};
pub use envelope::{CreationSite, Envelope, Provenance, RawEnvelope};
pub use file::FileStore;
pub use key::CacheKey;
pub use metrics::{TimingCollector, TimingReport};
pub use network::NetworkStore;
pub use prefix::{effective_prefix, resolve_prefix};
pub use storage::{Storage, StorageExt};

pub use kvcache_core::{Error, Result, TransactionPhase};
pub use kvcache_utils::{FileLockManager, InProcessLockManager, KeyLock, LockHandle, LockManager};
