//! Shared helpers for the integration tests

#![allow(dead_code)]

pub mod fake_server;

pub use fake_server::{FakeServer, Fault};

use kvcache::{FileSettings, FileStore, InProcessLockManager, NetworkStore};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Route `tracing` output through the test harness once per binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a temporary directory for cache files
pub fn create_test_dir() -> TempDir {
    TempDir::new().unwrap()
}

/// File store under `folder` with an in-process lock registry
pub fn file_store(folder: &Path, multi_folder: bool) -> (FileStore, Arc<InProcessLockManager>) {
    let locks = Arc::new(InProcessLockManager::new());
    let store = FileStore::new(
        FileSettings::new()
            .with_folder(folder)
            .with_multi_folder(multi_folder)
            .with_prefix(""),
    )
    .unwrap()
    .with_lock_manager(locks.clone());
    (store, locks)
}

/// Network store talking to `server` with an in-process lock registry
pub fn network_store(server: &FakeServer) -> (NetworkStore, Arc<InProcessLockManager>) {
    let locks = Arc::new(InProcessLockManager::new());
    let store = NetworkStore::new(server.settings())
        .unwrap()
        .with_lock_manager(locks.clone());
    (store, locks)
}

/// Seconds since the epoch
pub fn now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}
