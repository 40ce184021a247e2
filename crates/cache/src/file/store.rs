//! Filesystem storage backend

use super::paths::RecordPaths;
use crate::clock::{Clock, SystemClock};
use crate::config::FileSettings;
use crate::envelope::{Provenance, RawEnvelope};
use crate::key::CacheKey;
use crate::metrics::{Timed, TimingCollector};
use crate::prefix::effective_prefix;
use crate::storage::Storage;
use kvcache_core::{Error, Result};
use kvcache_utils::{
    create_dir_single, write_atomic_private, FileLockManager, KeyLock, LockManager,
};
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const COMPONENT: &str = "FileStore";

/// Stores each record as one file under a root folder
///
/// Records are written to a temporary file in the destination folder and
/// renamed into place, so a reader never sees a partially written file.
pub struct FileStore {
    paths: RecordPaths,
    prefix: String,
    locks: Arc<dyn LockManager>,
    clock: Arc<dyn Clock>,
    provenance: Provenance,
    timings: Option<Arc<TimingCollector>>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("folder", &self.paths.folder())
            .field("multi_folder", &self.paths.is_sharded())
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl FileStore {
    /// Build a store from validated settings
    ///
    /// Nothing is created on disk until the first write.
    pub fn new(settings: FileSettings) -> Result<Self> {
        settings.validate()?;
        let prefix = effective_prefix(&settings.common);
        let paths = RecordPaths::new(
            settings.resolved_folder(),
            settings.multi_folder,
            prefix.clone(),
        );
        let locks: Arc<dyn LockManager> =
            Arc::new(FileLockManager::new(settings.common.resolved_lock_folder()));

        Ok(Self {
            paths,
            prefix,
            locks,
            clock: Arc::new(SystemClock),
            provenance: Provenance::current(settings.common.environment.host.clone()),
            timings: None,
        })
    }

    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timings(mut self, timings: Arc<TimingCollector>) -> Self {
        self.timings = Some(timings);
        self
    }

    /// Root folder
    pub fn folder(&self) -> &Path {
        self.paths.folder()
    }

    /// Path of the record of `key`
    pub fn filename(&self, key: &CacheKey) -> PathBuf {
        self.paths.filename(key)
    }

    /// Folder the record of `key` lives in
    pub fn shard_folder(&self, key: &CacheKey) -> PathBuf {
        self.paths.shard_folder(key)
    }

    /// Lock name guarding the record of `key`
    pub fn lock_name(&self, key: &CacheKey) -> String {
        self.paths.lock_name(key)
    }

    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    fn timed(&self, action: &'static str) -> Timed<'_> {
        Timed::start(self.timings.as_ref(), COMPONENT, action)
    }

    /// Create the root folder and, when sharded, both shard levels for `key`
    fn ensure_folders(&self, key: &CacheKey) -> Result<()> {
        create_dir_single(self.paths.folder())?;
        if self.paths.is_sharded() {
            let shard = self.paths.shard_folder(key);
            if let Some(level_one) = shard.parent() {
                create_dir_single(level_one)?;
            }
            create_dir_single(&shard)?;
        }
        Ok(())
    }

    fn delete_matching(&self, folder: &Path, pattern: &Regex) -> Result<usize> {
        let entries =
            fs::read_dir(folder).map_err(|e| Error::file_system(folder, "list folder", e))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| Error::file_system(folder, "list folder", e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !pattern.is_match(name) {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::file_system(&path, "remove record", e)),
            }
        }
        Ok(removed)
    }
}

impl Storage for FileStore {
    fn fetch_record(&self, key: &CacheKey) -> Result<Option<RawEnvelope>> {
        let _timed = self.timed("get_full");
        let filename = self.paths.filename(key);
        if !filename.exists() {
            debug!(key = %key, path = %filename.display(), "record file missing");
            return Ok(None);
        }

        let lock = KeyLock::acquire(self.locks.as_ref(), &self.paths.lock_name(key))?;
        let read = fs::read(&filename);
        lock.release()?;

        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, path = %filename.display(), error = %e, "record file unreadable");
                return Ok(None);
            }
        };
        let record = RawEnvelope::from_bytes(&bytes);
        if record.is_none() {
            warn!(key = %key, path = %filename.display(), "record file is corrupt");
        }
        Ok(record)
    }

    fn store_record(&self, record: &RawEnvelope) -> Result<()> {
        let _timed = self.timed("set_value");
        let key = &record.key;
        let bytes = record.to_bytes()?;
        self.ensure_folders(key)?;

        let filename = self.paths.filename(key);
        let lock = KeyLock::acquire(self.locks.as_ref(), &self.paths.lock_name(key))?;
        let written = write_atomic_private(&filename, &bytes);
        let released = lock.release();
        written.and(released)?;

        debug!(key = %key, path = %filename.display(), bytes = bytes.len(), "record written");
        Ok(())
    }

    fn remove_record(&self, key: &CacheKey) -> Result<()> {
        let _timed = self.timed("delete_value");
        let filename = self.paths.filename(key);
        if !filename.exists() {
            return Ok(());
        }

        let lock = KeyLock::acquire(self.locks.as_ref(), &self.paths.lock_name(key))?;
        let removed = match fs::remove_file(&filename) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::file_system(&filename, "remove record", e)),
        };
        let released = lock.release();
        removed.and(released)?;

        debug!(key = %key, path = %filename.display(), "record removed");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let _timed = self.timed("clear");
        let folder = self.paths.folder();
        if !folder.is_dir() {
            return Ok(());
        }

        let pattern = self.paths.record_pattern()?;
        let removed = if self.paths.is_sharded() {
            let mut removed = 0;
            for shard in self.paths.all_shard_folders() {
                if shard.is_dir() {
                    removed += self.delete_matching(&shard, &pattern)?;
                }
            }
            removed
        } else {
            self.delete_matching(folder, &pattern)?
        };

        debug!(folder = %folder.display(), removed, "cleared records");
        Ok(())
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn provenance(&self) -> &Provenance {
        &self.provenance
    }
}
