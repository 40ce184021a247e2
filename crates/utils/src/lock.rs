//! Named advisory locks used to serialize access to a single cache key
//!
//! Backends never hold more than one lock at a time. A lock is taken right
//! before the medium access through [`KeyLock`] and released when the guard
//! is released or dropped, so every exit path gives it back.

use fs2::FileExt;
use kvcache_core::{Error, Result, LOCK_FILE_EXTENSION};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque token for a lock obtained from a [`LockManager`]
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct LockHandle {
    name: String,
    id: u64,
}

impl LockHandle {
    /// Name the lock was acquired under
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Provider of named mutual-exclusion locks
pub trait LockManager: Send + Sync {
    /// Block until the named lock is held by the caller
    fn acquire(&self, name: &str) -> Result<LockHandle>;

    /// Give back a lock obtained from [`LockManager::acquire`]
    fn release(&self, handle: LockHandle) -> Result<()>;

    /// Whether nobody, in this process or another, holds the named lock
    fn is_free(&self, name: &str) -> bool;

    /// Whether `handle` is still held through this manager
    fn is_acquired(&self, handle: &LockHandle) -> bool;
}

/// Scoped lock for one key; released on drop if not released explicitly
pub struct KeyLock<'a> {
    manager: &'a dyn LockManager,
    handle: Option<LockHandle>,
}

impl<'a> KeyLock<'a> {
    /// Acquire the named lock from `manager`
    pub fn acquire(manager: &'a dyn LockManager, name: &str) -> Result<Self> {
        let handle = manager.acquire(name)?;
        tracing::trace!(lock = name, "lock acquired");
        Ok(Self {
            manager,
            handle: Some(handle),
        })
    }

    /// Name of the held lock
    pub fn name(&self) -> Option<&str> {
        self.handle.as_ref().map(LockHandle::name)
    }

    /// Release the lock now, reporting a failed release
    pub fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.manager.release(handle),
            None => Ok(()),
        }
    }
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let name = handle.name.clone();
            if let Err(e) = self.manager.release(handle) {
                tracing::warn!(lock = %name, error = %e, "failed to release lock");
            }
        }
    }
}

/// Cross-process locks backed by `flock`-style advisory locks on files
/// named `<folder>/<name>.lock`.
///
/// Lock files are left in place after release, so the folder grows with
/// every key ever locked. [`FileLockManager::remove_idle_lock_files`] prunes
/// the ones nobody holds; an acquirer that ends up locking a pruned file
/// notices and locks the fresh one instead.
#[derive(Debug)]
pub struct FileLockManager {
    folder: PathBuf,
    held: Mutex<HashMap<u64, (String, File)>>,
    next_id: AtomicU64,
}

impl FileLockManager {
    /// Create a manager storing its lock files in `folder`
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            held: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Folder holding the lock files
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Path of the lock file used for `name`
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.folder.join(format!("{name}.{LOCK_FILE_EXTENSION}"))
    }

    fn open_lock_file(&self, name: &str) -> Result<File> {
        fs::create_dir_all(&self.folder)
            .map_err(|e| Error::file_system(&self.folder, "create lock folder", e))?;
        let path = self.lock_path(name);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::file_system(&path, "open lock file", e))
    }

    /// Delete lock files not held by anyone, returning how many went
    ///
    /// Each file is locked before it is unlinked, so a file in use is
    /// skipped.
    pub fn remove_idle_lock_files(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.folder) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::file_system(&self.folder, "list lock folder", e)),
        };
        let held: HashSet<String> = self
            .held
            .lock()
            .values()
            .map(|(name, _)| name.clone())
            .collect();

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(LOCK_FILE_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if held.contains(name) {
                continue;
            }
            let Ok(file) = File::open(&path) else {
                continue;
            };
            if file.try_lock_exclusive().is_err() {
                tracing::debug!(lock = name, "lock file in use, keeping it");
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "can not remove lock file")
                }
            }
            let _ = FileExt::unlock(&file);
        }
        tracing::debug!(folder = %self.folder.display(), removed, "idle lock files removed");
        Ok(removed)
    }
}

/// Whether `file` is still the one linked at `path`
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(open), Ok(linked)) => open.dev() == linked.dev() && open.ino() == linked.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

impl LockManager for FileLockManager {
    fn acquire(&self, name: &str) -> Result<LockHandle> {
        let path = self.lock_path(name);
        let file = loop {
            let file = self.open_lock_file(name)?;
            file.lock_exclusive()
                .map_err(|e| Error::lock(name, format!("exclusive lock failed: {e}")))?;
            if still_linked(&file, &path) {
                break file;
            }
            tracing::debug!(lock = name, "lock file was removed while waiting, retrying");
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.held.lock().insert(id, (name.to_string(), file));
        Ok(LockHandle {
            name: name.to_string(),
            id,
        })
    }

    fn release(&self, handle: LockHandle) -> Result<()> {
        let (_, file) = self
            .held
            .lock()
            .remove(&handle.id)
            .ok_or_else(|| Error::lock(&handle.name, "lock is not held by this manager"))?;
        FileExt::unlock(&file).map_err(|e| Error::lock(&handle.name, format!("unlock failed: {e}")))
    }

    fn is_free(&self, name: &str) -> bool {
        if self.held.lock().values().any(|(held, _)| held == name) {
            return false;
        }
        let path = self.lock_path(name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(_) => return false,
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                true
            }
            Err(_) => false,
        }
    }

    fn is_acquired(&self, handle: &LockHandle) -> bool {
        self.held.lock().contains_key(&handle.id)
    }
}

/// Locks that only exclude other users inside the current process
#[derive(Debug, Default)]
pub struct InProcessLockManager {
    held: Mutex<HashMap<String, u64>>,
    released: Condvar,
    next_id: AtomicU64,
}

impl InProcessLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names currently held
    pub fn held_names(&self) -> HashSet<String> {
        self.held.lock().keys().cloned().collect()
    }
}

impl LockManager for InProcessLockManager {
    fn acquire(&self, name: &str) -> Result<LockHandle> {
        let mut held = self.held.lock();
        while held.contains_key(name) {
            self.released.wait(&mut held);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        held.insert(name.to_string(), id);
        Ok(LockHandle {
            name: name.to_string(),
            id,
        })
    }

    fn release(&self, handle: LockHandle) -> Result<()> {
        let mut held = self.held.lock();
        match held.get(&handle.name) {
            Some(id) if *id == handle.id => {
                held.remove(&handle.name);
                self.released.notify_all();
                Ok(())
            }
            _ => Err(Error::lock(&handle.name, "lock is not held by this handle")),
        }
    }

    fn is_free(&self, name: &str) -> bool {
        !self.held.lock().contains_key(name)
    }

    fn is_acquired(&self, handle: &LockHandle) -> bool {
        self.held.lock().get(&handle.name) == Some(&handle.id)
    }
}
