use kvcache_core::{APP_DIR_NAME, DEFAULT_LOCK_FOLDER_NAME};
use std::env;
use std::path::PathBuf;

/// XDG Base Directory paths for kvcache
pub struct XdgPaths;

impl XdgPaths {
    /// Get XDG_DATA_HOME/kvcache or fallback
    pub fn data_dir() -> PathBuf {
        env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|home| home.join(".local/share"))
                    .unwrap_or_else(|| PathBuf::from(".local/share"))
            })
            .join(APP_DIR_NAME)
    }

    /// Folder used by the temporary storage tier
    pub fn temporary_dir() -> PathBuf {
        env::temp_dir()
    }

    /// Folder used by the persistent storage tier
    pub fn persistent_dir() -> PathBuf {
        Self::data_dir()
    }

    /// Default folder for lock files
    pub fn lock_dir() -> PathBuf {
        env::temp_dir().join(DEFAULT_LOCK_FOLDER_NAME)
    }
}
