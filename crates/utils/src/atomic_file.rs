//! Atomic file operations to prevent partially written cache files

use kvcache_core::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::{Builder, NamedTempFile};

/// Write `content` to `path` atomically with owner-only permissions.
///
/// The data goes to a temporary file in the destination directory first, which
/// is then renamed over `path`. The destination directory must already exist.
/// On any failure the temporary file is removed and `path` is left untouched.
pub fn write_atomic_private(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::configuration(format!(
            "invalid file path '{}': no parent directory",
            path.display()
        ))
    })?;

    // Dropping the NamedTempFile on an early return deletes it.
    let mut temp = Builder::new()
        .prefix(".kv")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| Error::file_system(parent, "create temporary file", e))?;

    write_contents(&mut temp, content)?;
    restrict_to_owner(temp.path())?;

    temp.persist(path)
        .map_err(|e| Error::file_system(path, "atomic rename", e.error))?;

    Ok(())
}

fn write_contents(temp: &mut NamedTempFile, content: &[u8]) -> Result<()> {
    let temp_path = temp.path().to_path_buf();
    temp.write_all(content)
        .map_err(|e| Error::file_system(&temp_path, "write to temporary file", e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| Error::file_system(&temp_path, "sync temporary file", e))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::file_system(path, "set permissions", e))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}

/// Create a single directory level with group-shared permissions.
///
/// Unlike `create_dir_all`, a missing parent is reported as an error rather
/// than created implicitly. An existing directory is not an error.
pub fn create_dir_single(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(Error::file_system(
                parent,
                "locate parent directory",
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("folder {} does not exist", parent.display()),
                ),
            ));
        }
    }

    match fs::create_dir(path) {
        Ok(()) => {}
        // Another writer created it between the check and here
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
        Err(e) => return Err(Error::file_system(path, "create directory", e)),
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o770)) {
            tracing::warn!(path = %path.display(), error = %e, "could not set directory permissions");
        }
    }

    Ok(())
}
