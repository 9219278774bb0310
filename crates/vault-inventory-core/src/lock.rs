//! Exclusive ownership of an output target for the lifetime of a run.
//!
//! The lock file sits next to the output it guards, so runs with different
//! checkpoint directories still contend for the same target. Two spellings
//! of one target (`inv.json`, `./inv.json`) resolve to the same lock.

use crate::error::Error;
use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Held for the whole run. Dropping it releases the lock.
pub struct RunLock {
    _file: File,
    lock_path: PathBuf,
    owner_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct LockOwner {
    pid: u32,
    output: String,
    acquired_at: String,
}

impl RunLock {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        debug!("Releasing run lock {}", self.lock_path.display());
        if let Some(path) = &self.owner_path {
            if let Err(e) = fs::remove_file(path) {
                debug!("Failed to remove lock owner file {}: {}", path.display(), e);
            }
        }
    }
}

/// Absolute form of `output` with `.` and `..` resolved. The parent
/// directory is canonicalized when it exists, so symlinked spellings agree.
pub fn output_identity(output: &Path) -> PathBuf {
    let joined = if output.is_absolute() {
        output.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(output))
            .unwrap_or_else(|_| output.to_path_buf())
    };

    let mut lexical = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if lexical.parent().is_some() {
                    lexical.pop();
                }
            }
            other => lexical.push(other),
        }
    }

    match (lexical.parent(), lexical.file_name()) {
        (Some(parent), Some(name)) => match fs::canonicalize(parent) {
            Ok(parent) => parent.join(name),
            Err(_) => lexical,
        },
        _ => lexical,
    }
}

/// `<output dir>/.<output name>.lock`
pub fn lock_path_for(output: &Path) -> PathBuf {
    let identity = output_identity(output);
    let name = identity
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "inventory".to_string());
    let dir = identity.parent().map(Path::to_path_buf).unwrap_or_default();
    dir.join(format!(".{}.lock", name))
}

/// Non-blocking. Fails with `Error::Locked` when another run owns `output`.
pub fn try_lock_run(output: &Path) -> Result<RunLock, Error> {
    let lock_path = lock_path_for(output);
    if let Some(dir) = lock_path.parent() {
        fs::create_dir_all(dir)?;
    }
    debug!("Attempting to acquire run lock {}", lock_path.display());

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            info!("Acquired run lock {}", lock_path.display());
            let owner_path = write_owner(&lock_path, output);
            Ok(RunLock {
                _file: file,
                lock_path,
                owner_path,
            })
        }
        Err(e) if is_contended(&e) => Err(Error::Locked(lock_path)),
        Err(e) => Err(Error::Io(e)),
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn write_owner(lock_path: &Path, output: &Path) -> Option<PathBuf> {
    let owner = LockOwner {
        pid: std::process::id(),
        output: output.display().to_string(),
        acquired_at: Utc::now().to_rfc3339(),
    };
    let owner_path = lock_path.with_extension("lock.json");
    match serde_json::to_vec_pretty(&owner)
        .map_err(io::Error::from)
        .and_then(|payload| fs::write(&owner_path, payload))
    {
        Ok(()) => Some(owner_path),
        Err(e) => {
            warn!(
                "Failed to write lock owner file {}: {}",
                owner_path.display(),
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_lock_on_same_output_is_refused() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("inventory.json");

        let held = try_lock_run(&output).unwrap();
        let second = try_lock_run(&output);
        assert!(matches!(second, Err(Error::Locked(_))));

        drop(held);
        assert!(try_lock_run(&output).is_ok());
    }

    #[test]
    fn test_different_outputs_do_not_contend() {
        let dir = tempdir().unwrap();
        let _a = try_lock_run(&dir.path().join("a.json")).unwrap();
        let b = try_lock_run(&dir.path().join("b.json"));
        assert!(b.is_ok());
    }

    #[test]
    fn test_spellings_of_one_output_share_a_lock() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        let plain = dir.path().join("inv.json");
        let dotted = dir.path().join(".").join("inv.json");
        let detour = dir.path().join("sub").join("..").join("inv.json");

        assert_eq!(output_identity(&plain), output_identity(&dotted));
        assert_eq!(output_identity(&plain), output_identity(&detour));

        let _held = try_lock_run(&plain).unwrap();
        assert!(matches!(try_lock_run(&dotted), Err(Error::Locked(_))));
        assert!(matches!(try_lock_run(&detour), Err(Error::Locked(_))));
    }

    #[test]
    fn test_lock_sits_beside_output() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("inventory.json");
        let lock = try_lock_run(&output).unwrap();
        assert_eq!(
            lock.lock_path().parent(),
            output_identity(&output).parent()
        );
        assert!(lock.lock_path().ends_with(".inventory.json.lock"));
    }

    #[test]
    fn test_owner_file_removed_on_release() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("inventory.json");
        let lock = try_lock_run(&output).unwrap();
        let owner = lock.lock_path().with_extension("lock.json");
        assert!(owner.exists());
        drop(lock);
        assert!(!owner.exists());
    }
}
