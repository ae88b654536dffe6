//! Cross-process run lock.
//!
//! Only one pipeline run may execute at a time, across every process that
//! shares the state directory. The lock is an exclusive advisory file lock
//! taken with `fs2`; it is released when the guard is dropped, including
//! on unwinding.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::errors::LockError;

#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
}

/// Holds the run lock. Dropping it releases the lock.
pub struct RunLockGuard {
    _file: File,
    path: PathBuf,
}

impl RunLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        // Closing the file releases the flock.
        debug!("Releasing run lock: {}", self.path.display());
    }
}

impl std::fmt::Debug for RunLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLockGuard")
            .field("path", &self.path)
            .finish()
    }
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock without waiting.
    ///
    /// Returns `LockError::Busy` when another holder has it. Any other error
    /// is an I/O failure on the lock file itself.
    pub fn try_acquire(&self) -> Result<RunLockGuard, LockError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LockError::CreateFailed {
                path: self.path.clone(),
                source,
            })?;
        }

        let file = self.open()?;

        // Fully qualified: std's File::try_lock_exclusive has a different error type.
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                info!("Acquired run lock: {}", self.path.display());
                write_owner(&file, &self.path);
                Ok(RunLockGuard {
                    _file: file,
                    path: self.path.clone(),
                })
            }
            Err(e) if is_contended(&e) => {
                debug!("Run lock is held by another holder: {}", self.path.display());
                Err(LockError::Busy(self.path.clone()))
            }
            Err(e) => Err(LockError::AcquireFailed(e)),
        }
    }

    /// Report whether some holder currently has the lock.
    ///
    /// Takes and immediately releases a non-blocking lock; never waits.
    /// A missing lock file means nobody holds it.
    pub fn is_held(&self) -> Result<bool, LockError> {
        if !self.path.exists() {
            return Ok(false);
        }
        let file = self.open()?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                if let Err(e) = FileExt::unlock(&file) {
                    warn!("Failed to release lock probe on {}: {}", self.path.display(), e);
                }
                Ok(false)
            }
            Err(e) if is_contended(&e) => Ok(true),
            Err(e) => Err(LockError::AcquireFailed(e)),
        }
    }

    fn open(&self) -> Result<File, LockError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| LockError::CreateFailed {
                path: self.path.clone(),
                source,
            })
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Record the holder's pid in the lock file for operators. Best effort.
fn write_owner(file: &File, path: &Path) {
    let result = file.set_len(0).and_then(|_| {
        let mut handle = file;
        writeln!(handle, "{}", std::process::id())
    });
    if let Err(e) = result {
        debug!("Failed to write lock owner to {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path().join("runner.lock"));

        let guard = lock.try_acquire().expect("first acquire should succeed");
        assert_eq!(guard.path(), lock.path());
        drop(guard);

        let again = lock.try_acquire();
        assert!(again.is_ok(), "lock should be free after drop");
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path().join("runner.lock"));
        let other = RunLock::new(dir.path().join("runner.lock"));

        let _guard = lock.try_acquire().unwrap();
        match other.try_acquire() {
            Err(LockError::Busy(path)) => assert_eq!(path, lock.path()),
            other => panic!("Expected Busy, got {:?}", other),
        }
    }

    #[test]
    fn test_creates_missing_parent_directories() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path().join("storage/framework/cache/runner.lock"));
        let _guard = lock.try_acquire().unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn test_probe_reports_holder_without_taking_lock() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path().join("runner.lock"));

        assert!(!lock.is_held().unwrap(), "missing file means not held");

        let guard = lock.try_acquire().unwrap();
        assert!(lock.is_held().unwrap());
        drop(guard);

        assert!(!lock.is_held().unwrap());
        // The probe must not leave the lock taken.
        assert!(lock.try_acquire().is_ok());
    }

    #[test]
    fn test_unwritable_location_is_not_busy() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let lock = RunLock::new(blocker.join("runner.lock"));

        match lock.try_acquire() {
            Err(LockError::CreateFailed { .. }) => {}
            other => panic!("Expected CreateFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_lock_file_records_owner_pid() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path().join("runner.lock"));
        let _guard = lock.try_acquire().unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }
}
