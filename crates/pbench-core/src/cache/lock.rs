//! Per-dataset advisory file locks.
//!
//! Readers of unpacked content take a shared lock; unpack, uncache and
//! delete take an exclusive lock. Locks are `flock`-style via `fs2`, so two
//! handles conflict even within one process. Calls go through `FileExt`
//! explicitly because `std::fs::File` now has inherent methods with the
//! same names.

use crate::config::CacheConfig;
use crate::{PbenchError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A held cache lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
    locked: bool,
}

/// The name reported when a lock is contended: the resource id for
/// `cache/<resource_id>/lock`, otherwise the lock file stem.
fn lock_label(path: &Path) -> String {
    let named = |p: Option<&std::ffi::OsStr>| {
        p.map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    if path.file_name().and_then(|n| n.to_str()) == Some(CacheConfig::LOCK_FILE_NAME) {
        named(path.parent().and_then(|p| p.file_name()))
    } else {
        named(path.file_stem())
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
        || err.kind() == std::io::ErrorKind::WouldBlock
}

impl CacheLock {
    /// Acquire a lock, creating the lock file if needed.
    ///
    /// With `wait == false`, contention fails immediately with
    /// `CacheLocked` instead of blocking.
    pub fn acquire(path: impl AsRef<Path>, mode: LockMode, wait: bool) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PbenchError::io_with_path(e, parent))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| PbenchError::io_with_path(e, path))?;

        let locked = match (mode, wait) {
            (LockMode::Shared, true) => FileExt::lock_shared(&file),
            (LockMode::Exclusive, true) => FileExt::lock_exclusive(&file),
            (LockMode::Shared, false) => FileExt::try_lock_shared(&file),
            (LockMode::Exclusive, false) => FileExt::try_lock_exclusive(&file),
        };
        if let Err(e) = locked {
            if is_contended(&e) {
                return Err(PbenchError::CacheLocked {
                    resource_id: lock_label(path),
                });
            }
            return Err(PbenchError::io_with_path(e, path));
        }

        debug!("Acquired {:?} lock {}", mode, path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode,
            locked: true,
        })
    }

    /// Retry a non-blocking acquire with exponential backoff until `deadline`
    /// has elapsed.
    pub fn acquire_with_backoff(
        path: impl AsRef<Path>,
        mode: LockMode,
        deadline: Duration,
    ) -> Result<Self> {
        let path = path.as_ref();
        let start = Instant::now();
        let mut delay = CacheConfig::LOCK_RETRY_INITIAL;
        loop {
            match Self::acquire(path, mode, false) {
                Err(PbenchError::CacheLocked { resource_id }) => {
                    if start.elapsed() >= deadline {
                        warn!("Gave up waiting for lock {}", path.display());
                        return Err(PbenchError::CacheLocked { resource_id });
                    }
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(CacheConfig::LOCK_RETRY_MAX);
                }
                other => return other,
            }
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Convert a shared lock to exclusive, waiting for other readers.
    pub fn upgrade(&mut self) -> Result<()> {
        if self.mode == LockMode::Exclusive {
            return Ok(());
        }
        FileExt::lock_exclusive(&self.file)
            .map_err(|e| PbenchError::io_with_path(e, &self.path))?;
        self.mode = LockMode::Exclusive;
        Ok(())
    }

    /// Convert an exclusive lock to shared.
    pub fn downgrade(&mut self) -> Result<()> {
        if self.mode == LockMode::Shared {
            return Ok(());
        }
        FileExt::lock_shared(&self.file)
            .map_err(|e| PbenchError::io_with_path(e, &self.path))?;
        self.mode = LockMode::Shared;
        Ok(())
    }

    /// Release explicitly, reporting any unlock failure.
    pub fn release(mut self) -> Result<()> {
        self.locked = false;
        FileExt::unlock(&self.file)
            .map_err(|e| PbenchError::io_with_path(e, &self.path))
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = FileExt::unlock(&self.file) {
                warn!("Failed to release lock {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_path(temp: &TempDir) -> PathBuf {
        temp.path().join("abc123").join(CacheConfig::LOCK_FILE_NAME)
    }

    #[test]
    fn test_shared_locks_coexist() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(&temp);
        let first = CacheLock::acquire(&path, LockMode::Shared, false).unwrap();
        let second = CacheLock::acquire(&path, LockMode::Shared, false).unwrap();
        assert_eq!(first.mode(), LockMode::Shared);
        drop(second);
        drop(first);
    }

    #[test]
    fn test_exclusive_locks_conflict() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(&temp);
        let held = CacheLock::acquire(&path, LockMode::Exclusive, false).unwrap();
        match CacheLock::acquire(&path, LockMode::Exclusive, false) {
            Err(PbenchError::CacheLocked { resource_id }) => assert_eq!(resource_id, "abc123"),
            other => panic!("expected CacheLocked, got {other:?}"),
        }
        assert!(CacheLock::acquire(&path, LockMode::Shared, false).is_err());
        held.release().unwrap();
        assert!(CacheLock::acquire(&path, LockMode::Exclusive, false).is_ok());
    }

    #[test]
    fn test_shared_blocks_exclusive() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(&temp);
        let reader = CacheLock::acquire(&path, LockMode::Shared, false).unwrap();
        assert!(matches!(
            CacheLock::acquire(&path, LockMode::Exclusive, false),
            Err(PbenchError::CacheLocked { .. })
        ));
        drop(reader);
        assert!(CacheLock::acquire(&path, LockMode::Exclusive, false).is_ok());
    }

    #[test]
    fn test_concurrent_exclusive_never_both_succeed() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(&temp);
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    CacheLock::acquire(&path, LockMode::Exclusive, false).ok()
                })
            })
            .collect();
        let held: Vec<CacheLock> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert!(held.len() <= 1);
    }

    #[test]
    fn test_upgrade_and_downgrade() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(&temp);
        let mut lock = CacheLock::acquire(&path, LockMode::Shared, true).unwrap();
        lock.upgrade().unwrap();
        assert_eq!(lock.mode(), LockMode::Exclusive);
        assert!(CacheLock::acquire(&path, LockMode::Shared, false).is_err());

        lock.downgrade().unwrap();
        assert_eq!(lock.mode(), LockMode::Shared);
        assert!(CacheLock::acquire(&path, LockMode::Shared, false).is_ok());
    }

    #[test]
    fn test_backoff_gives_up() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(&temp);
        let _held = CacheLock::acquire(&path, LockMode::Exclusive, true).unwrap();
        let start = Instant::now();
        let result =
            CacheLock::acquire_with_backoff(&path, LockMode::Exclusive, Duration::from_millis(120));
        assert!(matches!(result, Err(PbenchError::CacheLocked { .. })));
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn test_backoff_succeeds_after_release() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(&temp);
        let held = CacheLock::acquire(&path, LockMode::Exclusive, true).unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            drop(held);
        });
        let lock =
            CacheLock::acquire_with_backoff(&path, LockMode::Exclusive, Duration::from_secs(5))
                .unwrap();
        assert_eq!(lock.mode(), LockMode::Exclusive);
        releaser.join().unwrap();
    }

    #[test]
    fn test_lock_label() {
        assert_eq!(lock_label(Path::new("/c/abc/lock")), "abc");
        assert_eq!(lock_label(Path::new("/a/UPLOAD/def.lock")), "def");
    }
}
