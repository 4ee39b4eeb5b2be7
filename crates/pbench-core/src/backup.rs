//! Backup sinks for archived tarballs.
//!
//! A sink durably stores a copy of a tarball under a key and can verify the
//! stored copy against an MD5 digest. Failures are reported to the backup
//! driver, which leaves the dataset pending for a later pass.

use crate::hashing;
use crate::{PbenchError, Result};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Durable storage for tarball copies.
///
/// All operations are synchronous; drivers call them from blocking threads.
pub trait BackupSink: Send + Sync {
    /// Store a copy of `source` under `key`.
    fn put(&self, source: &Path, key: &str) -> Result<()>;

    /// Check that the copy under `key` exists and has the given MD5.
    fn verify(&self, key: &str, md5: &str) -> Result<bool>;
}

/// Backup sink on a local or mounted filesystem.
#[derive(Debug, Clone)]
pub struct FileBackupSink {
    root: PathBuf,
}

impl FileBackupSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key below the root; keys may not escape it.
    fn target(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(PbenchError::Backup {
                key: key.to_string(),
                message: "backup key must be a relative path without '..'".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

impl BackupSink for FileBackupSink {
    fn put(&self, source: &Path, key: &str) -> Result<()> {
        let target = self.target(key)?;
        let backup_error = |message: String| PbenchError::Backup {
            key: key.to_string(),
            message,
        };

        let parent = target
            .parent()
            .ok_or_else(|| backup_error(format!("{} has no parent", target.display())))?;
        std::fs::create_dir_all(parent).map_err(|e| PbenchError::io_with_path(e, parent))?;

        let mut input =
            std::fs::File::open(source).map_err(|e| PbenchError::io_with_path(e, source))?;
        let mut staged = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| PbenchError::io_with_path(e, parent))?;
        std::io::copy(&mut input, &mut staged)
            .map_err(|e| backup_error(format!("copy from {} failed: {}", source.display(), e)))?;
        staged.flush()?;
        staged
            .as_file()
            .sync_all()
            .map_err(|e| PbenchError::io_with_path(e, staged.path()))?;
        staged
            .persist(&target)
            .map_err(|e| backup_error(format!("unable to place {}: {}", target.display(), e)))?;
        debug!("Backed up {} to {}", source.display(), target.display());
        Ok(())
    }

    fn verify(&self, key: &str, md5: &str) -> Result<bool> {
        let target = self.target(key)?;
        if !target.is_file() {
            return Ok(false);
        }
        hashing::verify_md5(&target, md5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_and_verify() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("run.tar.xz");
        std::fs::write(&source, b"hello world").unwrap();
        let sink = FileBackupSink::new(temp.path().join("backup"));

        let key = "node1/5eb63bbbe01eeed093cb22bb8f5acdc3/run.tar.xz";
        assert!(!sink.verify(key, "5eb63bbbe01eeed093cb22bb8f5acdc3").unwrap());
        sink.put(&source, key).unwrap();
        assert!(sink.verify(key, "5eb63bbbe01eeed093cb22bb8f5acdc3").unwrap());
        assert!(!sink.verify(key, "d41d8cd98f00b204e9800998ecf8427e").unwrap());
        assert!(source.exists());

        // Overwriting an existing copy is allowed
        sink.put(&source, key).unwrap();
    }

    #[test]
    fn test_keys_cannot_escape_root() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("run.tar.xz");
        std::fs::write(&source, b"x").unwrap();
        let sink = FileBackupSink::new(temp.path().join("backup"));

        for key in ["../outside.tar.xz", "/etc/passwd", ""] {
            assert!(matches!(
                sink.put(&source, key),
                Err(PbenchError::Backup { .. })
            ));
        }
    }
}
