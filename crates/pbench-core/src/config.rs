//! Configuration for the Pbench Server core.
//!
//! Fixed values live in const structs; deployment-specific values live in
//! [`ServerConfig`], which is passed explicitly to every component.

use crate::{PbenchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Archive, cache and unpack constants.
pub struct CacheConfig;

impl CacheConfig {
    pub const TARBALL_SUFFIX: &'static str = ".tar.xz";
    pub const MD5_SUFFIX: &'static str = ".tar.xz.md5";
    /// Staging directory for uploads, at the same level as controller directories.
    pub const UPLOAD_DIR_NAME: &'static str = "UPLOAD";
    pub const LOCK_FILE_NAME: &'static str = "lock";
    pub const LAST_REF_FILE_NAME: &'static str = "last_ref";
    pub const METADATA_LOG_NAME: &'static str = "metadata.log";
    pub const UNKNOWN_CONTROLLER: &'static str = "unknown";

    // Subprocess stderr is capped before it is attached to an error
    pub const MAX_ERROR: usize = 5120;
    pub const TRUNC_PREFIX: &'static str = "[TRUNC]";

    pub const METADATA_READ_TIMEOUT: Duration = Duration::from_secs(60);
    pub const PROCESS_POLL_INITIAL: Duration = Duration::from_millis(20);
    pub const PROCESS_POLL_MAX: Duration = Duration::from_millis(500);

    pub const LOCK_RETRY_INITIAL: Duration = Duration::from_millis(50);
    pub const LOCK_RETRY_MAX: Duration = Duration::from_secs(2);

    pub const MB_BYTES: u64 = 1024 * 1024;
    /// Added to the expected unpacked size when reclaiming space for an unpack.
    pub const RECLAIM_BYTES_PAD: u64 = 1024;
    pub const COPY_CHUNK_SIZE: usize = 1024 * 1024;
}

/// SQLite connection settings.
pub struct DatabaseConfig;

impl DatabaseConfig {
    pub const BUSY_TIMEOUT_MS: u32 = 5000;
}

/// Metadata value limits.
pub struct MetadataConfig;

impl MetadataConfig {
    pub const MIN_NAME_LEN: usize = 1;
    pub const MAX_NAME_LEN: usize = 32;
}

fn default_max_retention_days() -> u32 {
    3650
}

fn default_unpack_timeout_secs() -> u64 {
    3600
}

fn default_index_batch_size() -> usize {
    500
}

/// Deployment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Permanent tarball archive root.
    pub archive_root: PathBuf,
    /// Root of unpacked dataset trees.
    pub incoming_root: PathBuf,
    /// Root of the results symlink tree.
    pub results_root: PathBuf,
    /// Per-dataset lock and reference markers.
    pub cache_root: PathBuf,
    /// Filesystem backup target; backups are disabled when absent.
    #[serde(default)]
    pub backup_root: Option<PathBuf>,
    /// SQLite database file.
    pub database: PathBuf,
    #[serde(default = "default_max_retention_days")]
    pub max_retention_days: u32,
    #[serde(default = "default_unpack_timeout_secs")]
    pub unpack_timeout_secs: u64,
    #[serde(default = "default_index_batch_size")]
    pub index_batch_size: usize,
}

impl ServerConfig {
    /// Conventional layout under a single top directory.
    pub fn with_top_dir(top: impl AsRef<Path>) -> Self {
        let top = top.as_ref();
        Self {
            archive_root: top.join("archive").join("fs-version-001"),
            incoming_root: top.join("incoming"),
            results_root: top.join("results"),
            cache_root: top.join(".cache"),
            backup_root: Some(top.join("backup")),
            database: top.join("pbench-server.db"),
            max_retention_days: default_max_retention_days(),
            unpack_timeout_secs: default_unpack_timeout_secs(),
            index_batch_size: default_index_batch_size(),
        }
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| PbenchError::io_with_path(e, path))?;
        let config: ServerConfig = serde_json::from_str(&text).map_err(|e| PbenchError::Json {
            message: format!("Failed to parse {}: {}", path.display(), e),
            source: Some(e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let roots = [
            ("archive-root", Some(&self.archive_root)),
            ("incoming-root", Some(&self.incoming_root)),
            ("results-root", Some(&self.results_root)),
            ("cache-root", Some(&self.cache_root)),
            ("backup-root", self.backup_root.as_ref()),
        ];
        for (name, root) in roots {
            if let Some(root) = root {
                if !root.is_absolute() {
                    return Err(PbenchError::Config {
                        message: format!("{} must be an absolute path: {}", name, root.display()),
                    });
                }
            }
        }
        if self.unpack_timeout_secs == 0 {
            return Err(PbenchError::Config {
                message: "unpack-timeout-secs must be positive".into(),
            });
        }
        if self.index_batch_size == 0 {
            return Err(PbenchError::Config {
                message: "index-batch-size must be positive".into(),
            });
        }
        Ok(())
    }

    /// Create every configured root directory.
    pub fn ensure_directories(&self) -> Result<()> {
        let mut roots = vec![
            self.archive_root.clone(),
            self.archive_root.join(CacheConfig::UPLOAD_DIR_NAME),
            self.incoming_root.clone(),
            self.results_root.clone(),
            self.cache_root.clone(),
        ];
        roots.extend(self.backup_root.clone());
        for dir in roots {
            std::fs::create_dir_all(&dir).map_err(|e| PbenchError::io_with_path(e, &dir))?;
        }
        Ok(())
    }

    pub fn upload_root(&self) -> PathBuf {
        self.archive_root.join(CacheConfig::UPLOAD_DIR_NAME)
    }

    pub fn unpack_timeout(&self) -> Duration {
        Duration::from_secs(self.unpack_timeout_secs)
    }
}
