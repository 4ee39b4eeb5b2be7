//! Dataset upload intake.
//!
//! An upload streams a tarball into a staging directory below
//! `archive/UPLOAD`, checks its MD5, creates the dataset row and hands the
//! tarball to the [`CacheManager`]. Once archived, the dataset is
//! `UPLOADED` and pending `UNPACK` (and `BACKUP` when backups are
//! configured). A failure after the row exists removes the row again, along
//! with any archived copy.

use crate::cache::{CacheLock, CacheManager, LockMode, Tarball};
use crate::config::{CacheConfig, ServerConfig};
use crate::dataset::{Access, Dataset, DatasetStore, NewDataset, State};
use crate::db::Database;
use crate::hashing;
use crate::identity::IdentityProvider;
use crate::metadata::{keys, MetadataStore};
use crate::sync::{Operation, SyncTracker};
use crate::{PbenchError, Result};
use chrono::Duration;
use md5::{Digest, Md5};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Client parameters of one upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Tarball file name, `<name>.tar.xz`.
    pub filename: String,
    /// Expected MD5 of the body; becomes the resource id.
    pub md5: String,
    pub access: Access,
    /// Client-writable metadata to set on the new dataset.
    pub metadata: BTreeMap<String, Value>,
}

impl UploadRequest {
    pub fn new(filename: impl Into<String>, md5: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            md5: md5.into(),
            access: Access::Private,
            metadata: BTreeMap::new(),
        }
    }
}

/// Upload intake service.
pub struct Intake {
    registrar: Registrar,
    identity: Arc<dyn IdentityProvider>,
    upload_root: PathBuf,
}

/// The blocking half of an upload: database rows, metadata and the archive.
#[derive(Clone)]
struct Registrar {
    datasets: DatasetStore,
    metadata: MetadataStore,
    sync: SyncTracker,
    cache: Arc<CacheManager>,
    max_retention_days: u32,
    backup_enabled: bool,
}

/// An upload lock that also removes its lock file when dropped, whichever
/// way the upload ends.
struct UploadLock {
    lock: Option<CacheLock>,
    path: PathBuf,
}

impl UploadLock {
    fn acquire(path: PathBuf, resource_id: &str) -> Result<Self> {
        let lock = CacheLock::acquire(&path, LockMode::Exclusive, false).map_err(|e| match e {
            PbenchError::CacheLocked { .. } => PbenchError::UploadInProgress {
                resource_id: resource_id.to_string(),
            },
            other => other,
        })?;
        Ok(Self {
            lock: Some(lock),
            path,
        })
    }
}

impl Drop for UploadLock {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.release() {
                warn!("Unable to release upload lock {}: {}", self.path.display(), e);
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Upload lock {} not removed: {}", self.path.display(), e);
        }
    }
}

/// Run synchronous database and filesystem work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

impl Intake {
    pub fn new(
        config: &ServerConfig,
        db: Database,
        cache: Arc<CacheManager>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            registrar: Registrar {
                datasets: DatasetStore::new(db.clone()),
                metadata: MetadataStore::from_config(db.clone(), config),
                sync: SyncTracker::new(db, "upload"),
                cache,
                max_retention_days: config.max_retention_days,
                backup_enabled: config.backup_root.is_some(),
            },
            identity,
            upload_root: config.upload_root(),
        }
    }

    /// Accept one tarball upload and return the new `UPLOADED` dataset.
    pub async fn upload<R>(
        &self,
        credential: &str,
        request: UploadRequest,
        mut body: R,
    ) -> Result<Dataset>
    where
        R: AsyncRead + Unpin,
    {
        let user = self.identity.verify(credential)?;
        validate_filename(&request.filename)?;
        let md5 = request.md5.trim().to_lowercase();
        if !hashing::is_md5(&md5) {
            return Err(PbenchError::DatasetBadParameterType {
                value: request.md5.clone(),
                expected: "MD5 hash".to_string(),
            });
        }
        for key in request.metadata.keys() {
            if !keys::is_key_path(key, &keys::METADATA_KEYS) {
                return Err(PbenchError::MetadataBadKey { key: key.clone() });
            }
            if !keys::is_user_updateable(key) {
                return Err(PbenchError::MetadataProtectedKey { key: key.clone() });
            }
        }

        let registrar = self.registrar.clone();
        let upload_root = self.upload_root.clone();
        let resource_id = md5.clone();
        let (lock, staging) = blocking(move || registrar.prepare(&upload_root, &resource_id)).await?;

        let staged = staging.path().join(&request.filename);
        let (actual, bytes) = receive(&mut body, &staged).await?;
        if actual != md5 {
            return Err(PbenchError::HashMismatch {
                expected: md5,
                actual,
            });
        }
        debug!("Received {} ({} bytes) for {}", request.filename, bytes, user);

        let registrar = self.registrar.clone();
        let dataset = blocking(move || {
            let dataset = registrar.register(&staged, &md5, &request, &user)?;
            drop(staging);
            drop(lock);
            Ok(dataset)
        })
        .await?;
        info!("Uploaded {} for {}", dataset, dataset.owner_id);
        Ok(dataset)
    }
}

impl Registrar {
    /// Refuse a known resource id, then take the upload lock and a staging
    /// directory.
    fn prepare(&self, upload_root: &Path, md5: &str) -> Result<(UploadLock, TempDir)> {
        match self.datasets.query_by_resource_id(md5) {
            Ok(_) => {
                return Err(PbenchError::DatasetDuplicate {
                    resource_id: md5.to_string(),
                })
            }
            Err(PbenchError::DatasetNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        std::fs::create_dir_all(upload_root)
            .map_err(|e| PbenchError::io_with_path(e, upload_root))?;
        let lock = UploadLock::acquire(upload_root.join(format!("{md5}.lock")), md5)?;
        let staging = tempfile::Builder::new()
            .prefix(".intake-")
            .tempdir_in(upload_root)
            .map_err(|e| PbenchError::io_with_path(e, upload_root))?;
        Ok((lock, staging))
    }

    /// Create the dataset row and archive the staged tarball. Any failure
    /// removes the row again.
    fn register(
        &self,
        staged: &Path,
        md5: &str,
        request: &UploadRequest,
        user: &str,
    ) -> Result<Dataset> {
        hashing::write_md5_file(
            crate::cache::tarball::md5_path_for(staged),
            md5,
            &request.filename,
        )?;
        let mut dataset = self.datasets.create(NewDataset {
            owner_id: user.to_string(),
            name: validate_filename(&request.filename)?,
            resource_id: md5.to_string(),
            access: request.access,
            created: None,
        })?;
        if let Err(e) = self.archive(&mut dataset, staged, request, user) {
            warn!("Upload of {} failed, removing it: {}", dataset, e);
            if let Err(cleanup) = self.datasets.delete(&dataset) {
                warn!("Unable to remove dataset {}: {}", dataset, cleanup);
            }
            return Err(e);
        }
        Ok(dataset)
    }

    /// Archive the staged tarball and finish the dataset. The archive copy
    /// is removed again if the dataset cannot be finished.
    fn archive(
        &self,
        dataset: &mut Dataset,
        staged: &Path,
        request: &UploadRequest,
        user: &str,
    ) -> Result<()> {
        let tarball = self.cache.create(staged)?;
        if let Err(e) = self.record(dataset, &tarball, request, user) {
            if let Err(cleanup) = self.cache.delete(&tarball.resource_id) {
                warn!("Unable to remove archived {}: {}", tarball.name, cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    fn record(
        &self,
        dataset: &mut Dataset,
        tarball: &Tarball,
        request: &UploadRequest,
        user: &str,
    ) -> Result<()> {
        self.metadata.set_value(
            dataset,
            keys::TARBALL_PATH,
            Value::String(tarball.tarball_path.display().to_string()),
            None,
        )?;
        let retention = dataset.uploaded + Duration::days(i64::from(self.max_retention_days));
        self.metadata.set_value(
            dataset,
            keys::DELETION,
            Value::String(retention.to_rfc3339()),
            None,
        )?;
        if let Some(metalog) = &tarball.metalog {
            self.metadata
                .set_native(dataset, keys::METALOG, metalog, None)?;
        }
        for (key, value) in &request.metadata {
            self.metadata
                .set_user_value(dataset, key, value.clone(), Some(user))?;
        }

        self.datasets.advance(dataset, State::Uploaded)?;
        let mut enabled = vec![Operation::Unpack];
        if self.backup_enabled {
            enabled.push(Operation::Backup);
        }
        self.sync.update(dataset, None, &enabled, None)
    }
}

/// The dataset name of an upload file name, which must be a bare
/// `<name>.tar.xz`.
fn validate_filename(filename: &str) -> Result<String> {
    let path = Path::new(filename);
    let bare = path.file_name().and_then(|n| n.to_str()) == Some(filename);
    if !bare || !Dataset::is_tarball(path) {
        return Err(PbenchError::BadFilename {
            path: path.to_path_buf(),
        });
    }
    Dataset::stem(path).map_err(|_| PbenchError::BadFilename {
        path: path.to_path_buf(),
    })
}

/// Stream the body to `target`, returning its MD5 and length.
async fn receive<R>(body: &mut R, target: &Path) -> Result<(String, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(target)
        .await
        .map_err(|e| PbenchError::io_with_path(e, target))?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; CacheConfig::COPY_CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let read = body.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        file.write_all(&buffer[..read])
            .await
            .map_err(|e| PbenchError::io_with_path(e, target))?;
        total += read as u64;
    }
    file.flush()
        .await
        .map_err(|e| PbenchError::io_with_path(e, target))?;
    file.sync_all()
        .await
        .map_err(|e| PbenchError::io_with_path(e, target))?;
    Ok((hex::encode(hasher.finalize()), total))
}
