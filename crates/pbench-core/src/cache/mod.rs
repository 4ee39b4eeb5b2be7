//! Archive and cache management for dataset tarballs.
//!
//! Four directory trees are involved:
//!
//! - ARCHIVE: `<archive>/<controller>/<resource_id>/<name>.tar.xz` plus its
//!   `.md5` sidecar. This is the permanent copy. Older tarballs may sit
//!   directly in the controller directory without a `<resource_id>` isolator.
//! - INCOMING: `<incoming>/<controller>/<name>/`, the unpacked contents.
//! - RESULTS: `<results>/<controller>/<name>`, a symlink into INCOMING.
//! - control: `<cache>/<resource_id>/{lock,last_ref}`.
//!
//! Reading unpacked content, including single members and directory
//! listings, takes the dataset's shared lock; unpack, uncache and delete take
//! it exclusively.

mod inventory;
pub mod lock;
mod subprocess;
pub mod tarball;
mod unpack;

pub use inventory::{CacheType, Inventory, InventoryStream};
pub use lock::{CacheLock, LockMode};
pub use tarball::{controller_from_metalog, parse_metalog, read_metalog, Tarball};
pub use unpack::unpacked_size;

use crate::config::{CacheConfig, ServerConfig};
use crate::dataset::Dataset;
use crate::hashing;
use crate::{PbenchError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Unpacked contents of a dataset, held open by a shared lock.
///
/// The tree stays in place at least until the reader is dropped.
#[derive(Debug)]
pub struct CacheReader {
    tarball: Tarball,
    root: PathBuf,
    lock: CacheLock,
}

impl CacheReader {
    /// Root of the unpacked `<name>/` tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tarball(&self) -> &Tarball {
        &self.tarball
    }

    fn into_lock(self) -> CacheLock {
        self.lock
    }
}

/// Manager for the ARCHIVE, INCOMING and RESULTS trees.
#[derive(Debug)]
pub struct CacheManager {
    archive_root: PathBuf,
    incoming_root: PathBuf,
    results_root: PathBuf,
    cache_root: PathBuf,
    unpack_timeout: Duration,
    /// Known tarballs by resource id.
    index: RwLock<BTreeMap<String, Tarball>>,
    discovered: AtomicBool,
}

impl CacheManager {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            archive_root: config.archive_root.clone(),
            incoming_root: config.incoming_root.clone(),
            results_root: config.results_root.clone(),
            cache_root: config.cache_root.clone(),
            unpack_timeout: config.unpack_timeout(),
            index: RwLock::new(BTreeMap::new()),
            discovered: AtomicBool::new(false),
        }
    }

    // ========================================
    // Path helpers
    // ========================================

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    /// Where a tarball is, or would be, unpacked.
    pub fn unpack_dir(&self, tarball: &Tarball) -> PathBuf {
        self.incoming_root
            .join(&tarball.controller)
            .join(&tarball.name)
    }

    pub fn results_link(&self, tarball: &Tarball) -> PathBuf {
        self.results_root
            .join(&tarball.controller)
            .join(&tarball.name)
    }

    fn control_dir(&self, resource_id: &str) -> PathBuf {
        self.cache_root.join(resource_id)
    }

    pub fn lock_path(&self, resource_id: &str) -> PathBuf {
        self.control_dir(resource_id)
            .join(CacheConfig::LOCK_FILE_NAME)
    }

    fn last_ref_path(&self, resource_id: &str) -> PathBuf {
        self.control_dir(resource_id)
            .join(CacheConfig::LAST_REF_FILE_NAME)
    }

    pub fn is_unpacked(&self, tarball: &Tarball) -> bool {
        self.unpack_dir(tarball).is_dir()
    }

    fn controller_dirs(&self) -> Result<Vec<PathBuf>> {
        Ok(unpack::subdirectories(&self.archive_root)?
            .into_iter()
            .filter(|d| d.file_name().and_then(|n| n.to_str()) != Some(CacheConfig::UPLOAD_DIR_NAME))
            .collect())
    }

    // ========================================
    // In-memory index
    // ========================================

    fn read_index(&self) -> RwLockReadGuard<'_, BTreeMap<String, Tarball>> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Tarball>> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_discovered(&self) -> Result<()> {
        if !self.discovered.load(Ordering::SeqCst) {
            self.full_discovery()?;
        }
        Ok(())
    }

    // ========================================
    // Discovery
    // ========================================

    /// Walk the whole ARCHIVE tree and rebuild the index.
    ///
    /// Returns the number of tarballs found. Entries that cannot be read are
    /// logged and skipped.
    pub fn full_discovery(&self) -> Result<usize> {
        let start = Instant::now();
        let mut found = BTreeMap::new();
        for controller_dir in self.controller_dirs()? {
            let controller = controller_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let entries = std::fs::read_dir(&controller_dir)
                .map_err(|e| PbenchError::io_with_path(e, &controller_dir))?;
            for entry in entries {
                let path = entry?.path();
                let tarball = if path.is_dir() {
                    Tarball::from_isolator(&controller, &path).map(|t| {
                        if t.is_none() {
                            debug!("Ignoring isolator without a tarball: {}", path.display());
                        }
                        t
                    })
                } else if Dataset::is_tarball(&path) {
                    Tarball::from_legacy(&controller, &path).map(Some)
                } else {
                    continue;
                };
                match tarball {
                    Ok(Some(tarball)) => {
                        found.insert(tarball.resource_id.clone(), tarball);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Unable to add {}: {}", path.display(), e),
                }
            }
        }

        let count = found.len();
        {
            let mut index = self.write_index();
            for (resource_id, tarball) in found.iter_mut() {
                if let Some(known) = index.get(resource_id) {
                    tarball.metalog = known.metalog.clone();
                }
            }
            *index = found;
        }
        self.discovered.store(true, Ordering::SeqCst);
        info!(
            "Discovered {} tarballs in {} ({:.3}s)",
            count,
            self.archive_root.display(),
            start.elapsed().as_secs_f64()
        );
        Ok(count)
    }

    /// Look for `<archive>/<controller>/<resource_id>/` without a full walk.
    fn locate(&self, resource_id: &str) -> Result<Option<Tarball>> {
        for controller_dir in self.controller_dirs()? {
            let isolator = controller_dir.join(resource_id);
            if !isolator.is_dir() {
                continue;
            }
            let controller = controller_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if let Some(tarball) = Tarball::from_isolator(&controller, &isolator)? {
                return Ok(Some(tarball));
            }
        }
        Ok(None)
    }

    /// Find a tarball by resource id, discovering the archive as needed.
    pub fn find_dataset(&self, resource_id: &str) -> Result<Tarball> {
        if let Some(tarball) = self.read_index().get(resource_id) {
            return Ok(tarball.clone());
        }
        if let Some(tarball) = self.locate(resource_id)? {
            debug!("Found {} by targeted discovery", tarball.tarball_path.display());
            self.write_index()
                .insert(resource_id.to_string(), tarball.clone());
            return Ok(tarball);
        }
        if !self.discovered.load(Ordering::SeqCst) {
            self.full_discovery()?;
            if let Some(tarball) = self.read_index().get(resource_id) {
                return Ok(tarball.clone());
            }
        }
        Err(PbenchError::TarballNotFound {
            resource_id: resource_id.to_string(),
        })
    }

    /// Every known tarball, ordered by resource id.
    pub fn datasets(&self) -> Result<Vec<Tarball>> {
        self.ensure_discovered()?;
        Ok(self.read_index().values().cloned().collect())
    }

    /// Names of the controller directories in the archive.
    pub fn controllers(&self) -> Result<Vec<String>> {
        Ok(self
            .controller_dirs()?
            .iter()
            .filter_map(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }

    // ========================================
    // Archive creation
    // ========================================

    /// Move a tarball and its MD5 sidecar into the archive.
    ///
    /// A sidecar beside the tarball is verified; if there is none, one is
    /// written. The controller comes from the tarball's `metadata.log`.
    pub fn create(&self, tarball_path: &Path) -> Result<Tarball> {
        if !Dataset::is_tarball(tarball_path) || !tarball_path.is_file() {
            return Err(PbenchError::BadFilename {
                path: tarball_path.to_path_buf(),
            });
        }
        let name = Dataset::stem(tarball_path)?;
        let file_name = format!("{}{}", name, CacheConfig::TARBALL_SUFFIX);
        let md5_source = tarball::md5_path_for(tarball_path);

        let resource_id = hashing::compute_md5(tarball_path)?;
        if md5_source.is_file() {
            let recorded = hashing::read_md5_file(&md5_source)?;
            if recorded != resource_id {
                return Err(PbenchError::HashMismatch {
                    expected: recorded,
                    actual: resource_id,
                });
            }
        } else {
            hashing::write_md5_file(&md5_source, &resource_id, &file_name)?;
        }

        let metalog = read_metalog(tarball_path, &name);
        let controller = controller_from_metalog(metalog.as_ref()).unwrap_or_else(|| {
            warn!(
                "{} has no controller name, assuming {:?}",
                name,
                CacheConfig::UNKNOWN_CONTROLLER
            );
            CacheConfig::UNKNOWN_CONTROLLER.to_string()
        });

        self.ensure_discovered()?;
        {
            let index = self.read_index();
            if index.contains_key(&resource_id) || index.values().any(|t| t.name == name) {
                return Err(PbenchError::DuplicateTarball { name });
            }
        }

        let isolator = self.archive_root.join(&controller).join(&resource_id);
        let destination = isolator.join(&file_name);
        let md5_destination = tarball::md5_path_for(&destination);
        if destination.exists() || md5_destination.exists() {
            return Err(PbenchError::DuplicateTarball { name });
        }
        std::fs::create_dir_all(&isolator).map_err(|e| PbenchError::io_with_path(e, &isolator))?;

        if let Err(e) = unpack::move_file(&md5_source, &md5_destination) {
            error!("Failed to move MD5 for {} ({}): {}", name, resource_id, e);
            unpack::delete_if_empty(&isolator);
            return Err(e);
        }
        if let Err(e) = unpack::move_file(tarball_path, &destination) {
            error!("Failed to move tarball {} ({}): {}", name, resource_id, e);
            if let Err(undo) = unpack::move_file(&md5_destination, &md5_source) {
                warn!("Unable to restore MD5 for {}: {}", name, undo);
                let _ = unpack::remove_file(&md5_destination);
            }
            unpack::delete_if_empty(&isolator);
            return Err(e);
        }

        let tarball = Tarball {
            name,
            resource_id: resource_id.clone(),
            controller,
            md5_path: md5_destination,
            tarball_path: destination,
            isolator: Some(isolator),
            metalog,
        };
        self.write_index().insert(resource_id, tarball.clone());
        info!(
            "Archived {} ({}) under controller {}",
            tarball.name, tarball.resource_id, tarball.controller
        );
        Ok(tarball)
    }

    // ========================================
    // Unpacked cache
    // ========================================

    /// Unpack a dataset under its exclusive lock and return the unpacked root.
    ///
    /// An already unpacked dataset is left as it is.
    pub fn unpack(&self, resource_id: &str) -> Result<PathBuf> {
        let tarball = self.find_dataset(resource_id)?;
        let lock = CacheLock::acquire(self.lock_path(resource_id), LockMode::Exclusive, true)?;
        self.ensure_still_archived(&tarball)?;
        let root = self.unpack_locked(&tarball)?;
        lock.release()?;
        Ok(root)
    }

    /// A deletion may have finished while the caller waited for the lock.
    fn ensure_still_archived(&self, tarball: &Tarball) -> Result<()> {
        if tarball.tarball_path.is_file() {
            Ok(())
        } else {
            Err(PbenchError::TarballNotFound {
                resource_id: tarball.resource_id.clone(),
            })
        }
    }

    /// Unpack while the caller holds the exclusive lock.
    fn unpack_locked(&self, tarball: &Tarball) -> Result<PathBuf> {
        let target = self.unpack_dir(tarball);
        let link = self.results_link(tarball);
        if !target.is_dir() {
            let start = Instant::now();
            unpack::extract(&tarball.tarball_path, &tarball.name, &target, self.unpack_timeout)?;
            if let Err(e) = unpack::link_results(&target, &link) {
                if let Err(cleanup) = unpack::remove_tree(&target) {
                    warn!("Unable to remove {}: {}", target.display(), cleanup);
                }
                return Err(e);
            }
            info!(
                "Unpacked {} ({}) in {:.3}s",
                tarball.name,
                tarball.resource_id,
                start.elapsed().as_secs_f64()
            );
        } else if link.symlink_metadata().is_err() {
            unpack::link_results(&target, &link)?;
        }
        unpack::touch(&self.last_ref_path(&tarball.resource_id))?;
        Ok(target)
    }

    /// Best guess at how much space unpacking will need.
    ///
    /// Uses `run.raw_size` from `metadata.log` when known, otherwise the
    /// compressed size.
    pub fn estimated_unpacked_size(&self, tarball: &Tarball) -> u64 {
        tarball
            .metalog
            .as_ref()
            .and_then(|m| m.get("run")?.get("raw_size")?.as_str()?.parse().ok())
            .or_else(|| tarball.size().ok())
            .unwrap_or(0)
    }

    /// Open a dataset's unpacked contents for reading, unpacking first if
    /// necessary.
    ///
    /// The returned reader holds the shared lock, so the tree cannot be
    /// uncached or deleted until it is dropped.
    pub fn get_results(&self, resource_id: &str) -> Result<CacheReader> {
        let tarball = self.find_dataset(resource_id)?;
        let mut lock = CacheLock::acquire(self.lock_path(resource_id), LockMode::Shared, true)?;
        self.ensure_still_archived(&tarball)?;
        let root = if self.is_unpacked(&tarball) {
            unpack::touch(&self.last_ref_path(resource_id))?;
            self.unpack_dir(&tarball)
        } else {
            lock.upgrade()?;
            let goal = self
                .estimated_unpacked_size(&tarball)
                .saturating_add(CacheConfig::RECLAIM_BYTES_PAD);
            if let Err(e) = self.reclaim_cache(0.0, goal) {
                warn!("Unable to reclaim space before unpacking {}: {}", tarball.name, e);
            }
            let unpacked = self.unpack_locked(&tarball);
            lock.downgrade()?;
            unpacked?
        };
        Ok(CacheReader {
            tarball,
            root,
            lock,
        })
    }

    // ========================================
    // Inventory
    // ========================================

    /// Open one member of a dataset for reading, unpacking it if needed.
    ///
    /// An empty path streams the archived tarball itself. A file member's
    /// stream keeps the shared lock until it is dropped; a directory gives
    /// no stream. Paths leading out of the dataset are refused.
    pub fn get_inventory(&self, resource_id: &str, path: &str) -> Result<Inventory> {
        if path.is_empty() {
            let tarball = self.find_dataset(resource_id)?;
            let file = File::open(&tarball.tarball_path)
                .map_err(|e| PbenchError::io_with_path(e, &tarball.tarball_path))?;
            return Ok(Inventory {
                name: format!("{}{}", tarball.name, CacheConfig::TARBALL_SUFFIX),
                kind: CacheType::File,
                stream: Some(InventoryStream::new(file, None)),
            });
        }

        let reader = self.get_results(resource_id)?;
        let artifact = self.member_path(&reader, path)?;
        if artifact.is_dir() {
            return Ok(Inventory {
                name: path.to_string(),
                kind: CacheType::Directory,
                stream: None,
            });
        }
        if !artifact.is_file() {
            return Err(PbenchError::CacheExtractBadPath {
                tarball: reader.tarball().tarball_path.clone(),
                path: path.to_string(),
            });
        }
        let file = File::open(&artifact).map_err(|e| PbenchError::io_with_path(e, &artifact))?;
        debug!("Serving {} from {}", path, reader.tarball().name);
        Ok(Inventory {
            name: path.to_string(),
            kind: CacheType::File,
            stream: Some(InventoryStream::new(file, Some(reader.into_lock()))),
        })
    }

    /// Describe a directory or member of a dataset, unpacking it if needed.
    ///
    /// Directories are listed one level deep. Symlinks are reported with
    /// their target, which is `BROKEN` when it leaves the dataset.
    pub fn get_contents(&self, resource_id: &str, path: &str) -> Result<Value> {
        let reader = self.get_results(resource_id)?;
        let artifact =
            inventory::contained_path(reader.root(), path).ok_or_else(|| {
                PbenchError::CacheExtractError {
                    dataset: reader.tarball().name.clone(),
                    path: path.to_string(),
                }
            })?;
        if artifact.symlink_metadata().is_err() {
            return Err(PbenchError::CacheExtractBadPath {
                tarball: reader.tarball().tarball_path.clone(),
                path: path.to_string(),
            });
        }
        inventory::describe(reader.root(), &artifact)
    }

    /// Read one member straight from the archived tarball, leaving the
    /// cache alone.
    pub fn extract(&self, resource_id: &str, path: &str) -> Result<Vec<u8>> {
        let tarball = self.find_dataset(resource_id)?;
        let name = Path::new(&tarball.name);
        let member = inventory::contained_path(name, path)
            .filter(|member| member.as_path() != name)
            .ok_or_else(|| PbenchError::CacheExtractError {
                dataset: tarball.name.clone(),
                path: path.to_string(),
            })?;
        inventory::extract_member(
            &tarball.tarball_path,
            &member.to_string_lossy(),
            self.unpack_timeout,
        )
    }

    /// Resolve a member path, refusing any that leads out of the unpacked
    /// tree, lexically or through a symlink.
    fn member_path(&self, reader: &CacheReader, path: &str) -> Result<PathBuf> {
        let escaped = || PbenchError::CacheExtractError {
            dataset: reader.tarball().name.clone(),
            path: path.to_string(),
        };
        let artifact = inventory::contained_path(reader.root(), path).ok_or_else(escaped)?;
        if artifact.exists() {
            let root = reader
                .root()
                .canonicalize()
                .map_err(|e| PbenchError::io_with_path(e, reader.root()))?;
            let resolved = artifact
                .canonicalize()
                .map_err(|e| PbenchError::io_with_path(e, &artifact))?;
            if !resolved.starts_with(&root) {
                return Err(escaped());
            }
        }
        Ok(artifact)
    }

    /// Remove a dataset's unpacked contents and results link.
    ///
    /// The archived tarball is untouched.
    pub fn uncache(&self, resource_id: &str) -> Result<()> {
        let tarball = self.find_dataset(resource_id)?;
        let lock = CacheLock::acquire(self.lock_path(resource_id), LockMode::Exclusive, true)?;
        self.uncache_locked(&tarball)?;
        lock.release()
    }

    fn uncache_locked(&self, tarball: &Tarball) -> Result<()> {
        unpack::remove_file(&self.results_link(tarball))?;
        let removed = unpack::remove_tree(&self.unpack_dir(tarball))?;
        unpack::delete_if_empty(&self.results_root.join(&tarball.controller));
        unpack::delete_if_empty(&self.incoming_root.join(&tarball.controller));
        if removed {
            info!("Uncached {} ({})", tarball.name, tarball.resource_id);
        }
        Ok(())
    }

    // ========================================
    // Deletion
    // ========================================

    /// Remove every trace of a dataset from the trees.
    ///
    /// An unknown resource id is not an error.
    pub fn delete(&self, resource_id: &str) -> Result<()> {
        self.delete_with(resource_id, || Ok(()))
    }

    /// Run `before` under the dataset's exclusive lock, then remove every
    /// trace of the dataset from the trees.
    ///
    /// Nothing is removed if `before` fails. For an unknown resource id only
    /// `before` runs.
    pub fn delete_with<T, F>(&self, resource_id: &str, before: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let tarball = match self.find_dataset(resource_id) {
            Ok(tarball) => tarball,
            Err(PbenchError::TarballNotFound { .. }) => {
                debug!("Nothing archived for {}", resource_id);
                return before();
            }
            Err(e) => return Err(e),
        };
        let lock = CacheLock::acquire(self.lock_path(resource_id), LockMode::Exclusive, true)?;
        let value = before()?;
        self.uncache_locked(&tarball)?;
        match &tarball.isolator {
            Some(isolator) => {
                unpack::remove_tree(isolator)?;
            }
            None => {
                unpack::remove_file(&tarball.md5_path)?;
                unpack::remove_file(&tarball.tarball_path)?;
            }
        }
        unpack::delete_if_empty(&self.archive_root.join(&tarball.controller));
        self.write_index().remove(resource_id);
        lock.release()?;
        unpack::remove_tree(&self.control_dir(resource_id))?;
        info!("Deleted {} ({}) from the archive", tarball.name, resource_id);
        Ok(value)
    }

    // ========================================
    // Reclaim
    // ========================================

    /// Evict unpacked datasets, least recently referenced first, until the
    /// INCOMING filesystem has both `goal_pct` percent and `goal_bytes`
    /// (rounded up to the next MiB) free.
    ///
    /// Locked caches are skipped. Returns whether the goal was reached.
    pub fn reclaim_cache(&self, goal_pct: f64, goal_bytes: u64) -> Result<bool> {
        std::fs::create_dir_all(&self.incoming_root)
            .map_err(|e| PbenchError::io_with_path(e, &self.incoming_root))?;
        let total = fs2::total_space(&self.incoming_root)
            .map_err(|e| PbenchError::io_with_path(e, &self.incoming_root))?;
        let free = || fs2::available_space(&self.incoming_root).unwrap_or(0);

        let pct_as_bytes = (total as f64 * goal_pct / 100.0).ceil() as u64;
        let bytes_rounded = goal_bytes.saturating_add(CacheConfig::MB_BYTES) / CacheConfig::MB_BYTES
            * CacheConfig::MB_BYTES;
        let goal = pct_as_bytes.max(bytes_rounded);
        if free() >= goal {
            return Ok(true);
        }

        self.ensure_discovered()?;
        let mut candidates: Vec<_> = self
            .read_index()
            .values()
            .filter(|t| self.is_unpacked(t))
            .map(|t| (unpack::modified(&self.last_ref_path(&t.resource_id)), t.clone()))
            .collect();
        candidates.sort_by_key(|(last_ref, _)| *last_ref);

        let cached = candidates.len();
        let mut reclaimed = 0usize;
        let mut failed = 0usize;
        let mut reached = false;
        for (_, tarball) in candidates {
            let lock = match CacheLock::acquire(
                self.lock_path(&tarball.resource_id),
                LockMode::Exclusive,
                false,
            ) {
                Ok(lock) => lock,
                Err(PbenchError::CacheLocked { .. }) => {
                    info!("RECLAIM: skipping {} because cache is locked", tarball.name);
                    continue;
                }
                Err(e) => {
                    error!("RECLAIM: {} failed with {}", tarball.name, e);
                    failed += 1;
                    continue;
                }
            };
            info!("RECLAIM: removing cache for {}", tarball.name);
            match self.uncache_locked(&tarball) {
                Ok(()) => reclaimed += 1,
                Err(e) => {
                    error!("RECLAIM: {} failed with {}", tarball.name, e);
                    failed += 1;
                }
            }
            drop(lock);
            if free() >= goal {
                reached = true;
                break;
            }
        }

        info!(
            "RECLAIM {} (goal {}%, {} bytes): {} cached, {} reclaimed, {} errors",
            if reached { "achieved" } else { "partial" },
            goal_pct,
            goal_bytes,
            cached,
            reclaimed,
            failed
        );
        Ok(reached)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs::File;
    use tempfile::TempDir;

    pub(crate) fn create_test_manager() -> (TempDir, ServerConfig, CacheManager) {
        let temp = TempDir::new().unwrap();
        let config = ServerConfig::with_top_dir(temp.path());
        config.ensure_directories().unwrap();
        let manager = CacheManager::new(&config);
        (temp, config, manager)
    }

    fn append(builder: &mut tar::Builder<GzEncoder<File>>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_mtime(1_700_000_000);
        builder.append_data(&mut header, path, data).unwrap();
    }

    /// Build `<dir>/<name>.tar.xz` holding `<name>/metadata.log` and one
    /// result file. The archive is gzip compressed; tar detects that on read.
    pub(crate) fn make_tarball(dir: &Path, name: &str, controller: Option<&str>) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(format!("{name}.tar.xz"));
        let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o700);
        header.set_mtime(1_700_000_000);
        builder
            .append_data(&mut header, format!("{name}/"), std::io::empty())
            .unwrap();

        let mut metalog = format!("[pbench]\nname = {name}\nscript = fio\n");
        if let Some(controller) = controller {
            metalog.push_str(&format!("\n[run]\ncontroller = {controller}\nraw_size = 4096\n"));
        }
        append(&mut builder, &format!("{name}/metadata.log"), metalog.as_bytes());
        append(
            &mut builder,
            &format!("{name}/1-default/result.json"),
            br#"{"iops": 1200}"#,
        );
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_create_and_find() {
        let (temp, config, manager) = create_test_manager();
        let source = make_tarball(&temp.path().join("staging"), "fio_run", Some("node1"));
        let expected = hashing::compute_md5(&source).unwrap();

        let tarball = manager.create(&source).unwrap();
        assert_eq!(tarball.resource_id, expected);
        assert_eq!(tarball.controller, "node1");
        assert_eq!(
            tarball.tarball_path,
            config
                .archive_root
                .join("node1")
                .join(&expected)
                .join("fio_run.tar.xz")
        );
        assert!(tarball.md5_path.is_file());
        assert!(!source.exists());
        assert_eq!(tarball.metalog.as_ref().unwrap()["pbench"]["script"], "fio");

        // A fresh manager finds it by targeted discovery
        let fresh = CacheManager::new(&config);
        let found = fresh.find_dataset(&expected).unwrap();
        assert_eq!(found.name, "fio_run");
        assert_eq!(found.tarball_path, tarball.tarball_path);
    }

    #[test]
    fn test_create_rejects_non_tarball() {
        let (temp, _config, manager) = create_test_manager();
        let sidecar = temp.path().join("run.tar.xz.md5");
        std::fs::write(&sidecar, "x").unwrap();
        assert!(matches!(
            manager.create(&sidecar),
            Err(PbenchError::BadFilename { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_create_duplicate() {
        let (temp, _config, manager) = create_test_manager();
        let first = make_tarball(&temp.path().join("one"), "fio_run", Some("node1"));
        let copy = temp.path().join("two").join("fio_run.tar.xz");
        std::fs::create_dir_all(copy.parent().unwrap()).unwrap();
        std::fs::copy(&first, &copy).unwrap();

        manager.create(&first).unwrap();
        assert!(matches!(
            manager.create(&copy),
            Err(PbenchError::DuplicateTarball { .. })
        ));
        assert!(copy.exists());
    }

    #[test]
    fn test_create_hash_mismatch() {
        let (temp, _config, manager) = create_test_manager();
        let source = make_tarball(&temp.path().join("staging"), "fio_run", Some("node1"));
        hashing::write_md5_file(
            tarball::md5_path_for(&source),
            "d41d8cd98f00b204e9800998ecf8427e",
            "fio_run.tar.xz",
        )
        .unwrap();
        assert!(matches!(
            manager.create(&source),
            Err(PbenchError::HashMismatch { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_controller_is_unknown() {
        let (temp, _config, manager) = create_test_manager();
        let source = make_tarball(&temp.path().join("staging"), "bare", None);
        let tarball = manager.create(&source).unwrap();
        assert_eq!(tarball.controller, CacheConfig::UNKNOWN_CONTROLLER);
    }

    #[test]
    fn test_find_unknown() {
        let (_temp, _config, manager) = create_test_manager();
        assert!(matches!(
            manager.find_dataset("d41d8cd98f00b204e9800998ecf8427e"),
            Err(PbenchError::TarballNotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_unpack_and_uncache_preserve_archive() {
        let (temp, config, manager) = create_test_manager();
        let source = make_tarball(&temp.path().join("staging"), "fio_run", Some("node1"));
        let tarball = manager.create(&source).unwrap();
        let before = std::fs::read(&tarball.tarball_path).unwrap();

        let root = manager.unpack(&tarball.resource_id).unwrap();
        assert_eq!(root, config.incoming_root.join("node1").join("fio_run"));
        assert!(root.join("1-default").join("result.json").is_file());
        let link = manager.results_link(&tarball);
        assert_eq!(std::fs::read_link(&link).unwrap(), root);
        assert!(config
            .cache_root
            .join(&tarball.resource_id)
            .join(CacheConfig::LAST_REF_FILE_NAME)
            .is_file());

        // A second unpack is a no-op
        assert_eq!(manager.unpack(&tarball.resource_id).unwrap(), root);

        manager.uncache(&tarball.resource_id).unwrap();
        assert!(!root.exists());
        assert!(link.symlink_metadata().is_err());
        assert!(!config.incoming_root.join("node1").exists());
        assert_eq!(std::fs::read(&tarball.tarball_path).unwrap(), before);
    }

    #[cfg(unix)]
    #[test]
    fn test_unpack_failure_leaves_no_tree() {
        let (temp, config, manager) = create_test_manager();
        let source = temp.path().join("staging").join("broken.tar.xz");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, b"this is not an archive").unwrap();
        let tarball = manager.create(&source).unwrap();

        let err = manager.unpack(&tarball.resource_id).unwrap_err();
        assert!(matches!(err, PbenchError::TarballUnpackError { .. }));
        let controller_dir = config.incoming_root.join(&tarball.controller);
        let leftovers: Vec<_> = std::fs::read_dir(&controller_dir)
            .map(|entries| entries.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_get_results_holds_shared_lock() {
        let (temp, _config, manager) = create_test_manager();
        let source = make_tarball(&temp.path().join("staging"), "fio_run", Some("node1"));
        let tarball = manager.create(&source).unwrap();

        let reader = manager.get_results(&tarball.resource_id).unwrap();
        assert!(reader.root().join("metadata.log").is_file());
        assert_eq!(reader.tarball().resource_id, tarball.resource_id);

        let lock = manager.lock_path(&tarball.resource_id);
        assert!(CacheLock::acquire(&lock, LockMode::Shared, false).is_ok());
        assert!(matches!(
            CacheLock::acquire(&lock, LockMode::Exclusive, false),
            Err(PbenchError::CacheLocked { .. })
        ));
        drop(reader);
        assert!(CacheLock::acquire(&lock, LockMode::Exclusive, false).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_get_inventory_holds_shared_lock() {
        use std::io::Read;
        let (temp, _config, manager) = create_test_manager();
        let source = make_tarball(&temp.path().join("staging"), "fio_run", Some("node1"));
        let tarball = manager.create(&source).unwrap();
        let rid = tarball.resource_id.clone();

        let mut inventory = manager
            .get_inventory(&rid, "1-default/result.json")
            .unwrap();
        assert_eq!(inventory.kind, CacheType::File);
        let mut text = String::new();
        inventory
            .stream
            .as_mut()
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, r#"{"iops": 1200}"#);

        // The open stream keeps the cache from being evicted
        let lock = manager.lock_path(&rid);
        assert!(matches!(
            CacheLock::acquire(&lock, LockMode::Exclusive, false),
            Err(PbenchError::CacheLocked { .. })
        ));
        drop(inventory);
        assert!(CacheLock::acquire(&lock, LockMode::Exclusive, false).is_ok());

        let dir = manager.get_inventory(&rid, "1-default").unwrap();
        assert_eq!(dir.kind, CacheType::Directory);
        assert!(dir.stream.is_none());
        assert!(CacheLock::acquire(&lock, LockMode::Exclusive, false).is_ok());

        let whole = manager.get_inventory(&rid, "").unwrap();
        assert_eq!(whole.name, "fio_run.tar.xz");
        assert_eq!(whole.kind, CacheType::File);
    }

    #[cfg(unix)]
    #[test]
    fn test_get_inventory_refuses_escapes_and_missing() {
        let (temp, config, manager) = create_test_manager();
        let source = make_tarball(&temp.path().join("staging"), "fio_run", Some("node1"));
        let tarball = manager.create(&source).unwrap();
        let rid = tarball.resource_id.clone();

        for path in ["../../../../etc/passwd", "/etc/passwd"] {
            assert!(matches!(
                manager.get_inventory(&rid, path),
                Err(PbenchError::CacheExtractError { .. })
            ));
        }
        // A symlink planted in the tree cannot lead out of it either
        let unpacked = config.incoming_root.join("node1").join("fio_run");
        std::os::unix::fs::symlink(temp.path(), unpacked.join("outside")).unwrap();
        assert!(matches!(
            manager.get_inventory(&rid, "outside"),
            Err(PbenchError::CacheExtractError { .. })
        ));
        assert!(matches!(
            manager.get_inventory(&rid, "missing.txt"),
            Err(PbenchError::CacheExtractBadPath { .. })
        ));
        assert!(matches!(
            manager.get_inventory("0123456789abcdef0123456789abcdef", "metadata.log"),
            Err(PbenchError::TarballNotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_get_contents() {
        let (temp, _config, manager) = create_test_manager();
        let source = make_tarball(&temp.path().join("staging"), "fio_run", Some("node1"));
        let tarball = manager.create(&source).unwrap();
        let rid = tarball.resource_id.clone();

        let root = manager.get_contents(&rid, "").unwrap();
        assert_eq!(root["type"], "DIRECTORY");
        assert_eq!(root["directories"][0]["name"], "1-default");
        assert_eq!(root["files"][0]["name"], "metadata.log");

        let file = manager.get_contents(&rid, "1-default/result.json").unwrap();
        assert_eq!(file["type"], "FILE");
        assert_eq!(file["size"], 14);
        assert_eq!(file["path"], "1-default/result.json");

        assert!(matches!(
            manager.get_contents(&rid, ".."),
            Err(PbenchError::CacheExtractError { .. })
        ));
        assert!(matches!(
            manager.get_contents(&rid, "nothing/here"),
            Err(PbenchError::CacheExtractBadPath { .. })
        ));
        // Nothing is held once the listing is returned
        assert!(CacheLock::acquire(manager.lock_path(&rid), LockMode::Exclusive, false).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_reads_the_archive() {
        let (temp, _config, manager) = create_test_manager();
        let source = make_tarball(&temp.path().join("staging"), "fio_run", Some("node1"));
        let tarball = manager.create(&source).unwrap();

        let data = manager
            .extract(&tarball.resource_id, "1-default/result.json")
            .unwrap();
        assert_eq!(data, br#"{"iops": 1200}"#);
        assert!(!manager.is_unpacked(&tarball));
        assert!(matches!(
            manager.extract(&tarball.resource_id, "missing.txt"),
            Err(PbenchError::CacheExtractBadPath { .. })
        ));
        assert!(matches!(
            manager.extract(&tarball.resource_id, "../escape"),
            Err(PbenchError::CacheExtractError { .. })
        ));
    }

    #[test]
    fn test_reclaim_with_unreachable_goal() {
        let (_temp, _config, manager) = create_test_manager();
        assert!(!manager.reclaim_cache(0.0, u64::MAX).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_delete() {
        let (temp, config, manager) = create_test_manager();
        let source = make_tarball(&temp.path().join("staging"), "fio_run", Some("node1"));
        let tarball = manager.create(&source).unwrap();
        manager.unpack(&tarball.resource_id).unwrap();

        manager.delete(&tarball.resource_id).unwrap();
        assert!(!tarball.tarball_path.exists());
        assert!(!config.archive_root.join("node1").exists());
        assert!(!config.incoming_root.join("node1").exists());
        assert!(!config.cache_root.join(&tarball.resource_id).exists());
        assert!(matches!(
            manager.find_dataset(&tarball.resource_id),
            Err(PbenchError::TarballNotFound { .. })
        ));

        // Deleting again is harmless
        manager.delete(&tarball.resource_id).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_full_discovery_includes_legacy_tarballs() {
        let (temp, config, manager) = create_test_manager();
        let source = make_tarball(&temp.path().join("staging"), "fio_run", Some("node1"));
        let isolated = manager.create(&source).unwrap();

        let legacy = make_tarball(&config.archive_root.join("node2"), "old_run", Some("node2"));
        let legacy_md5 = hashing::compute_md5(&legacy).unwrap();
        // Uploads in progress are not datasets
        make_tarball(&config.upload_root(), "partial", Some("node3"));

        let fresh = CacheManager::new(&config);
        assert_eq!(fresh.full_discovery().unwrap(), 2);
        let datasets = fresh.datasets().unwrap();
        assert!(datasets.iter().any(|t| t.resource_id == isolated.resource_id));
        let old = fresh.find_dataset(&legacy_md5).unwrap();
        assert_eq!(old.name, "old_run");
        assert!(old.isolator.is_none());
        assert_eq!(fresh.controllers().unwrap(), vec!["node1", "node2"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_reclaim_skips_locked_caches() {
        let (temp, config, manager) = create_test_manager();
        let staging = temp.path().join("staging");
        let busy = manager
            .create(&make_tarball(&staging, "busy_run", Some("node1")))
            .unwrap();
        let idle = manager
            .create(&make_tarball(&staging, "idle_run", Some("node1")))
            .unwrap();
        manager.unpack(&idle.resource_id).unwrap();
        let reader = manager.get_results(&busy.resource_id).unwrap();

        assert!(manager.reclaim_cache(0.0, 0).unwrap());
        assert!(manager.is_unpacked(&idle));

        // Asking for every byte of the filesystem can never be satisfied
        assert!(!manager.reclaim_cache(100.0, 0).unwrap());
        assert!(!manager.is_unpacked(&idle));
        assert!(manager.is_unpacked(&busy));
        assert!(reader.root().is_dir());
        assert!(config.archive_root.join("node1").exists());
    }
}
