//! Extraction of a tarball into the INCOMING tree.
//!
//! Extraction happens in a staging directory beside the final location so
//! that a failed or interrupted unpack never leaves a partial tree where
//! readers look for one. The staging directory is removed on every path.

use super::subprocess::run_command;
use crate::{PbenchError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Extract `tarball_path` so that its top-level `<name>/` directory ends up
/// at `target`.
pub(crate) fn extract(
    tarball_path: &Path,
    name: &str,
    target: &Path,
    timeout: Duration,
) -> Result<()> {
    let parent = target.parent().ok_or_else(|| PbenchError::TarballUnpackError {
        tarball: tarball_path.to_path_buf(),
        message: format!("{} has no parent directory", target.display()),
        stderr: None,
    })?;
    std::fs::create_dir_all(parent).map_err(|e| PbenchError::io_with_path(e, parent))?;

    let staging = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(parent)
        .map_err(|e| PbenchError::io_with_path(e, parent))?;

    let file_arg = format!("--file={}", tarball_path.display());
    let args = [
        "-x",
        "--no-same-owner",
        "--delay-directory-restore",
        "--force-local",
        file_arg.as_str(),
    ];
    let output = run_command("tar", &args, staging.path(), timeout).map_err(|failure| {
        PbenchError::TarballUnpackError {
            tarball: tarball_path.to_path_buf(),
            message: failure.message("tar"),
            stderr: failure.stderr(),
        }
    })?;
    if !output.stderr.is_empty() {
        debug!("tar reported for {}: {}", tarball_path.display(), output.stderr);
    }

    let unpacked = staging.path().join(name);
    if !unpacked.is_dir() {
        return Err(PbenchError::TarballUnpackError {
            tarball: tarball_path.to_path_buf(),
            message: format!("tarball does not contain a top-level {name}/ directory"),
            stderr: None,
        });
    }
    make_readable(&unpacked)?;

    std::fs::rename(&unpacked, target).map_err(|e| PbenchError::io_with_path(e, target))?;
    debug!("Unpacked {} into {}", tarball_path.display(), target.display());
    Ok(())
}

/// Give everyone read access to files and read/search access to directories.
pub(crate) fn make_readable(root: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let failed = |message: String| PbenchError::TarballModeChangeError {
            directory: root.to_path_buf(),
            message,
            stderr: None,
        };
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| failed(e.to_string()))?;
            let file_type = entry.file_type();
            let extra = if file_type.is_dir() {
                0o555
            } else if file_type.is_file() {
                0o444
            } else {
                continue;
            };
            let metadata = entry
                .metadata()
                .map_err(|e| failed(format!("{}: {}", entry.path().display(), e)))?;
            let mut permissions = metadata.permissions();
            let mode = permissions.mode();
            if mode & extra != extra {
                permissions.set_mode(mode | extra);
                std::fs::set_permissions(entry.path(), permissions)
                    .map_err(|e| failed(format!("{}: {}", entry.path().display(), e)))?;
            }
        }
    }

    #[cfg(windows)]
    {
        debug!("Skipping mode normalization on Windows for {}", root.display());
    }

    Ok(())
}

/// Point `link` at `target`, replacing any existing link.
pub(crate) fn link_results(target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PbenchError::io_with_path(e, parent))?;
    }
    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(link).map_err(|e| PbenchError::io_with_path(e, link))?;
    }

    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link).map_err(|e| PbenchError::io_with_path(e, link))?;

    #[cfg(windows)]
    std::os::windows::fs::symlink_dir(target, link)
        .map_err(|e| PbenchError::io_with_path(e, link))?;

    Ok(())
}

/// Create a marker file or bump its modification time.
pub(crate) fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PbenchError::io_with_path(e, parent))?;
    }
    let file = File::options()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| PbenchError::io_with_path(e, path))?;
    file.set_modified(SystemTime::now())
        .map_err(|e| PbenchError::io_with_path(e, path))
}

/// Modification time of a marker file, or the epoch if it is missing.
pub(crate) fn modified(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Total size in bytes of the regular files below `root`.
pub fn unpacked_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Remove a directory tree, treating "already gone" as success.
pub(crate) fn remove_tree(path: &Path) -> Result<bool> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(PbenchError::io_with_path(e, path)),
    }
}

/// Remove a file or symlink, treating "already gone" as success.
pub(crate) fn remove_file(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(PbenchError::io_with_path(e, path)),
    }
}

/// Remove `directory` if it exists and is empty.
pub(crate) fn delete_if_empty(directory: &Path) {
    let empty = std::fs::read_dir(directory)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        if let Err(e) = std::fs::remove_dir(directory) {
            warn!("Unable to remove empty {}: {}", directory.display(), e);
        }
    }
}

/// Move a file, falling back to copy and remove across filesystems.
pub(crate) fn move_file(source: &Path, destination: &Path) -> Result<()> {
    if std::fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    std::fs::copy(source, destination).map_err(|e| PbenchError::io_with_path(e, destination))?;
    if let Err(e) = std::fs::remove_file(source) {
        let _ = std::fs::remove_file(destination);
        return Err(PbenchError::io_with_path(e, source));
    }
    Ok(())
}

/// Directory entries that are themselves directories.
pub(crate) fn subdirectories(path: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(PbenchError::io_with_path(e, path)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| PbenchError::io_with_path(e, path))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[test]
    fn test_make_readable() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let root = temp.path().join("run");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        let file = root.join("sub").join("result.txt");
        std::fs::write(&file, "data").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o600)).unwrap();
        std::fs::set_permissions(root.join("sub"), std::fs::Permissions::from_mode(0o700))
            .unwrap();

        make_readable(&root).unwrap();

        let file_mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o644);
        let dir_mode = std::fs::metadata(root.join("sub"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn test_link_results_replaces_existing() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        let link = temp.path().join("results").join("ctl").join("run");

        link_results(&first, &link).unwrap();
        link_results(&second, &link).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), second);
    }

    #[test]
    fn test_touch_and_modified() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("abc").join("last_ref");
        assert_eq!(modified(&marker), SystemTime::UNIX_EPOCH);
        touch(&marker).unwrap();
        assert!(modified(&marker) > SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn test_unpacked_size() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("a/b")).unwrap();
        std::fs::write(temp.path().join("a/one"), vec![0u8; 100]).unwrap();
        std::fs::write(temp.path().join("a/b/two"), vec![0u8; 23]).unwrap();
        assert_eq!(unpacked_size(temp.path()), 123);
    }

    #[test]
    fn test_removal_of_missing_paths_is_ok() {
        let temp = TempDir::new().unwrap();
        assert!(!remove_tree(&temp.path().join("missing")).unwrap());
        assert!(!remove_file(&temp.path().join("missing")).unwrap());
    }

    #[test]
    fn test_delete_if_empty() {
        let temp = TempDir::new().unwrap();
        let empty = temp.path().join("empty");
        let full = temp.path().join("full");
        std::fs::create_dir_all(&empty).unwrap();
        std::fs::create_dir_all(&full).unwrap();
        std::fs::write(full.join("f"), "x").unwrap();

        delete_if_empty(&empty);
        delete_if_empty(&full);
        assert!(!empty.exists());
        assert!(full.exists());
    }
}
