//! Single files and directory listings served out of a dataset.

use super::subprocess::{run_command, CommandFailure};
use super::CacheLock;
use crate::{PbenchError, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::ffi::OsStr;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Type of a dataset member, or of a symlink's target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheType {
    /// A symlink that is absolute, dangling or leads out of the dataset.
    Broken,
    Directory,
    File,
    Other,
    Symlink,
}

impl CacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Broken => "BROKEN",
            CacheType::Directory => "DIRECTORY",
            CacheType::File => "FILE",
            CacheType::Other => "OTHER",
            CacheType::Symlink => "SYMLINK",
        }
    }
}

/// One dataset member opened for reading.
#[derive(Debug)]
pub struct Inventory {
    pub name: String,
    pub kind: CacheType,
    /// The open file; `None` for a directory.
    pub stream: Option<InventoryStream>,
}

/// A member file kept open together with the dataset's shared lock.
///
/// The unpacked tree cannot be uncached until the stream is dropped.
#[derive(Debug)]
pub struct InventoryStream {
    file: File,
    _lock: Option<CacheLock>,
}

impl InventoryStream {
    pub(crate) fn new(file: File, lock: Option<CacheLock>) -> Self {
        Self { file, _lock: lock }
    }
}

impl Read for InventoryStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

/// Join `relative` onto `root` lexically.
///
/// Absolute paths and `..` components that climb above `root` give `None`.
pub(crate) fn contained_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.iter().fold(root.to_path_buf(), |path, part| path.join(part)))
}

fn relative_str(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn kind_of(path: &Path) -> CacheType {
    if path.is_dir() {
        CacheType::Directory
    } else if path.is_file() {
        CacheType::File
    } else {
        CacheType::Other
    }
}

/// Where a symlink leads: the target's type and its path relative to
/// `root`, or `Broken` with the raw link text.
fn link_target(root: &Path, link: &Path) -> (CacheType, String) {
    let raw = std::fs::read_link(link).unwrap_or_default();
    let broken = (CacheType::Broken, raw.to_string_lossy().into_owned());
    if raw.is_absolute() {
        return broken;
    }
    match link.canonicalize() {
        Ok(target) if target.starts_with(root) => (kind_of(&target), relative_str(root, &target)),
        _ => broken,
    }
}

/// Describe a member that is not listed as a directory.
fn describe_member(root: &Path, path: &Path) -> Result<Value> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let meta = path
        .symlink_metadata()
        .map_err(|e| PbenchError::io_with_path(e, path))?;
    let mut entry = Map::new();
    entry.insert("name".into(), json!(name));
    if meta.file_type().is_symlink() {
        let (link_type, link) = link_target(root, path);
        let location = if matches!(link_type, CacheType::Broken | CacheType::Other) {
            relative_str(root, path)
        } else {
            link.clone()
        };
        entry.insert("type".into(), json!(CacheType::Symlink));
        entry.insert("link".into(), json!(link));
        entry.insert("link_type".into(), json!(link_type));
        entry.insert("path".into(), json!(location));
        if link_type == CacheType::File {
            entry.insert("size".into(), json!(path.metadata()?.len()));
        }
    } else if meta.is_dir() {
        entry.insert("type".into(), json!(CacheType::Directory));
        entry.insert("path".into(), json!(relative_str(root, path)));
    } else {
        let kind = if meta.is_file() {
            CacheType::File
        } else {
            CacheType::Other
        };
        entry.insert("type".into(), json!(kind));
        entry.insert("path".into(), json!(relative_str(root, path)));
        if kind == CacheType::File {
            entry.insert("size".into(), json!(meta.len()));
        }
    }
    Ok(Value::Object(entry))
}

/// Describe `artifact` within the dataset rooted at `root`.
///
/// A directory is listed one level deep, directories and files each sorted
/// by name; symlinks to directories are listed with the directories. The
/// dataset root is reported with an empty name and path.
pub(crate) fn describe(root: &Path, artifact: &Path) -> Result<Value> {
    let root = root
        .canonicalize()
        .map_err(|e| PbenchError::io_with_path(e, root))?;
    let parent = artifact.parent().unwrap_or(artifact);
    let artifact = match (parent.canonicalize(), artifact.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => root.clone(),
    };
    let meta = artifact
        .symlink_metadata()
        .map_err(|e| PbenchError::io_with_path(e, &artifact))?;
    if !meta.is_dir() {
        return describe_member(&root, &artifact);
    }

    let mut directories = Vec::new();
    let mut files = Vec::new();
    let entries =
        std::fs::read_dir(&artifact).map_err(|e| PbenchError::io_with_path(e, &artifact))?;
    for entry in entries {
        let path = entry?.path();
        let description = describe_member(&root, &path)?;
        let listed_as_dir = description["type"] == json!(CacheType::Directory)
            || description["link_type"] == json!(CacheType::Directory);
        if listed_as_dir {
            directories.push(description);
        } else {
            files.push(description);
        }
    }
    let by_name = |a: &Value, b: &Value| a["name"].as_str().cmp(&b["name"].as_str());
    directories.sort_by(by_name);
    files.sort_by(by_name);

    let location = relative_str(&root, &artifact);
    let name = if location.is_empty() {
        String::new()
    } else {
        artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    Ok(json!({
        "name": name,
        "type": CacheType::Directory,
        "directories": directories,
        "files": files,
        "path": location,
    }))
}

/// Read one member straight out of a tarball.
///
/// Only the first occurrence is extracted, so tar can stop early in a large
/// archive. A member tar cannot find is `CacheExtractBadPath`.
pub(crate) fn extract_member(
    tarball_path: &Path,
    member: &str,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let cwd = tarball_path.parent().unwrap_or_else(|| Path::new("."));
    let file_arg = format!("--file={}", tarball_path.display());
    let args = [
        "-x",
        "--force-local",
        "-O",
        "--occurrence=1",
        file_arg.as_str(),
        member,
    ];
    match run_command("tar", &args, cwd, timeout) {
        Ok(output) => {
            debug!("Extracted {} from {}", member, tarball_path.display());
            Ok(output.stdout)
        }
        Err(CommandFailure::Exit { ref stderr, .. }) if stderr.contains(member) => {
            Err(PbenchError::CacheExtractBadPath {
                tarball: tarball_path.to_path_buf(),
                path: member.to_string(),
            })
        }
        Err(failure) => Err(PbenchError::TarballUnpackError {
            tarball: tarball_path.to_path_buf(),
            message: failure.message("tar"),
            stderr: failure.stderr(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_contained_path() {
        let root = Path::new("/srv/incoming/node1/fio_run");
        assert_eq!(
            contained_path(root, "1-default/./result.json").unwrap(),
            root.join("1-default/result.json")
        );
        assert_eq!(contained_path(root, "1-default/..").unwrap(), root);
        assert_eq!(contained_path(root, "").unwrap(), root);
        assert!(contained_path(root, "..").is_none());
        assert!(contained_path(root, "1-default/../../other").is_none());
        assert!(contained_path(root, "/etc/passwd").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_describe_listing() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("fio_run");
        std::fs::create_dir_all(root.join("1-default")).unwrap();
        std::fs::write(root.join("metadata.log"), "[pbench]\n").unwrap();
        std::fs::write(root.join("1-default/result.json"), "{}").unwrap();
        std::os::unix::fs::symlink("1-default", root.join("latest")).unwrap();
        std::os::unix::fs::symlink("/etc/hostname", root.join("host")).unwrap();
        std::os::unix::fs::symlink("../../outside", root.join("escape")).unwrap();

        let listing = describe(&root, &root).unwrap();
        assert_eq!(listing["name"], "");
        assert_eq!(listing["path"], "");
        let dirs: Vec<_> = listing["directories"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["name"].as_str().unwrap())
            .collect();
        assert_eq!(dirs, vec!["1-default", "latest"]);
        let files = listing["files"].as_array().unwrap();
        let names: Vec<_> = files.iter().map(|f| f["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["escape", "host", "metadata.log"]);
        assert_eq!(files[0]["link_type"], "BROKEN");
        assert_eq!(files[1]["link_type"], "BROKEN");
        assert_eq!(files[2]["size"], 9);

        let latest = &listing["directories"][1];
        assert_eq!(latest["type"], "SYMLINK");
        assert_eq!(latest["path"], "1-default");

        let sub = describe(&root, &root.join("1-default")).unwrap();
        assert_eq!(sub["name"], "1-default");
        assert_eq!(sub["files"][0]["path"], "1-default/result.json");

        let file = describe(&root, &root.join("metadata.log")).unwrap();
        assert_eq!(file["type"], "FILE");
        assert_eq!(file["size"], 9);
    }
}
