//! Tarball handles and `metadata.log` parsing.

use super::subprocess::run_command;
use crate::config::CacheConfig;
use crate::dataset::Dataset;
use crate::hashing;
use crate::{PbenchError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The archived copy of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tarball {
    pub name: String,
    pub resource_id: String,
    pub controller: String,
    pub tarball_path: PathBuf,
    pub md5_path: PathBuf,
    /// `archive/<controller>/<resource_id>`; `None` for a legacy tarball
    /// stored directly in the controller directory.
    pub isolator: Option<PathBuf>,
    /// Parsed `metadata.log`, when it was read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metalog: Option<Value>,
}

/// Sidecar path for a tarball path.
pub(crate) fn md5_path_for(tarball: &Path) -> PathBuf {
    let mut name = tarball
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".md5");
    tarball.with_file_name(name)
}

impl Tarball {
    /// Build a handle from an isolator directory holding one tarball.
    pub(crate) fn from_isolator(controller: &str, isolator: &Path) -> Result<Option<Self>> {
        let resource_id = isolator
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let entries =
            std::fs::read_dir(isolator).map_err(|e| PbenchError::io_with_path(e, isolator))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && Dataset::is_tarball(&path) {
                return Ok(Some(Self {
                    name: Dataset::stem(&path)?,
                    resource_id,
                    controller: controller.to_string(),
                    md5_path: md5_path_for(&path),
                    tarball_path: path,
                    isolator: Some(isolator.to_path_buf()),
                    metalog: None,
                }));
            }
        }
        Ok(None)
    }

    /// Build a handle for a legacy tarball in the controller directory.
    ///
    /// The resource id comes from the sidecar when there is one, otherwise
    /// it is computed.
    pub(crate) fn from_legacy(controller: &str, path: &Path) -> Result<Self> {
        let md5_path = md5_path_for(path);
        let resource_id = if md5_path.is_file() {
            hashing::read_md5_file(&md5_path)?
        } else {
            hashing::compute_md5(path)?
        };
        Ok(Self {
            name: Dataset::stem(path)?,
            resource_id,
            controller: controller.to_string(),
            tarball_path: path.to_path_buf(),
            md5_path,
            isolator: None,
            metalog: None,
        })
    }

    /// Size of the archived tarball in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.tarball_path)
            .map_err(|e| PbenchError::io_with_path(e, &self.tarball_path))?
            .len())
    }
}

/// Parse INI text into `{section: {key: value}}`.
///
/// Keys are lower-cased, values trimmed, and `#`/`;` comment lines and
/// entries outside any section ignored.
pub fn parse_metalog(text: &str) -> Value {
    let mut sections = Map::new();
    let mut current: Option<String> = None;
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let section = section.trim().to_string();
            sections
                .entry(section.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            current = Some(section);
            continue;
        }
        let Some(section) = &current else {
            continue;
        };
        let split = line
            .find(['=', ':'])
            .map(|at| (line[..at].trim(), line[at + 1..].trim()));
        let Some((key, value)) = split else {
            continue;
        };
        if let Some(Value::Object(entries)) = sections.get_mut(section) {
            entries.insert(key.to_lowercase(), Value::String(value.to_string()));
        }
    }
    Value::Object(sections)
}

/// Read `<name>/metadata.log` out of a tarball without unpacking it.
///
/// Returns `None`, with a warning, when the file cannot be read.
pub fn read_metalog(tarball_path: &Path, name: &str) -> Option<Value> {
    let member = format!("{}/{}", name, CacheConfig::METADATA_LOG_NAME);
    let cwd = tarball_path.parent().unwrap_or_else(|| Path::new("."));
    let file_arg = format!("--file={}", tarball_path.display());
    let args = ["-x", "--force-local", "-O", file_arg.as_str(), member.as_str()];
    match run_command("tar", &args, cwd, CacheConfig::METADATA_READ_TIMEOUT) {
        Ok(output) => {
            debug!("Read {} from {}", member, tarball_path.display());
            Some(parse_metalog(&String::from_utf8_lossy(&output.stdout)))
        }
        Err(failure) => {
            warn!(
                "Unable to read {} from {}: {}",
                member,
                tarball_path.display(),
                failure.message("tar")
            );
            None
        }
    }
}

/// Controller name recorded in a parsed `metadata.log`.
pub fn controller_from_metalog(metalog: Option<&Value>) -> Option<String> {
    metalog?
        .get("run")?
        .get("controller")?
        .as_str()
        .map(str::trim)
        .filter(|c| !c.is_empty() && !c.contains(['/', '\\']) && *c != "." && *c != "..")
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_metalog() {
        let text = "\
# header comment
stray = ignored
[pbench]
name = fio_run
Script: fio

[run]
controller = node1.example.com
raw_size = 12345
; comment
";
        let parsed = parse_metalog(text);
        assert_eq!(
            parsed,
            json!({
                "pbench": {"name": "fio_run", "script": "fio"},
                "run": {"controller": "node1.example.com", "raw_size": "12345"}
            })
        );
    }

    #[test]
    fn test_controller_from_metalog() {
        let metalog = json!({"run": {"controller": "node1"}});
        assert_eq!(
            controller_from_metalog(Some(&metalog)).as_deref(),
            Some("node1")
        );
        assert_eq!(controller_from_metalog(Some(&json!({"run": {}}))), None);
        assert_eq!(
            controller_from_metalog(Some(&json!({"run": {"controller": "../etc"}}))),
            None
        );
        assert_eq!(controller_from_metalog(None), None);
    }

    #[test]
    fn test_md5_path_for() {
        assert_eq!(
            md5_path_for(Path::new("/a/b/run.tar.xz")),
            PathBuf::from("/a/b/run.tar.xz.md5")
        );
    }
}
