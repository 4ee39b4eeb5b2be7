//! Metadata key vocabulary and key path validation.
//!
//! Rows are keyed by a "native" key; everything below that is a dotted path
//! into the row's JSON document, so `global.dashboard.seen` lives in the
//! `global` row at `{"dashboard": {"seen": ...}}`.

use regex::Regex;
use std::sync::LazyLock;

/// Virtual namespace computed from the dataset row.
pub const DATASET: &str = "dataset";
/// Open namespace readable and writable by anyone who can update the dataset.
pub const GLOBAL: &str = "global";
/// Parsed `metadata.log` from the tarball; exposed as `dataset.metalog`.
pub const METALOG: &str = "metalog";
/// Server bookkeeping, readable but mostly not writable by clients.
pub const SERVER: &str = "server";
/// Open namespace scoped to the authenticated user.
pub const USER: &str = "user";

/// Keys stored as rows.
pub const NATIVE_KEYS: [&str; 4] = [GLOBAL, METALOG, SERVER, USER];

/// Namespaces a client may read.
pub const METADATA_KEYS: [&str; 4] = [DATASET, GLOBAL, SERVER, USER];

pub const DATASET_NAME: &str = "dataset.name";
pub const DELETION: &str = "server.deletion";
pub const REINDEX: &str = "server.reindex";
pub const ARCHIVED: &str = "server.archived";
pub const OPERATION: &str = "server.operation";
pub const TARBALL_PATH: &str = "server.tarball-path";
pub const INDEX_MAP: &str = "server.index-map";
pub const UNPACKED: &str = "server.unpacked";
pub const UNPACK_PERF: &str = "server.unpack-perf";

/// Keys and namespaces a client may write.
pub const USER_UPDATEABLE: [&str; 4] = [DATASET_NAME, DELETION, GLOBAL, USER];

/// Keys that may never be set to null.
pub const REQUIRES_VALUE: [&str; 4] = [DATASET_NAME, DELETION, OPERATION, TARBALL_PATH];

static VALID_KEY_CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_.-]+$").expect("metadata key regex must compile"));

/// Per-component status key, e.g. `server.status.unpack`.
pub fn status_key(component: &str) -> String {
    format!("{SERVER}.status.{}", component.to_lowercase())
}

/// The native row key of a key path.
pub fn native_key(key: &str) -> String {
    key.split('.').next().unwrap_or_default().to_lowercase()
}

/// Split a key path into its native key and the nested path below it.
pub fn split_path(key: &str) -> (String, Vec<String>) {
    let lower = key.to_lowercase();
    let mut parts = lower.split('.').map(str::to_string);
    let native = parts.next().unwrap_or_default();
    (native, parts.collect())
}

/// Check a key path against a list of accepted keys or namespaces.
///
/// An exact match is always valid. Otherwise the first element must be in
/// `valid`, no element may be empty, and the whole path must use only
/// lowercase letters, digits, `_`, `-` and `.`.
pub fn is_key_path(key: &str, valid: &[&str]) -> bool {
    let k = key.to_lowercase();
    if valid.contains(&k.as_str()) {
        return true;
    }
    let path: Vec<&str> = k.split('.').collect();
    if path.iter().any(|p| p.is_empty()) {
        return false;
    }
    if !valid.contains(&path[0]) {
        return false;
    }
    VALID_KEY_CHARSET.is_match(&k)
}

/// Check whether a client may write a key path.
pub fn is_user_updateable(key: &str) -> bool {
    let k = key.to_lowercase();
    if k == DATASET_NAME || k == DELETION {
        return true;
    }
    let native = native_key(&k);
    (native == GLOBAL || native == USER) && is_key_path(&k, &[GLOBAL, USER])
}
