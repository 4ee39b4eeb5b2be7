//! Row-level metadata access on an open connection.
//!
//! These functions take a `&Connection` so that the sync tracker and index
//! map store can update metadata inside their own transactions.

use super::keys;
use crate::dataset::Dataset;
use crate::{PbenchError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

/// Only `user` rows are scoped by user; everything else shares one row.
fn user_column<'a>(native: &str, user: Option<&'a str>) -> &'a str {
    if native == keys::USER {
        user.unwrap_or_default()
    } else {
        ""
    }
}

pub(crate) fn read_row(
    conn: &Connection,
    dataset: &Dataset,
    native: &str,
    user: Option<&str>,
) -> Result<Option<Value>> {
    if native == keys::USER && user.is_none() {
        return Ok(None);
    }
    let text: Option<Option<String>> = conn
        .query_row(
            "SELECT value FROM dataset_metadata
             WHERE dataset_ref = ?1 AND key = ?2 AND user_id = ?3",
            params![dataset.id, native, user_column(native, user)],
            |row| row.get(0),
        )
        .optional()?;
    match text {
        None => Ok(None),
        Some(None) => Ok(Some(Value::Null)),
        Some(Some(text)) => Ok(Some(serde_json::from_str(&text)?)),
    }
}

pub(crate) fn write_row(
    conn: &Connection,
    dataset: &Dataset,
    native: &str,
    user: Option<&str>,
    value: &Value,
) -> Result<()> {
    if native == keys::USER && user.is_none() {
        return Err(PbenchError::Unauthorized {
            message: format!("{} metadata requires an authenticated user", keys::USER),
        });
    }
    conn.execute(
        "INSERT INTO dataset_metadata (dataset_ref, key, value, user_id)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(dataset_ref, key, user_id) DO UPDATE SET value = excluded.value",
        params![
            dataset.id,
            native,
            serde_json::to_string(value)?,
            user_column(native, user)
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_row(
    conn: &Connection,
    dataset: &Dataset,
    native: &str,
    user: Option<&str>,
) -> Result<bool> {
    if native == keys::USER && user.is_none() {
        return Ok(false);
    }
    let deleted = conn.execute(
        "DELETE FROM dataset_metadata WHERE dataset_ref = ?1 AND key = ?2 AND user_id = ?3",
        params![dataset.id, native, user_column(native, user)],
    )?;
    Ok(deleted > 0)
}

pub(crate) fn row_keys(conn: &Connection, dataset: &Dataset) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT key FROM dataset_metadata WHERE dataset_ref = ?1 ORDER BY key",
    )?;
    let rows = stmt.query_map(params![dataset.id], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

/// The `dataset` namespace: row columns plus the stored `metalog`.
pub(crate) fn dataset_view(conn: &Connection, dataset: &Dataset) -> Result<Value> {
    let mut view = dataset.as_json();
    let metalog = read_row(conn, dataset, keys::METALOG, None)?;
    if let Value::Object(map) = &mut view {
        map.insert(keys::METALOG.to_string(), metalog.unwrap_or(Value::Null));
    }
    Ok(view)
}

/// Walk a nested path through a JSON document.
///
/// Returns `None` when an element is missing; a non-object met before the
/// end of the path is a structural error.
fn walk(
    value: Value,
    dataset: &Dataset,
    key: &str,
    native: &str,
    path: &[String],
) -> Result<Option<Value>> {
    let mut current = value;
    let mut name = native.to_string();
    for element in path {
        let Value::Object(mut map) = current else {
            return Err(PbenchError::MetadataBadStructure {
                dataset: dataset.to_string(),
                key: key.to_string(),
                element: name,
            });
        };
        match map.remove(element) {
            Some(next) => current = next,
            None => return Ok(None),
        }
        name = element.clone();
    }
    Ok(Some(current))
}

/// Read a key path. The key must already be validated.
pub(crate) fn get_path(
    conn: &Connection,
    dataset: &Dataset,
    key: &str,
    user: Option<&str>,
) -> Result<Option<Value>> {
    let (native, path) = keys::split_path(key);
    let root = if native == keys::DATASET {
        Some(dataset_view(conn, dataset)?)
    } else {
        read_row(conn, dataset, &native, user)?
    };
    match root {
        Some(root) => walk(root, dataset, key, &native, &path),
        None => Ok(None),
    }
}

/// Assign a value at a nested path, creating intermediate objects.
fn assign(
    document: &mut Value,
    dataset: &Dataset,
    key: &str,
    native: &str,
    path: &[String],
    value: Value,
) -> Result<()> {
    let Some((leaf, parents)) = path.split_last() else {
        *document = value;
        return Ok(());
    };
    let mut walker = document;
    let mut name = native.to_string();
    for element in parents {
        let Value::Object(map) = walker else {
            return Err(PbenchError::MetadataBadStructure {
                dataset: dataset.to_string(),
                key: key.to_string(),
                element: name,
            });
        };
        walker = map
            .entry(element.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        name = element.clone();
    }
    let Value::Object(map) = walker else {
        return Err(PbenchError::MetadataBadStructure {
            dataset: dataset.to_string(),
            key: key.to_string(),
            element: name,
        });
    };
    map.insert(leaf.clone(), value);
    Ok(())
}

/// Write a key path below a native row key. The key must already be
/// validated and must not be in the `dataset` namespace.
pub(crate) fn set_path(
    conn: &Connection,
    dataset: &Dataset,
    key: &str,
    value: Value,
    user: Option<&str>,
) -> Result<()> {
    let (native, path) = keys::split_path(key);
    if !keys::NATIVE_KEYS.contains(&native.as_str()) {
        return Err(PbenchError::MetadataBadKey {
            key: key.to_string(),
        });
    }
    let mut document = if path.is_empty() {
        Value::Null
    } else {
        read_row(conn, dataset, &native, user)?.unwrap_or_else(|| Value::Object(Map::new()))
    };
    assign(&mut document, dataset, key, &native, &path, value)?;
    write_row(conn, dataset, &native, user, &document)
}

/// Remove a key path. Returns whether anything was removed.
pub(crate) fn remove_path(
    conn: &Connection,
    dataset: &Dataset,
    key: &str,
    user: Option<&str>,
) -> Result<bool> {
    let (native, path) = keys::split_path(key);
    let Some((leaf, parents)) = path.split_last() else {
        return delete_row(conn, dataset, &native, user);
    };
    let Some(mut document) = read_row(conn, dataset, &native, user)? else {
        return Ok(false);
    };

    let mut walker = &mut document;
    let mut name = native.clone();
    for element in parents {
        let Value::Object(map) = walker else {
            return Err(PbenchError::MetadataBadStructure {
                dataset: dataset.to_string(),
                key: key.to_string(),
                element: name,
            });
        };
        match map.get_mut(element) {
            Some(next) => walker = next,
            None => return Ok(false),
        }
        name = element.clone();
    }
    let Value::Object(map) = walker else {
        return Err(PbenchError::MetadataBadStructure {
            dataset: dataset.to_string(),
            key: key.to_string(),
            element: name,
        });
    };
    if map.remove(leaf).is_none() {
        return Ok(false);
    }
    write_row(conn, dataset, &native, user, &document)?;
    Ok(true)
}
