//! Dataset entity: identity, ownership, access policy and lifecycle state.
//!
//! A [`Dataset`] is a plain snapshot of one `datasets` row. All persistence
//! goes through [`DatasetStore`], whose [`advance`](DatasetStore::advance)
//! commits each transition immediately with a compare-and-set on the stored
//! state, so two workers racing on the same dataset cannot both succeed.

mod state;

pub use state::{Access, State};

use crate::config::CacheConfig;
use crate::db::Database;
use crate::{PbenchError, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// A snapshot of one dataset row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(skip)]
    pub(crate) id: i64,
    pub name: String,
    /// Content hash of the tarball; the only externally visible identifier.
    pub resource_id: String,
    pub owner_id: String,
    pub access: Access,
    pub uploaded: DateTime<Utc>,
    /// Benchmark run time, which may predate the upload.
    pub created: DateTime<Utc>,
    pub state: State,
    pub transition: DateTime<Utc>,
}

impl Dataset {
    /// Check whether a path names a tarball.
    pub fn is_tarball(path: impl AsRef<Path>) -> bool {
        path.as_ref()
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(CacheConfig::TARBALL_SUFFIX))
            .unwrap_or(false)
    }

    /// The dataset name of a tarball path: its file name without the suffix.
    pub fn stem(path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        match file_name.strip_suffix(CacheConfig::TARBALL_SUFFIX) {
            Some(stem) if !stem.is_empty() => Ok(stem.to_string()),
            _ => Err(PbenchError::DatasetBadName {
                name: path.display().to_string(),
            }),
        }
    }

    /// The `dataset.*` metadata namespace view of this row.
    pub fn as_json(&self) -> Value {
        json!({
            "access": self.access,
            "created": self.created.to_rfc3339(),
            "name": self.name,
            "owner_id": self.owner_id,
            "resource_id": self.resource_id,
            "state": self.state,
            "transition": self.transition.to_rfc3339(),
            "uploaded": self.uploaded.to_rfc3339(),
        })
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.resource_id)
    }
}

/// Parameters for a new dataset row.
#[derive(Debug, Clone)]
pub struct NewDataset {
    pub owner_id: String,
    pub name: String,
    pub resource_id: String,
    pub access: Access,
    pub created: Option<DateTime<Utc>>,
}

pub(crate) const COLUMNS: &str =
    "id, name, resource_id, owner_id, access, uploaded, created, state, transition";

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn row_to_dataset(row: &Row<'_>) -> rusqlite::Result<Dataset> {
    Ok(Dataset {
        id: row.get(0)?,
        name: row.get(1)?,
        resource_id: row.get(2)?,
        owner_id: row.get(3)?,
        access: row.get(4)?,
        uploaded: parse_timestamp(row, 5)?,
        created: parse_timestamp(row, 6)?,
        state: row.get(7)?,
        transition: parse_timestamp(row, 8)?,
    })
}

pub(crate) fn query_by_id(conn: &Connection, id: i64) -> Result<Option<Dataset>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM datasets WHERE id = ?1"),
            params![id],
            row_to_dataset,
        )
        .optional()?)
}

/// Rename a dataset row within an open connection or transaction.
pub(crate) fn rename_in(conn: &Connection, dataset: &Dataset, name: &str) -> Result<()> {
    conn.execute(
        "UPDATE datasets SET name = ?1 WHERE id = ?2",
        params![name, dataset.id],
    )?;
    Ok(())
}

/// Persistence operations for datasets.
#[derive(Clone)]
pub struct DatasetStore {
    db: Database,
}

impl DatasetStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ========================================
    // Creation and lookup
    // ========================================

    /// Create a dataset in the `UPLOADING` state.
    pub fn create(&self, new: NewDataset) -> Result<Dataset> {
        for (value, expected) in [
            (&new.owner_id, "owner"),
            (&new.name, "dataset name"),
            (&new.resource_id, "resource id"),
        ] {
            if value.trim().is_empty() {
                return Err(PbenchError::DatasetBadParameterType {
                    value: value.clone(),
                    expected: expected.to_string(),
                });
            }
        }

        let now = Utc::now();
        let created = new.created.unwrap_or(now);
        let conn = self.db.lock_conn()?;
        let inserted = conn.execute(
            "INSERT INTO datasets
             (name, resource_id, owner_id, access, uploaded, created, state, transition)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.name,
                new.resource_id,
                new.owner_id,
                new.access,
                now.to_rfc3339(),
                created.to_rfc3339(),
                State::Uploading,
                now.to_rfc3339(),
            ],
        );
        if let Err(e) = inserted {
            if crate::db::constraint_failure(&e) == crate::db::ConstraintFailure::Duplicate {
                return Err(PbenchError::DatasetDuplicate {
                    resource_id: new.resource_id,
                });
            }
            return Err(e.into());
        }

        let id = conn.last_insert_rowid();
        debug!("Created dataset {} ({})", new.name, new.resource_id);
        query_by_id(&conn, id)?.ok_or_else(|| PbenchError::Database {
            message: format!("Dataset {} disappeared after insert", new.resource_id),
            source: None,
        })
    }

    /// Look up a dataset by resource id.
    pub fn query_by_resource_id(&self, resource_id: &str) -> Result<Dataset> {
        let conn = self.db.lock_conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM datasets WHERE resource_id = ?1"),
            params![resource_id],
            row_to_dataset,
        )
        .optional()?
        .ok_or_else(|| PbenchError::DatasetNotFound {
            lookup: format!("resource_id {resource_id}"),
        })
    }

    /// All datasets with a given name; names are not unique.
    pub fn query_by_name(&self, name: &str) -> Result<Vec<Dataset>> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM datasets WHERE name = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![name], row_to_dataset)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Return an existing dataset, optionally advancing it to a new state.
    pub fn attach(&self, resource_id: &str, state: Option<State>) -> Result<Dataset> {
        let mut dataset = self.query_by_resource_id(resource_id)?;
        if let Some(state) = state {
            self.advance(&mut dataset, state)?;
        }
        Ok(dataset)
    }

    /// List datasets, optionally restricted to one state, ordered by name.
    pub fn list(&self, state: Option<State>) -> Result<Vec<Dataset>> {
        let conn = self.db.lock_conn()?;
        let datasets = match state {
            Some(state) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM datasets WHERE state = ?1 ORDER BY name, id"
                ))?;
                let rows = stmt.query_map(params![state], row_to_dataset)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM datasets ORDER BY name, id"
                ))?;
                let rows = stmt.query_map([], row_to_dataset)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(datasets)
    }

    /// Reload a snapshot from the database.
    pub fn refresh(&self, dataset: &mut Dataset) -> Result<()> {
        let conn = self.db.lock_conn()?;
        *dataset = query_by_id(&conn, dataset.id)?.ok_or_else(|| PbenchError::DatasetNotFound {
            lookup: format!("resource_id {}", dataset.resource_id),
        })?;
        Ok(())
    }

    /// Rename a dataset. Names are not unique and carry no lifecycle meaning.
    pub fn update_name(&self, dataset: &mut Dataset, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(PbenchError::DatasetBadParameterType {
                value: name.to_string(),
                expected: "dataset name".to_string(),
            });
        }
        let conn = self.db.lock_conn()?;
        rename_in(&conn, dataset, name)?;
        dataset.name = name.to_string();
        Ok(())
    }

    // ========================================
    // State machine
    // ========================================

    /// Advance a dataset to a new state and commit immediately.
    ///
    /// The update only applies if the stored state still matches the
    /// snapshot, so a concurrent advance makes this call fail cleanly with
    /// the snapshot refreshed to the committed row.
    pub fn advance(&self, dataset: &mut Dataset, new_state: State) -> Result<()> {
        check_transition(dataset, new_state)?;

        let now = Utc::now();
        let conn = self.db.lock_conn()?;
        let updated = conn.execute(
            "UPDATE datasets SET state = ?1, transition = ?2 WHERE id = ?3 AND state = ?4",
            params![new_state, now.to_rfc3339(), dataset.id, dataset.state],
        )?;

        if updated == 0 {
            let current =
                query_by_id(&conn, dataset.id)?.ok_or_else(|| PbenchError::DatasetNotFound {
                    lookup: format!("resource_id {}", dataset.resource_id),
                })?;
            *dataset = current;
            check_transition(dataset, new_state)?;
            // The stored state moved on but the transition is still legal
            // from there; the caller's view was stale, so refuse anyway.
            return Err(PbenchError::BadStateTransition {
                dataset: dataset.to_string(),
                state: dataset.state,
                requested: new_state,
            });
        }

        info!(
            "Dataset {} advanced from {} to {}",
            dataset, dataset.state, new_state
        );
        dataset.state = new_state;
        dataset.transition = now;
        Ok(())
    }

    // ========================================
    // Removal
    // ========================================

    /// Delete the dataset row. Metadata and index map rows cascade.
    pub fn delete(&self, dataset: &Dataset) -> Result<()> {
        let conn = self.db.lock_conn()?;
        let deleted = conn.execute("DELETE FROM datasets WHERE id = ?1", params![dataset.id])?;
        if deleted == 0 {
            return Err(PbenchError::DatasetNotFound {
                lookup: format!("resource_id {}", dataset.resource_id),
            });
        }
        info!("Deleted dataset {}", dataset);
        Ok(())
    }
}

fn check_transition(dataset: &Dataset, new_state: State) -> Result<()> {
    if dataset.state.is_terminal() {
        return Err(PbenchError::TerminalStateViolation {
            dataset: dataset.to_string(),
            state: dataset.state,
            requested: new_state,
        });
    }
    if !dataset.state.can_advance_to(new_state) {
        return Err(PbenchError::BadStateTransition {
            dataset: dataset.to_string(),
            state: dataset.state,
            requested: new_state,
        });
    }
    Ok(())
}
