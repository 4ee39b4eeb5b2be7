//! Index map store: which document-store indices hold which documents for
//! each dataset.
//!
//! Rows are keyed by (dataset, root index, concrete index) and carry the
//! ordered list of document ids. Every mutation also rewrites the
//! `server.index-map` summary metadata in the same transaction.

pub mod query;

pub use query::{document_count, indices_for_dataset, mappings_for_index, unique_documents_by_index};

use crate::dataset::Dataset;
use crate::db::{constraint_failure, ConstraintFailure, Database};
use crate::metadata::{keys, rows};
use crate::{PbenchError, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// `{root index: {concrete index: [document id, ...]}}`
pub type IndexMapType = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// One (root, index) row with its document count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub root: String,
    pub index: String,
    pub count: usize,
}

/// Empty names bind as NULL so the NOT NULL constraint reports them.
fn name_param(name: &str) -> Option<&str> {
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Turn a failure into the index map error it represents.
fn decode_error(operation: &str, dataset: &Dataset, err: PbenchError) -> PbenchError {
    match err {
        PbenchError::Database {
            message,
            source: Some(source),
        } => match constraint_failure(&source) {
            ConstraintFailure::Duplicate => PbenchError::IndexMapDuplicate {
                dataset: dataset.to_string(),
                message,
            },
            ConstraintFailure::NotNull => PbenchError::IndexMapMissingParameter {
                dataset: dataset.to_string(),
                message,
            },
            ConstraintFailure::Other => PbenchError::IndexMapSql {
                operation: operation.to_string(),
                dataset: dataset.to_string(),
                message,
                source: Some(source),
            },
        },
        other => other,
    }
}

struct Row {
    id: i64,
    root: String,
    index: String,
    documents: Vec<String>,
}

fn load_rows(conn: &Connection, dataset: &Dataset, root: Option<&str>) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(
        "SELECT id, root, idx, documents FROM indexmaps
         WHERE dataset_ref = ?1 AND (?2 IS NULL OR root = ?2)
         ORDER BY root, idx",
    )?;
    let raw = stmt
        .query_map(params![dataset.id, root], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter()
        .map(|(id, root, index, documents)| {
            Ok(Row {
                id,
                root,
                index,
                documents: serde_json::from_str(&documents)?,
            })
        })
        .collect()
}

fn insert_row(
    conn: &Connection,
    dataset: &Dataset,
    root: &str,
    index: &str,
    documents: &[String],
) -> Result<()> {
    conn.execute(
        "INSERT INTO indexmaps (dataset_ref, root, idx, documents) VALUES (?1, ?2, ?3, ?4)",
        params![
            dataset.id,
            name_param(root),
            name_param(index),
            serde_json::to_string(documents)?
        ],
    )?;
    Ok(())
}

/// Rewrite the `server.index-map` summary from the table.
fn write_summary(conn: &Connection, dataset: &Dataset) -> Result<()> {
    let entries = load_rows(conn, dataset, None)?;
    if entries.is_empty() {
        rows::remove_path(conn, dataset, keys::INDEX_MAP, None)?;
        return Ok(());
    }
    let mut summary = Map::new();
    for row in entries {
        let entry = summary
            .entry(row.root)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(indices) = entry {
            indices.insert(row.index, Value::from(row.documents.len()));
        }
    }
    rows::set_path(conn, dataset, keys::INDEX_MAP, Value::Object(summary), None)
}

/// Persistence operations for index maps.
#[derive(Clone)]
pub struct IndexMapStore {
    db: Database,
}

impl IndexMapStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Run a mutation and the summary rewrite in one transaction.
    fn mutate<T>(
        &self,
        operation: &str,
        dataset: &Dataset,
        body: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let run = || -> Result<T> {
            let mut conn = self.db.lock_conn()?;
            let tx = conn.transaction()?;
            let result = body(&tx)?;
            write_summary(&tx, dataset)?;
            tx.commit()?;
            Ok(result)
        };
        run().map_err(|e| decode_error(operation, dataset, e))
    }

    fn read<T>(
        &self,
        operation: &str,
        dataset: &Dataset,
        body: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let run = || -> Result<T> {
            let conn = self.db.lock_conn()?;
            body(&conn)
        };
        run().map_err(|e| decode_error(operation, dataset, e))
    }

    // ========================================
    // Mutations
    // ========================================

    /// Insert one row per (root, index) pair.
    ///
    /// A pair that already exists for the dataset fails the whole call with
    /// `IndexMapDuplicate`; an empty name fails with
    /// `IndexMapMissingParameter`.
    pub fn create(&self, dataset: &Dataset, map: &IndexMapType) -> Result<()> {
        self.mutate("create", dataset, |conn| {
            for (root, indices) in map {
                for (index, documents) in indices {
                    insert_row(conn, dataset, root, index, documents)?;
                }
            }
            Ok(())
        })?;
        debug!("Created index map for {} ({} roots)", dataset, map.len());
        Ok(())
    }

    /// Merge a map produced by a later indexing pass.
    ///
    /// New (root, index) pairs are inserted. Existing pairs get the new
    /// document ids appended; duplicates are kept.
    pub fn merge(&self, dataset: &Dataset, map: &IndexMapType) -> Result<()> {
        self.mutate("merge", dataset, |conn| {
            let mut existing: BTreeMap<(String, String), Row> = load_rows(conn, dataset, None)?
                .into_iter()
                .map(|row| ((row.root.clone(), row.index.clone()), row))
                .collect();
            for (root, indices) in map {
                for (index, documents) in indices {
                    match existing.get_mut(&(root.clone(), index.clone())) {
                        Some(row) => {
                            row.documents.extend(documents.iter().cloned());
                            conn.execute(
                                "UPDATE indexmaps SET documents = ?1 WHERE id = ?2",
                                params![serde_json::to_string(&row.documents)?, row.id],
                            )?;
                        }
                        None => insert_row(conn, dataset, root, index, documents)?,
                    }
                }
            }
            Ok(())
        })?;
        debug!("Merged {} roots into index map for {}", map.len(), dataset);
        Ok(())
    }

    /// Delete all rows, or only those under one root. Returns rows removed.
    pub fn delete(&self, dataset: &Dataset, root: Option<&str>) -> Result<usize> {
        let removed = self.mutate("delete", dataset, |conn| {
            Ok(conn.execute(
                "DELETE FROM indexmaps WHERE dataset_ref = ?1 AND (?2 IS NULL OR root = ?2)",
                params![dataset.id, root],
            )?)
        })?;
        debug!("Deleted {} index map rows for {}", removed, dataset);
        Ok(removed)
    }

    // ========================================
    // Queries
    // ========================================

    /// Concrete index to document ids for one root.
    pub fn find(&self, dataset: &Dataset, root: &str) -> Result<BTreeMap<String, Vec<String>>> {
        self.read("find", dataset, |conn| {
            Ok(load_rows(conn, dataset, Some(root))?
                .into_iter()
                .map(|row| (row.index, row.documents))
                .collect())
        })
    }

    /// The full two-level map.
    pub fn map(&self, dataset: &Dataset) -> Result<IndexMapType> {
        self.read("map", dataset, |conn| {
            let mut map = IndexMapType::new();
            for row in load_rows(conn, dataset, None)? {
                map.entry(row.root)
                    .or_default()
                    .insert(row.index, row.documents);
            }
            Ok(map)
        })
    }

    /// Concrete index names, optionally restricted to one root.
    pub fn indices(&self, dataset: &Dataset, root: Option<&str>) -> Result<Vec<String>> {
        self.read("indices", dataset, |conn| {
            Ok(load_rows(conn, dataset, root)?
                .into_iter()
                .map(|row| row.index)
                .collect())
        })
    }

    pub fn exists(&self, dataset: &Dataset) -> Result<bool> {
        self.read("exists", dataset, |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM indexmaps WHERE dataset_ref = ?1",
                params![dataset.id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// (root, index, document count) rows for diagnostics and deletion planning.
    pub fn summary(&self, dataset: &Dataset) -> Result<Vec<IndexSummary>> {
        self.read("summary", dataset, |conn| {
            Ok(load_rows(conn, dataset, None)?
                .into_iter()
                .map(|row| IndexSummary {
                    count: row.documents.len(),
                    root: row.root,
                    index: row.index,
                })
                .collect())
        })
    }
}
