//! Hand-off between pipeline stages.
//!
//! The set of operations still owed for a dataset lives in the
//! `server.operation` metadata key. Stages ask for the datasets waiting on
//! their operation with [`SyncTracker::next`] and report completion with
//! [`SyncTracker::update`]. Nothing is claimed: a dataset that drops out of a
//! later `next` was handled by another worker.

use crate::dataset::{row_to_dataset, Dataset, COLUMNS};
use crate::db::Database;
use crate::metadata::{keys, rows};
use crate::{PbenchError, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// A pipeline operation a dataset can be waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Backup,
    Delete,
    Unpack,
    CopySos,
    Index,
    IndexTool,
    ReIndex,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::Backup,
        Operation::Delete,
        Operation::Unpack,
        Operation::CopySos,
        Operation::Index,
        Operation::IndexTool,
        Operation::ReIndex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Backup => "BACKUP",
            Operation::Delete => "DELETE",
            Operation::Unpack => "UNPACK",
            Operation::CopySos => "COPY_SOS",
            Operation::Index => "INDEX",
            Operation::IndexTool => "INDEX_TOOL",
            Operation::ReIndex => "RE_INDEX",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = PbenchError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_uppercase();
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == upper)
            .ok_or_else(|| PbenchError::DatasetBadParameterType {
                value: s.to_string(),
                expected: "operation".to_string(),
            })
    }
}

/// Read the stored operation list as names.
fn operation_names(value: Option<Value>) -> BTreeSet<String> {
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// Pending-operation tracker for one pipeline component.
#[derive(Clone)]
pub struct SyncTracker {
    db: Database,
    component: String,
}

impl fmt::Display for SyncTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Synchronizer for component {:?}>", self.component)
    }
}

impl SyncTracker {
    pub fn new(db: Database, component: impl Into<String>) -> Self {
        Self {
            db,
            component: component.into(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Datasets whose pending set contains `operation`, ordered by name.
    pub fn next(&self, operation: Operation) -> Result<Vec<Dataset>> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM datasets WHERE id IN (
                 SELECT m.dataset_ref FROM dataset_metadata m,
                     json_each(m.value, '$.operation') op
                 WHERE m.key = ?1 AND m.user_id = '' AND op.value = ?2
             )
             ORDER BY name"
        ))?;
        let datasets = stmt
            .query_map(params![keys::SERVER, operation.as_str()], row_to_dataset)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        debug!("{}: {} datasets pending {}", self, datasets.len(), operation);
        Ok(datasets)
    }

    /// Operations still pending for a dataset.
    pub fn pending(&self, dataset: &Dataset) -> Result<Vec<Operation>> {
        let conn = self.db.lock_conn()?;
        let names = operation_names(rows::get_path(&conn, dataset, keys::OPERATION, None)?);
        Ok(names
            .iter()
            .filter_map(|name| match name.parse() {
                Ok(op) => Some(op),
                Err(_) => {
                    warn!("{} has unknown pending operation {:?}", dataset, name);
                    None
                }
            })
            .collect())
    }

    /// Record that `did` is finished and `enabled` operations are now due.
    ///
    /// Removing an operation that is not pending is a no-op. The status
    /// defaults to `"ok"` when operations are enabled; with neither a status
    /// nor enabled operations, no status is written. Everything commits in
    /// one transaction.
    pub fn update(
        &self,
        dataset: &Dataset,
        did: Option<Operation>,
        enabled: &[Operation],
        status: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.db.lock_conn()?;
        let tx = conn.transaction()?;

        let mut operations = operation_names(rows::get_path(&tx, dataset, keys::OPERATION, None)?);
        if let Some(did) = did {
            operations.remove(did.as_str());
        }
        operations.extend(enabled.iter().map(|op| op.as_str().to_string()));
        let message = status.or(if enabled.is_empty() { None } else { Some("ok") });

        let list: Vec<Value> = operations.into_iter().map(Value::String).collect();
        rows::set_path(&tx, dataset, keys::OPERATION, Value::Array(list), None)?;
        if let Some(message) = message {
            rows::set_path(
                &tx,
                dataset,
                &keys::status_key(&self.component),
                Value::from(message),
                None,
            )?;
        }
        tx.commit()?;
        debug!(
            "{}: {} did {:?}, enabled {:?}",
            self, dataset, did, enabled
        );
        Ok(())
    }

    /// Record a failure for this component without touching the pending set.
    pub fn error(&self, dataset: &Dataset, message: &str) -> Result<()> {
        let conn = self.db.lock_conn()?;
        rows::set_path(
            &conn,
            dataset,
            &keys::status_key(&self.component),
            Value::from(message),
            None,
        )?;
        warn!("{}: {} failed: {}", self, dataset, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::{create_test_store, new_dataset};
    use crate::metadata::MetadataStore;
    use serde_json::json;

    fn names(datasets: &[Dataset]) -> Vec<&str> {
        datasets.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn test_operation_names() {
        assert_eq!("copy_sos".parse::<Operation>().unwrap(), Operation::CopySos);
        assert_eq!(Operation::ReIndex.to_string(), "RE_INDEX");
        assert_eq!(
            serde_json::to_value(Operation::IndexTool).unwrap(),
            json!("INDEX_TOOL")
        );
        assert!("SHRED".parse::<Operation>().is_err());
    }

    #[test]
    fn test_handoff_between_stages() {
        let store = create_test_store();
        let ds = store.create(new_dataset("fio", "abc123")).unwrap();
        let sync = SyncTracker::new(store.database().clone(), "unpack");

        sync.update(&ds, None, &[Operation::Unpack], None).unwrap();
        assert_eq!(names(&sync.next(Operation::Unpack).unwrap()), vec!["fio"]);

        sync.update(&ds, Some(Operation::Unpack), &[Operation::Index], None)
            .unwrap();
        assert!(sync.next(Operation::Unpack).unwrap().is_empty());
        assert_eq!(names(&sync.next(Operation::Index).unwrap()), vec!["fio"]);
        assert_eq!(sync.pending(&ds).unwrap(), vec![Operation::Index]);
    }

    #[test]
    fn test_next_matches_whole_names() {
        let store = create_test_store();
        let ds = store.create(new_dataset("fio", "abc123")).unwrap();
        let sync = SyncTracker::new(store.database().clone(), "index");
        sync.update(&ds, None, &[Operation::IndexTool], None).unwrap();

        assert!(sync.next(Operation::Index).unwrap().is_empty());
        assert_eq!(sync.next(Operation::IndexTool).unwrap().len(), 1);
    }

    #[test]
    fn test_next_orders_by_name() {
        let store = create_test_store();
        let sync = SyncTracker::new(store.database().clone(), "unpack");
        for (name, rid) in [("zeta", "r1"), ("alpha", "r2"), ("mid", "r3")] {
            let ds = store.create(new_dataset(name, rid)).unwrap();
            sync.update(&ds, None, &[Operation::Unpack], None).unwrap();
        }
        assert_eq!(
            names(&sync.next(Operation::Unpack).unwrap()),
            vec!["alpha", "mid", "zeta"]
        );
    }

    #[test]
    fn test_update_status_defaults() {
        let store = create_test_store();
        let ds = store.create(new_dataset("fio", "abc123")).unwrap();
        let metadata = MetadataStore::new(store.database().clone(), 3650);
        let sync = SyncTracker::new(store.database().clone(), "Unpack");

        sync.update(&ds, None, &[], None).unwrap();
        assert!(metadata
            .get_value_opt(&ds, "server.status.unpack", None)
            .unwrap()
            .is_none());

        sync.update(&ds, None, &[Operation::Unpack, Operation::Backup], None)
            .unwrap();
        assert_eq!(
            metadata.get_value(&ds, "server.status.unpack", None).unwrap(),
            json!("ok")
        );
        assert_eq!(
            metadata.get_value(&ds, keys::OPERATION, None).unwrap(),
            json!(["BACKUP", "UNPACK"])
        );

        sync.update(&ds, Some(Operation::Unpack), &[], Some("unpacked in 2s"))
            .unwrap();
        assert_eq!(
            metadata.get_value(&ds, "server.status.unpack", None).unwrap(),
            json!("unpacked in 2s")
        );
    }

    #[test]
    fn test_removing_absent_operation_is_noop() {
        let store = create_test_store();
        let ds = store.create(new_dataset("fio", "abc123")).unwrap();
        let sync = SyncTracker::new(store.database().clone(), "backup");
        sync.update(&ds, None, &[Operation::Backup], None).unwrap();

        sync.update(&ds, Some(Operation::Index), &[], None).unwrap();
        assert_eq!(sync.pending(&ds).unwrap(), vec![Operation::Backup]);
    }

    #[test]
    fn test_error_keeps_pending_set() {
        let store = create_test_store();
        let ds = store.create(new_dataset("fio", "abc123")).unwrap();
        let metadata = MetadataStore::new(store.database().clone(), 3650);
        let sync = SyncTracker::new(store.database().clone(), "index");
        sync.update(&ds, None, &[Operation::Index], None).unwrap();

        sync.error(&ds, "document store unreachable").unwrap();
        assert_eq!(sync.pending(&ds).unwrap(), vec![Operation::Index]);
        assert_eq!(
            metadata.get_value(&ds, "server.status.index", None).unwrap(),
            json!("document store unreachable")
        );
    }

    #[test]
    fn test_other_metadata_survives_update() {
        let store = create_test_store();
        let mut ds = store.create(new_dataset("fio", "abc123")).unwrap();
        let metadata = MetadataStore::new(store.database().clone(), 3650);
        metadata
            .set_value(&mut ds, keys::TARBALL_PATH, json!("/srv/a.tar.xz"), None)
            .unwrap();
        let sync = SyncTracker::new(store.database().clone(), "unpack");
        sync.update(&ds, None, &[Operation::Unpack], None).unwrap();

        assert_eq!(
            metadata.get_value(&ds, keys::TARBALL_PATH, None).unwrap(),
            json!("/srv/a.tar.xz")
        );
    }
}
