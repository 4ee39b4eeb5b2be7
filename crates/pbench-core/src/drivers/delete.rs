//! Dataset deletion.

use super::{purge_documents, DriverContext};
use crate::bulk::BulkTally;
use crate::dataset::Dataset;
use crate::documents::DocumentStore;
use crate::{PbenchError, Result};
use tracing::info;

/// Delete a dataset: its documents, index map, archive and cache copies,
/// and finally the row with its metadata.
///
/// Datasets in a mutating state are refused with `DatasetBusy`. Documents
/// that are already gone count as deleted, so a deletion interrupted after
/// the purge can simply be repeated.
///
/// A driver can claim the dataset between the first state check and the
/// cache lock, so the row is checked again under the exclusive lock before
/// anything is removed. A driver claiming it after that waits on the lock
/// and then finds the archive gone.
pub fn delete_dataset(
    ctx: &DriverContext,
    store: &dyn DocumentStore,
    resource_id: &str,
) -> Result<BulkTally> {
    let mut dataset = ctx.datasets.query_by_resource_id(resource_id)?;
    ensure_idle(&dataset)?;
    ctx.stop.check()?;

    let purged = ctx.cache.delete_with(resource_id, || {
        ctx.datasets.refresh(&mut dataset)?;
        ensure_idle(&dataset)?;
        let purged = purge_documents(ctx, store, &dataset)?;
        ctx.index_map.delete(&dataset, None)?;
        Ok(purged)
    })?;
    ctx.datasets.delete(&dataset)?;
    info!("Deleted {}: {}", dataset, purged);
    Ok(purged)
}

fn ensure_idle(dataset: &Dataset) -> Result<()> {
    if dataset.state.is_mutating() {
        return Err(PbenchError::DatasetBusy {
            dataset: dataset.to_string(),
            state: dataset.state,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BulkAction;
    use crate::cache::tests::make_tarball;
    use crate::cache::{CacheLock, LockMode};
    use crate::dataset::tests::{dataset_in_state, new_dataset};
    use crate::dataset::{NewDataset, State};
    use crate::documents::MemoryDocumentStore;
    use crate::drivers::tests::create_test_context;
    use crate::index_map::IndexMapType;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn test_delete_dataset() {
        let (temp, _config, ctx) = create_test_context();
        let source = make_tarball(&temp.path().join("staging"), "fio_run", Some("node1"));
        let tarball = ctx.cache.create(&source).unwrap();
        let mut ds = ctx
            .datasets
            .create(NewDataset {
                resource_id: tarball.resource_id.clone(),
                ..new_dataset("fio_run", "unused")
            })
            .unwrap();
        ctx.datasets.advance(&mut ds, State::Uploaded).unwrap();

        let store = MemoryDocumentStore::new();
        store
            .bulk(&[BulkAction::index("idx", "d1", json!({}))])
            .unwrap();
        let mut map = IndexMapType::new();
        map.insert(
            "run-toc".into(),
            BTreeMap::from([(
                "idx".to_string(),
                vec!["d1".to_string(), "d1".to_string(), "d2".to_string()],
            )]),
        );
        ctx.index_map.create(&ds, &map).unwrap();

        let purged = delete_dataset(&ctx, &store, &ds.resource_id).unwrap();
        assert_eq!(purged.ok, 1);
        assert_eq!(purged.not_found, 1);
        assert!(store.is_empty());
        assert!(!tarball.tarball_path.exists());
        assert!(matches!(
            ctx.datasets.query_by_resource_id(&ds.resource_id),
            Err(PbenchError::DatasetNotFound { .. })
        ));
        assert!(matches!(
            delete_dataset(&ctx, &store, &ds.resource_id),
            Err(PbenchError::DatasetNotFound { .. })
        ));
    }

    #[test]
    fn test_busy_dataset_refused() {
        let (_temp, _config, ctx) = create_test_context();
        let ds = dataset_in_state(&ctx.datasets, "abc123", State::Indexing);
        let store = MemoryDocumentStore::new();
        assert!(matches!(
            delete_dataset(&ctx, &store, &ds.resource_id),
            Err(PbenchError::DatasetBusy { .. })
        ));
        assert!(ctx.datasets.query_by_resource_id("abc123").is_ok());
    }

    #[test]
    fn test_delete_rechecks_state_under_cache_lock() {
        let (temp, _config, ctx) = create_test_context();
        let source = make_tarball(&temp.path().join("staging"), "fio_run", Some("node1"));
        let tarball = ctx.cache.create(&source).unwrap();
        let mut ds = ctx
            .datasets
            .create(NewDataset {
                resource_id: tarball.resource_id.clone(),
                ..new_dataset("fio_run", "unused")
            })
            .unwrap();
        ctx.datasets.advance(&mut ds, State::Uploaded).unwrap();

        let held = CacheLock::acquire(
            ctx.cache.lock_path(&ds.resource_id),
            LockMode::Exclusive,
            true,
        )
        .unwrap();
        let deleter = {
            let ctx = ctx.clone();
            let resource_id = ds.resource_id.clone();
            std::thread::spawn(move || {
                delete_dataset(&ctx, &MemoryDocumentStore::new(), &resource_id)
            })
        };
        std::thread::sleep(Duration::from_millis(200));
        // An unpack pass claims the dataset while the deletion waits
        ctx.datasets.advance(&mut ds, State::Unpacking).unwrap();
        drop(held);

        assert!(matches!(
            deleter.join().unwrap(),
            Err(PbenchError::DatasetBusy { .. })
        ));
        assert!(tarball.tarball_path.is_file());
        let current = ctx.datasets.query_by_resource_id(&ds.resource_id).unwrap();
        assert_eq!(current.state, State::Unpacking);
    }

    #[test]
    fn test_delete_without_archive() {
        let (_temp, _config, ctx) = create_test_context();
        let ds = dataset_in_state(&ctx.datasets, "abc123", State::Quarantined);
        let store = MemoryDocumentStore::new();
        let purged = delete_dataset(&ctx, &store, &ds.resource_id).unwrap();
        assert_eq!(purged.total(), 0);
    }
}
