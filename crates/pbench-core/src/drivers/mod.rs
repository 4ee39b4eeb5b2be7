//! Batch drivers for the dataset pipeline.
//!
//! Each driver asks the [`SyncTracker`] for the datasets waiting on its
//! operation, processes them one at a time and reports a [`BatchResults`].
//! Drivers are synchronous; the server runs them on blocking threads.
//! A stop request ends a pass after the current dataset; an abort also
//! fails the current dataset before its next subprocess or bulk batch.

pub mod backup;
pub mod delete;
pub mod expire;
pub mod index;
pub mod unpack;

pub use backup::BackupDriver;
pub use delete::delete_dataset;
pub use expire::ExpireDriver;
pub use index::IndexDriver;
pub use unpack::{SizeBucket, UnpackDriver};

use crate::bulk::{classify, tally, BulkAction, BulkTally};
use crate::cache::CacheManager;
use crate::config::ServerConfig;
use crate::dataset::{Dataset, DatasetStore};
use crate::db::Database;
use crate::documents::DocumentStore;
use crate::index_map::{unique_documents_by_index, IndexMapStore};
use crate::metadata::MetadataStore;
use crate::stop::StopToken;
use crate::sync::SyncTracker;
use crate::{PbenchError, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Counts from one driver pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchResults {
    /// Datasets the pass attempted.
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    /// Candidates passed over without an attempt.
    pub skipped: usize,
}

impl BatchResults {
    /// Record the outcome of one attempted dataset.
    pub fn record<T>(&mut self, outcome: &Result<T>) {
        self.total += 1;
        match outcome {
            Ok(_) => self.success += 1,
            Err(_) => self.failed += 1,
        }
    }
}

impl fmt::Display for BatchResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total: {}, Success: {}, Failed: {}, Skipped: {}",
            self.total, self.success, self.failed, self.skipped
        )
    }
}

/// Stores and settings shared by every driver.
#[derive(Clone)]
pub struct DriverContext {
    pub datasets: DatasetStore,
    pub metadata: MetadataStore,
    pub index_map: IndexMapStore,
    pub cache: Arc<CacheManager>,
    pub stop: StopToken,
    pub index_batch_size: usize,
    db: Database,
}

impl DriverContext {
    pub fn new(
        config: &ServerConfig,
        db: Database,
        cache: Arc<CacheManager>,
        stop: StopToken,
    ) -> Self {
        Self {
            datasets: DatasetStore::new(db.clone()),
            metadata: MetadataStore::from_config(db.clone(), config),
            index_map: IndexMapStore::new(db.clone()),
            cache,
            stop,
            index_batch_size: config.index_batch_size,
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// A pending-operation tracker for one component.
    pub fn sync(&self, component: &str) -> SyncTracker {
        SyncTracker::new(self.db.clone(), component)
    }
}

/// Delete every document the index map records for a dataset.
///
/// Ids are de-duplicated per index and a missing document counts as
/// deleted, so repeating a purge is harmless. Any other failure is an
/// error and the map is left for a later attempt.
pub(crate) fn purge_documents(
    ctx: &DriverContext,
    store: &dyn DocumentStore,
    dataset: &Dataset,
) -> Result<BulkTally> {
    let map = ctx.index_map.map(dataset)?;
    let actions: Vec<BulkAction> = unique_documents_by_index(&map)
        .into_iter()
        .flat_map(|(index, ids)| {
            ids.into_iter()
                .map(move |id| BulkAction::delete(index.clone(), id))
        })
        .collect();

    let mut result = BulkTally::default();
    for batch in actions.chunks(ctx.index_batch_size.max(1)) {
        ctx.stop.check()?;
        let responses = store.bulk(batch)?;
        if responses.len() != batch.len() {
            return Err(PbenchError::DocumentStore {
                message: format!(
                    "{} responses for {} delete actions",
                    responses.len(),
                    batch.len()
                ),
            });
        }
        let outcomes: Vec<_> = batch
            .iter()
            .zip(&responses)
            .map(|(action, response)| classify(action, response))
            .collect();
        result = result.merge(&tally(&outcomes));
    }

    if result.failures() > 0 {
        return Err(PbenchError::DocumentStore {
            message: format!("unable to delete documents of {}: {}", dataset, result),
        });
    }
    debug!("Purged documents of {}: {}", dataset, result);
    Ok(result)
}
