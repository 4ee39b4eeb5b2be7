//! Index driver: feeds unpacked datasets to the document store.
//!
//! Documents are sent in batches; after every batch the ids the store
//! accepted are merged into the dataset's index map, so an interrupted pass
//! still knows which documents to delete later.

use super::{purge_documents, BatchResults, DriverContext};
use crate::bulk::{classify, tally, BulkAction, BulkOutcome, BulkTally};
use crate::dataset::{Dataset, State};
use crate::documents::{DocumentGenerator, DocumentStore, IndexDocument};
use crate::index_map::IndexMapType;
use crate::metadata::keys;
use crate::sync::{Operation, SyncTracker};
use crate::{PbenchError, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub struct IndexDriver {
    ctx: DriverContext,
    sync: SyncTracker,
    store: Arc<dyn DocumentStore>,
    generator: Arc<dyn DocumentGenerator>,
}

impl IndexDriver {
    pub fn new(
        ctx: DriverContext,
        store: Arc<dyn DocumentStore>,
        generator: Arc<dyn DocumentGenerator>,
    ) -> Self {
        let sync = ctx.sync("index");
        Self {
            ctx,
            sync,
            store,
            generator,
        }
    }

    /// Index every dataset pending `operation` (`INDEX` or `RE_INDEX`).
    pub fn run(&self, operation: Operation) -> Result<BatchResults> {
        if !matches!(operation, Operation::Index | Operation::ReIndex) {
            return Err(PbenchError::DatasetBadParameterType {
                value: operation.to_string(),
                expected: "indexing operation".to_string(),
            });
        }
        let mut results = BatchResults::default();
        for mut dataset in self.sync.next(operation)? {
            if self.ctx.stop.should_stop() {
                info!("Stop requested; leaving remaining datasets for the next pass");
                break;
            }
            let outcome = self.index_one(&mut dataset, operation);
            if let Err(e) = &outcome {
                error!("{} of {} failed: {}", operation, dataset, e);
                if let Err(status) = self.sync.error(&dataset, &e.to_string()) {
                    warn!("Unable to record index failure of {}: {}", dataset, status);
                }
            }
            results.record(&outcome);
        }
        info!("{} pass: {}", operation, results);
        Ok(results)
    }

    fn index_one(&self, dataset: &mut Dataset, operation: Operation) -> Result<BulkTally> {
        self.ctx.stop.check()?;
        let start = Instant::now();
        // A dataset left INDEXING by an earlier failure is retried as it is
        if dataset.state != State::Indexing {
            self.ctx.datasets.advance(dataset, State::Indexing)?;
        }
        if operation == Operation::ReIndex {
            purge_documents(&self.ctx, self.store.as_ref(), dataset)?;
            self.ctx.index_map.delete(dataset, None)?;
            self.ctx.metadata.remove(dataset, keys::REINDEX, None)?;
        }

        let documents = {
            let reader = self.ctx.cache.get_results(&dataset.resource_id)?;
            self.generator.generate(dataset, reader.root())?
        };

        let mut result = BulkTally::default();
        for batch in documents.chunks(self.ctx.index_batch_size.max(1)) {
            self.ctx.stop.check()?;
            result = result.merge(&self.send(dataset, batch)?);
        }

        if !documents.is_empty() && result.ok == 0 {
            return Err(PbenchError::DocumentStore {
                message: format!("all {} documents failed: {}", documents.len(), result),
            });
        }
        self.ctx.datasets.advance(dataset, State::Indexed)?;
        self.sync
            .update(dataset, Some(operation), &[], Some(&result.to_string()))?;
        info!(
            "Indexed {} documents of {} in {:.3}s: {}",
            documents.len(),
            dataset,
            start.elapsed().as_secs_f64(),
            result
        );
        Ok(result)
    }

    /// Send one batch and record the accepted ids in the index map.
    fn send(&self, dataset: &Dataset, batch: &[IndexDocument]) -> Result<BulkTally> {
        let actions: Vec<BulkAction> = batch.iter().map(IndexDocument::action).collect();
        let responses = self.store.bulk(&actions)?;
        if responses.len() != actions.len() {
            return Err(PbenchError::DocumentStore {
                message: format!(
                    "{} responses for {} index actions",
                    responses.len(),
                    actions.len()
                ),
            });
        }

        let mut accepted = IndexMapType::new();
        let mut outcomes = Vec::with_capacity(batch.len());
        for ((document, action), response) in batch.iter().zip(&actions).zip(&responses) {
            let outcome = classify(action, response);
            match &outcome {
                BulkOutcome::Ok => accepted
                    .entry(document.root.clone())
                    .or_default()
                    .entry(document.index.clone())
                    .or_default()
                    .push(document.id.clone()),
                BulkOutcome::Failed { error_type } => debug!(
                    "Document {} of {} rejected: {} {}",
                    document.id,
                    dataset,
                    error_type,
                    response.reason.as_deref().unwrap_or_default()
                ),
                BulkOutcome::NotFound => {}
            }
            outcomes.push(outcome);
        }
        if !accepted.is_empty() {
            self.ctx.index_map.merge(dataset, &accepted)?;
        }
        Ok(tally(&outcomes))
    }
}
