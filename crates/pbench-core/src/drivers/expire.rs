//! Expiration driver: retires `INDEXED` datasets past their deletion date.
//!
//! Expiring removes a dataset's documents, index map and unpacked cache.
//! The archived tarball and the dataset row stay; the dataset ends
//! `EXPIRED`.

use super::{purge_documents, BatchResults, DriverContext};
use crate::dataset::{Dataset, State};
use crate::documents::DocumentStore;
use crate::metadata::keys;
use crate::{PbenchError, Result};
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct ExpireDriver {
    ctx: DriverContext,
    store: Arc<dyn DocumentStore>,
}

impl ExpireDriver {
    pub fn new(ctx: DriverContext, store: Arc<dyn DocumentStore>) -> Self {
        Self { ctx, store }
    }

    /// Expire every `INDEXED` dataset whose deletion date is before `today`.
    pub fn run(&self, today: NaiveDate) -> Result<BatchResults> {
        let sync = self.ctx.sync("expire");
        let mut results = BatchResults::default();
        for mut dataset in self.ctx.datasets.list(Some(State::Indexed))? {
            let due = match self.deletion_date(&dataset)? {
                Some(date) => date < today,
                None => false,
            };
            if !due {
                continue;
            }
            if self.ctx.stop.should_stop() {
                info!("Stop requested; leaving remaining datasets for the next pass");
                break;
            }

            let outcome = self.expire_one(&mut dataset);
            if let Err(e) = &outcome {
                error!("Expiring {} failed: {}", dataset, e);
                if dataset.state == State::Expiring {
                    if let Err(restore) = self.ctx.datasets.advance(&mut dataset, State::Indexed) {
                        warn!("Unable to return {} to INDEXED: {}", dataset, restore);
                    }
                }
                if let Err(status) = sync.error(&dataset, &e.to_string()) {
                    warn!("Unable to record expire failure of {}: {}", dataset, status);
                }
            }
            results.record(&outcome);
        }
        info!("Expire pass before {}: {}", today, results);
        Ok(results)
    }

    fn deletion_date(&self, dataset: &Dataset) -> Result<Option<NaiveDate>> {
        let value = self
            .ctx
            .metadata
            .get_value_opt(dataset, keys::DELETION, None)?;
        let Some(text) = value.as_ref().and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        match NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            Ok(date) => Ok(Some(date)),
            Err(_) => {
                warn!("{} has unreadable deletion date {:?}", dataset, text);
                Ok(None)
            }
        }
    }

    fn expire_one(&self, dataset: &mut Dataset) -> Result<()> {
        self.ctx.stop.check()?;
        self.ctx.datasets.advance(dataset, State::Expiring)?;
        let purged = purge_documents(&self.ctx, self.store.as_ref(), dataset)?;
        self.ctx.index_map.delete(dataset, None)?;
        match self.ctx.cache.uncache(&dataset.resource_id) {
            Ok(()) | Err(PbenchError::TarballNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        self.ctx.datasets.advance(dataset, State::Expired)?;
        info!("Expired {}: {}", dataset, purged);
        Ok(())
    }
}
