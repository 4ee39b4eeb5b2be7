//! Backup driver: copies archived tarballs to a [`BackupSink`].

use super::{BatchResults, DriverContext};
use crate::backup::BackupSink;
use crate::config::CacheConfig;
use crate::dataset::Dataset;
use crate::metadata::keys;
use crate::sync::{Operation, SyncTracker};
use crate::{PbenchError, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct BackupDriver {
    ctx: DriverContext,
    sync: SyncTracker,
    sink: Arc<dyn BackupSink>,
}

impl BackupDriver {
    pub fn new(ctx: DriverContext, sink: Arc<dyn BackupSink>) -> Self {
        let sync = ctx.sync("backup");
        Self { ctx, sync, sink }
    }

    /// Back up every dataset pending `BACKUP`.
    pub fn run(&self) -> Result<BatchResults> {
        let mut results = BatchResults::default();
        for mut dataset in self.sync.next(Operation::Backup)? {
            if self.ctx.stop.should_stop() {
                info!("Stop requested; leaving remaining datasets for the next pass");
                break;
            }
            let outcome = self.backup_one(&mut dataset);
            if let Err(e) = &outcome {
                error!("Backup of {} failed: {}", dataset, e);
                if let Err(status) = self.sync.error(&dataset, &e.to_string()) {
                    warn!("Unable to record backup failure of {}: {}", dataset, status);
                }
            }
            results.record(&outcome);
        }
        info!("Backup pass: {}", results);
        Ok(results)
    }

    fn backup_one(&self, dataset: &mut Dataset) -> Result<()> {
        self.ctx.stop.check()?;
        let tarball = self.ctx.cache.find_dataset(&dataset.resource_id)?;
        let key = format!(
            "{}/{}/{}{}",
            tarball.controller,
            tarball.resource_id,
            tarball.name,
            CacheConfig::TARBALL_SUFFIX
        );

        if self.sink.verify(&key, &tarball.resource_id)? {
            debug!("{} is already backed up as {}", dataset, key);
        } else {
            self.sink.put(&tarball.tarball_path, &key)?;
            if !self.sink.verify(&key, &tarball.resource_id)? {
                return Err(PbenchError::Backup {
                    key,
                    message: "backup copy does not match the archive MD5".to_string(),
                });
            }
        }

        self.ctx
            .metadata
            .set_value(dataset, keys::ARCHIVED, Value::Bool(true), None)?;
        self.sync
            .update(dataset, Some(Operation::Backup), &[], Some("ok"))?;
        info!("Backed up {} as {}", dataset, key);
        Ok(())
    }
}
