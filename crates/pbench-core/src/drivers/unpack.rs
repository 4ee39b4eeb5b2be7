//! Unpack driver: `UPLOADED` datasets pending `UNPACK` become `UNPACKED`.

use super::{BatchResults, DriverContext};
use crate::cache::unpacked_size;
use crate::dataset::{Dataset, State};
use crate::metadata::keys;
use crate::sync::{Operation, SyncTracker};
use crate::Result;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};

/// Tarball size range handled by one unpack pass, `[min_size, max_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBucket {
    pub min_size: u64,
    pub max_size: u64,
}

impl SizeBucket {
    pub const ALL: SizeBucket = SizeBucket {
        min_size: 0,
        max_size: u64::MAX,
    };

    pub fn contains(&self, size: u64) -> bool {
        self.min_size <= size && size < self.max_size
    }
}

impl Default for SizeBucket {
    fn default() -> Self {
        Self::ALL
    }
}

pub struct UnpackDriver {
    ctx: DriverContext,
    sync: SyncTracker,
}

impl UnpackDriver {
    pub fn new(ctx: DriverContext) -> Self {
        let sync = ctx.sync("unpack");
        Self { ctx, sync }
    }

    /// Unpack every pending dataset whose tarball falls in `bucket`,
    /// smallest path first.
    pub fn run(&self, bucket: SizeBucket) -> Result<BatchResults> {
        let mut results = BatchResults::default();
        let mut targets: Vec<(PathBuf, Dataset)> = Vec::new();
        for dataset in self.sync.next(Operation::Unpack)? {
            let path = self
                .ctx
                .metadata
                .get_value_opt(&dataset, keys::TARBALL_PATH, None)?
                .and_then(|v| v.as_str().map(PathBuf::from));
            let Some(path) = path else {
                warn!("{} has no tarball path; skipping", dataset);
                results.skipped += 1;
                continue;
            };
            match std::fs::metadata(&path) {
                Ok(meta) if bucket.contains(meta.len()) => targets.push((path, dataset)),
                Ok(_) => {}
                Err(e) => {
                    error!("Tarball {} does not resolve to a file: {}", path.display(), e);
                    results.skipped += 1;
                }
            }
        }
        targets.sort_by(|a, b| a.0.cmp(&b.0));

        for (path, mut dataset) in targets {
            if self.ctx.stop.should_stop() {
                info!("Stop requested; leaving remaining datasets for the next pass");
                break;
            }
            let outcome = self.unpack_one(&mut dataset);
            if let Err(e) = &outcome {
                error!("Unpacking of tarball {} failed: {}", path.display(), e);
                if let Err(status) = self.sync.error(&dataset, &e.to_string()) {
                    warn!("Unable to record unpack failure of {}: {}", dataset, status);
                }
            }
            results.record(&outcome);
        }
        info!("Unpack pass {:?}: {}", bucket, results);
        Ok(results)
    }

    fn unpack_one(&self, dataset: &mut Dataset) -> Result<()> {
        self.ctx.stop.check()?;
        // An earlier failed pass may have left the dataset UNPACKING
        if dataset.state != State::Unpacking {
            self.ctx.datasets.advance(dataset, State::Unpacking)?;
        }

        let start = Instant::now();
        let root = self.ctx.cache.unpack(&dataset.resource_id)?;
        let seconds = start.elapsed().as_secs_f64();

        let metadata = &self.ctx.metadata;
        if metadata
            .get_value_opt(dataset, keys::UNPACKED, None)?
            .is_none()
        {
            metadata.set_value(dataset, keys::UNPACKED, json!(unpacked_size(&root)), None)?;
        }
        let perf = metadata.get_value_opt(dataset, keys::UNPACK_PERF, None)?;
        metadata.set_value(dataset, keys::UNPACK_PERF, unpack_perf(perf, seconds), None)?;

        self.ctx.datasets.advance(dataset, State::Unpacked)?;
        self.sync
            .update(dataset, Some(Operation::Unpack), &[Operation::Index], None)
    }
}

/// Fold one unpack time into the `{min, max, count}` statistic.
fn unpack_perf(previous: Option<Value>, seconds: f64) -> Value {
    match previous {
        Some(Value::Object(metric)) => {
            let field = |name: &str, default: f64| {
                metric.get(name).and_then(Value::as_f64).unwrap_or(default)
            };
            let count = metric.get("count").and_then(Value::as_u64).unwrap_or(0);
            json!({
                "min": field("min", f64::MAX).min(seconds),
                "max": field("max", 0.0).max(seconds),
                "count": count + 1,
            })
        }
        _ => json!({"min": seconds, "max": seconds, "count": 1}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::make_tarball;
    use crate::dataset::tests::new_dataset;
    use crate::drivers::tests::create_test_context;
    use crate::dataset::NewDataset;
    use tempfile::TempDir;

    /// Archive a tarball and register an `UPLOADED` dataset pending UNPACK.
    fn uploaded(ctx: &DriverContext, temp: &TempDir, name: &str) -> Dataset {
        let source = make_tarball(&temp.path().join("staging"), name, Some("node1"));
        let tarball = ctx.cache.create(&source).unwrap();
        let mut ds = ctx
            .datasets
            .create(NewDataset {
                resource_id: tarball.resource_id.clone(),
                ..new_dataset(name, "unused")
            })
            .unwrap();
        ctx.metadata
            .set_value(
                &mut ds,
                keys::TARBALL_PATH,
                json!(tarball.tarball_path.display().to_string()),
                None,
            )
            .unwrap();
        ctx.datasets.advance(&mut ds, State::Uploaded).unwrap();
        ctx.sync("upload")
            .update(&ds, None, &[Operation::Unpack], None)
            .unwrap();
        ds
    }

    #[test]
    fn test_unpack_perf() {
        let first = unpack_perf(None, 2.0);
        assert_eq!(first, json!({"min": 2.0, "max": 2.0, "count": 1}));
        let second = unpack_perf(Some(first), 0.5);
        assert_eq!(second, json!({"min": 0.5, "max": 2.0, "count": 2}));
        assert_eq!(
            unpack_perf(Some(json!("garbage")), 1.0),
            json!({"min": 1.0, "max": 1.0, "count": 1})
        );
    }

    #[test]
    fn test_size_bucket() {
        let bucket = SizeBucket {
            min_size: 10,
            max_size: 20,
        };
        assert!(!bucket.contains(9));
        assert!(bucket.contains(10));
        assert!(!bucket.contains(20));
        assert!(SizeBucket::default().contains(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_unpack_pass() {
        let (temp, config, ctx) = create_test_context();
        let mut ds = uploaded(&ctx, &temp, "fio_run");
        let driver = UnpackDriver::new(ctx.clone());

        let results = driver.run(SizeBucket::ALL).unwrap();
        assert_eq!(results.total, 1);
        assert_eq!(results.success, 1);

        ctx.datasets.refresh(&mut ds).unwrap();
        assert_eq!(ds.state, State::Unpacked);
        assert!(config.incoming_root.join("node1").join("fio_run").is_dir());
        assert!(ctx
            .metadata
            .get_value(&ds, keys::UNPACKED, None)
            .unwrap()
            .as_u64()
            .is_some());
        assert_eq!(
            ctx.metadata
                .get_value(&ds, "server.unpack-perf.count", None)
                .unwrap(),
            json!(1)
        );
        let sync = ctx.sync("unpack");
        assert_eq!(sync.pending(&ds).unwrap(), vec![Operation::Index]);

        // Nothing left to do
        let again = driver.run(SizeBucket::ALL).unwrap();
        assert_eq!(again.total, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_bucket_filters_by_size() {
        let (temp, _config, ctx) = create_test_context();
        let ds = uploaded(&ctx, &temp, "fio_run");
        let driver = UnpackDriver::new(ctx.clone());

        let results = driver
            .run(SizeBucket {
                min_size: u64::MAX - 1,
                max_size: u64::MAX,
            })
            .unwrap();
        assert_eq!(results, BatchResults::default());
        assert_eq!(
            ctx.sync("unpack").pending(&ds).unwrap(),
            vec![Operation::Unpack]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_retry_from_unpacking() {
        let (temp, _config, ctx) = create_test_context();
        let mut ds = uploaded(&ctx, &temp, "fio_run");
        ctx.datasets.advance(&mut ds, State::Unpacking).unwrap();

        let results = UnpackDriver::new(ctx.clone()).run(SizeBucket::ALL).unwrap();
        assert_eq!(results.success, 1);
        ctx.datasets.refresh(&mut ds).unwrap();
        assert_eq!(ds.state, State::Unpacked);
    }

    #[test]
    fn test_missing_tarball_is_skipped() {
        let (_temp, _config, ctx) = create_test_context();
        let mut ds = ctx.datasets.create(new_dataset("gone", "abc123")).unwrap();
        ctx.metadata
            .set_value(&mut ds, keys::TARBALL_PATH, json!("/nonexistent/gone.tar.xz"), None)
            .unwrap();
        ctx.sync("upload")
            .update(&ds, None, &[Operation::Unpack], None)
            .unwrap();

        let results = UnpackDriver::new(ctx).run(SizeBucket::ALL).unwrap();
        assert_eq!(results.skipped, 1);
        assert_eq!(results.total, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_request_ends_pass() {
        let (temp, _config, ctx) = create_test_context();
        uploaded(&ctx, &temp, "fio_run");
        ctx.stop.request_stop();

        let results = UnpackDriver::new(ctx).run(SizeBucket::ALL).unwrap();
        assert_eq!(results.total, 0);
    }
}
