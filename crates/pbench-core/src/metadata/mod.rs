//! Per-dataset metadata store.
//!
//! Values are arbitrary JSON addressed by dotted key paths. Two read
//! patterns are offered: [`MetadataStore::get_value`] treats a missing key
//! as an error, while [`MetadataStore::get_value_opt`] returns `None`.

pub mod keys;
pub(crate) mod rows;

use crate::config::{MetadataConfig, ServerConfig};
use crate::dataset::{rename_in, Dataset};
use crate::db::Database;
use crate::{PbenchError, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

/// Metadata access for datasets.
#[derive(Clone)]
pub struct MetadataStore {
    db: Database,
    max_retention_days: u32,
}

impl MetadataStore {
    pub fn new(db: Database, max_retention_days: u32) -> Self {
        Self {
            db,
            max_retention_days,
        }
    }

    pub fn from_config(db: Database, config: &ServerConfig) -> Self {
        Self::new(db, config.max_retention_days)
    }

    // ========================================
    // Reads
    // ========================================

    /// Fetch the raw value of a native row key.
    pub fn get(&self, dataset: &Dataset, native_key: &str, user: Option<&str>) -> Result<Value> {
        let native = native_key.to_lowercase();
        if !keys::NATIVE_KEYS.contains(&native.as_str()) {
            return Err(PbenchError::MetadataBadKey {
                key: native_key.to_string(),
            });
        }
        let conn = self.db.lock_conn()?;
        rows::read_row(&conn, dataset, &native, user)?.ok_or_else(|| {
            PbenchError::MetadataNotFound {
                dataset: dataset.to_string(),
                key: native,
            }
        })
    }

    /// Native row keys stored for a dataset.
    pub fn keys(&self, dataset: &Dataset) -> Result<Vec<String>> {
        let conn = self.db.lock_conn()?;
        rows::row_keys(&conn, dataset)
    }

    /// Read a key path, failing with `MetadataNotFound` if it is absent.
    pub fn get_value(&self, dataset: &Dataset, key: &str, user: Option<&str>) -> Result<Value> {
        self.get_value_opt(dataset, key, user)?
            .ok_or_else(|| PbenchError::MetadataNotFound {
                dataset: dataset.to_string(),
                key: key.to_lowercase(),
            })
    }

    /// Read a key path, returning `None` if it is absent.
    pub fn get_value_opt(
        &self,
        dataset: &Dataset,
        key: &str,
        user: Option<&str>,
    ) -> Result<Option<Value>> {
        if !keys::is_key_path(key, &keys::METADATA_KEYS) {
            return Err(PbenchError::MetadataBadKey {
                key: key.to_string(),
            });
        }
        let conn = self.db.lock_conn()?;
        rows::get_path(&conn, dataset, key, user)
    }

    /// Fetch a set of readable keys into one JSON object.
    ///
    /// Absent keys map to `null`.
    pub fn user_visible(
        &self,
        dataset: &Dataset,
        requested: &[&str],
        user: Option<&str>,
    ) -> Result<Value> {
        if let Some(bad) = requested
            .iter()
            .find(|k| !keys::is_key_path(k, &keys::METADATA_KEYS))
        {
            return Err(PbenchError::MetadataBadKey {
                key: bad.to_string(),
            });
        }
        let conn = self.db.lock_conn()?;
        let mut result = Map::new();
        for key in requested {
            let value = rows::get_path(&conn, dataset, key, user)?;
            result.insert(key.to_string(), value.unwrap_or(Value::Null));
        }
        Ok(Value::Object(result))
    }

    // ========================================
    // Writes
    // ========================================

    /// Validate and store a value at a key path.
    ///
    /// `dataset.name` renames the dataset row itself and updates the
    /// snapshot; every other key is stored below its native row key.
    pub fn set_value(
        &self,
        dataset: &mut Dataset,
        key: &str,
        value: Value,
        user: Option<&str>,
    ) -> Result<()> {
        if !keys::is_key_path(key, &keys::METADATA_KEYS) {
            return Err(PbenchError::MetadataBadKey {
                key: key.to_string(),
            });
        }
        let key = key.to_lowercase();
        if value.is_null() && keys::REQUIRES_VALUE.contains(&key.as_str()) {
            return Err(PbenchError::MetadataMissingKeyValue { key });
        }
        let value = self.validate(dataset, &key, value)?;

        let conn = self.db.lock_conn()?;
        if key == keys::DATASET_NAME {
            let name = value.as_str().unwrap_or_default().to_string();
            rename_in(&conn, dataset, &name)?;
            debug!("Renamed dataset {} to {}", dataset, name);
            dataset.name = name;
            return Ok(());
        }
        if keys::native_key(&key) == keys::DATASET {
            return Err(PbenchError::MetadataBadKey { key });
        }
        rows::set_path(&conn, dataset, &key, value, user)?;
        debug!("Set metadata {} on {}", key, dataset);
        Ok(())
    }

    /// Client entry point: only client-writable keys are accepted.
    pub fn set_user_value(
        &self,
        dataset: &mut Dataset,
        key: &str,
        value: Value,
        user: Option<&str>,
    ) -> Result<()> {
        if !keys::is_key_path(key, &keys::METADATA_KEYS) {
            return Err(PbenchError::MetadataBadKey {
                key: key.to_string(),
            });
        }
        if !keys::is_user_updateable(key) {
            return Err(PbenchError::MetadataProtectedKey {
                key: key.to_string(),
            });
        }
        self.set_value(dataset, key, value, user)
    }

    /// Store a whole native row, bypassing key path validation.
    ///
    /// Used for rows clients cannot address directly, such as `metalog`.
    pub fn set_native(
        &self,
        dataset: &Dataset,
        native_key: &str,
        value: &Value,
        user: Option<&str>,
    ) -> Result<()> {
        let native = native_key.to_lowercase();
        if !keys::NATIVE_KEYS.contains(&native.as_str()) {
            return Err(PbenchError::MetadataBadKey {
                key: native_key.to_string(),
            });
        }
        let conn = self.db.lock_conn()?;
        rows::write_row(&conn, dataset, &native, user, value)
    }

    /// Remove a key path.
    ///
    /// Removing an absent key is not an error: returns `Ok(false)`.
    pub fn remove(&self, dataset: &Dataset, key: &str, user: Option<&str>) -> Result<bool> {
        let native = keys::native_key(key);
        let valid = keys::is_key_path(key, &keys::NATIVE_KEYS);
        if !valid || native == keys::DATASET {
            return Err(PbenchError::MetadataBadKey {
                key: key.to_string(),
            });
        }
        let conn = self.db.lock_conn()?;
        let removed = rows::remove_path(&conn, dataset, &key.to_lowercase(), user)?;
        if removed {
            debug!("Removed metadata {} from {}", key, dataset);
        }
        Ok(removed)
    }

    // ========================================
    // Validation
    // ========================================

    fn validate(&self, dataset: &Dataset, key: &str, value: Value) -> Result<Value> {
        match key {
            keys::DATASET_NAME => {
                let length = value.as_str().map(|s| s.chars().count());
                match length {
                    Some(n) if (MetadataConfig::MIN_NAME_LEN..=MetadataConfig::MAX_NAME_LEN)
                        .contains(&n) =>
                    {
                        Ok(value)
                    }
                    _ => Err(PbenchError::MetadataBadValue {
                        dataset: dataset.to_string(),
                        key: key.to_string(),
                        value: value.to_string(),
                        expected: format!(
                            "UTF-8 string of {} to {} characters",
                            MetadataConfig::MIN_NAME_LEN,
                            MetadataConfig::MAX_NAME_LEN
                        ),
                    }),
                }
            }
            keys::DELETION => {
                let bad_date = |expected: String| PbenchError::MetadataBadValue {
                    dataset: dataset.to_string(),
                    key: key.to_string(),
                    value: value.to_string(),
                    expected,
                };
                let target = value
                    .as_str()
                    .and_then(parse_date_time)
                    .ok_or_else(|| bad_date("date/time".to_string()))?;
                let maximum = dataset.uploaded + Duration::days(i64::from(self.max_retention_days));
                if target > maximum {
                    return Err(bad_date(format!(
                        "date/time before {}",
                        maximum.format("%Y-%m-%d")
                    )));
                }
                Ok(Value::String(deletion_date(target)))
            }
            _ => Ok(value),
        }
    }
}

/// Parse an RFC 3339 date/time or a bare ISO date into UTC.
pub(crate) fn parse_date_time(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

/// Deletion is only scheduled by date, so the stored value is the day after
/// the target.
pub(crate) fn deletion_date(target: DateTime<Utc>) -> String {
    (target + Duration::days(1)).format("%Y-%m-%d").to_string()
}
