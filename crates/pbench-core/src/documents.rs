//! Document-store collaborators used by indexing and deletion.

use crate::bulk::{BulkAction, BulkItemResponse, BulkOp};
use crate::dataset::Dataset;
use crate::{PbenchError, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use walkdir::WalkDir;

/// One document produced from a dataset's unpacked contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Logical index family, e.g. `run-toc`.
    pub root: String,
    /// Concrete index name.
    pub index: String,
    pub id: String,
    pub source: Value,
}

impl IndexDocument {
    pub fn action(&self) -> BulkAction {
        BulkAction::index(&self.index, &self.id, self.source.clone())
    }
}

/// Performs bulk actions and answers per item, in order.
pub trait DocumentStore: Send + Sync {
    fn bulk(&self, actions: &[BulkAction]) -> Result<Vec<BulkItemResponse>>;
}

/// Turns an unpacked dataset into documents.
pub trait DocumentGenerator: Send + Sync {
    fn generate(&self, dataset: &Dataset, root: &Path) -> Result<Vec<IndexDocument>>;
}

// ========================================
// Table-of-contents generator
// ========================================

/// Emits one `run-toc` document per file, directory and symlink in the
/// unpacked tree.
#[derive(Debug, Clone)]
pub struct TocGenerator {
    index_prefix: String,
}

impl TocGenerator {
    pub const ROOT: &'static str = "run-toc";

    pub fn new(index_prefix: impl Into<String>) -> Self {
        Self {
            index_prefix: index_prefix.into(),
        }
    }

    /// Monthly index for the dataset's run time.
    pub fn index_name(&self, dataset: &Dataset) -> String {
        format!(
            "{}.v1.{}.{}",
            self.index_prefix,
            Self::ROOT,
            dataset.created.format("%Y-%m")
        )
    }
}

impl DocumentGenerator for TocGenerator {
    fn generate(&self, dataset: &Dataset, root: &Path) -> Result<Vec<IndexDocument>> {
        let index = self.index_name(dataset);
        let mut documents = Vec::new();
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| PbenchError::Io {
                message: e.to_string(),
                path: e.path().map(Path::to_path_buf),
                source: None,
            })?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let kind = if entry.file_type().is_dir() {
                "dir"
            } else if entry.file_type().is_symlink() {
                "sym"
            } else {
                "file"
            };
            let size = if kind == "file" {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            } else {
                0
            };

            let mut hasher = Md5::new();
            hasher.update(dataset.resource_id.as_bytes());
            hasher.update(b"/");
            hasher.update(relative.as_bytes());
            documents.push(IndexDocument {
                root: Self::ROOT.to_string(),
                index: index.clone(),
                id: hex::encode(hasher.finalize()),
                source: json!({
                    "@timestamp": dataset.created.to_rfc3339(),
                    "run_data_parent": dataset.resource_id,
                    "path": format!("/{relative}"),
                    "name": entry.file_name().to_string_lossy(),
                    "type": kind,
                    "size": size,
                }),
            });
        }
        Ok(documents)
    }
}

// ========================================
// In-memory document store
// ========================================

/// Document store held in memory, keyed by (index, id).
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<BTreeMap<(String, String), Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Value> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn bulk(&self, actions: &[BulkAction]) -> Result<Vec<BulkItemResponse>> {
        let mut documents = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let responses = actions
            .iter()
            .map(|action| {
                let key = (action.index.clone(), action.id.clone());
                match action.op {
                    BulkOp::Index => {
                        let source = action.source.clone().unwrap_or(Value::Null);
                        match documents.insert(key, source) {
                            Some(_) => BulkItemResponse::ok("updated"),
                            None => BulkItemResponse::ok("created"),
                        }
                    }
                    BulkOp::Update => match documents.get_mut(&key) {
                        Some(Value::Object(existing)) => {
                            if let Some(Value::Object(changes)) = &action.source {
                                existing.extend(changes.clone());
                            }
                            BulkItemResponse::ok("updated")
                        }
                        Some(other) => {
                            let mut merged = Map::new();
                            if let Some(Value::Object(changes)) = &action.source {
                                merged.extend(changes.clone());
                            }
                            *other = Value::Object(merged);
                            BulkItemResponse::ok("updated")
                        }
                        None => BulkItemResponse::failed(
                            404,
                            "document_missing_exception",
                            &format!("[{}]: document missing", action.id),
                        ),
                    },
                    BulkOp::Delete => match documents.remove(&key) {
                        Some(_) => BulkItemResponse::ok("deleted"),
                        None => BulkItemResponse {
                            status: 404,
                            result: Some("not_found".to_string()),
                            error_type: None,
                            reason: None,
                        },
                    },
                }
            })
            .collect();
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::{classify, tally};
    use crate::dataset::tests::{create_test_store, new_dataset};
    use tempfile::TempDir;

    #[test]
    fn test_toc_generator() {
        let store = create_test_store();
        let ds = store.create(new_dataset("fio", "abc123")).unwrap();
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("fio");
        std::fs::create_dir_all(root.join("1-default")).unwrap();
        std::fs::write(root.join("metadata.log"), "[pbench]\n").unwrap();
        std::fs::write(root.join("1-default").join("result.json"), "{}").unwrap();

        let generator = TocGenerator::new("pbench");
        let documents = generator.generate(&ds, &root).unwrap();
        assert_eq!(documents.len(), 4);
        assert!(documents.iter().all(|d| d.root == TocGenerator::ROOT));
        assert!(documents
            .iter()
            .all(|d| d.index == generator.index_name(&ds)));
        let result = documents
            .iter()
            .find(|d| d.source["path"] == "/1-default/result.json")
            .unwrap();
        assert_eq!(result.source["size"], 2);
        assert_eq!(result.source["type"], "file");

        // Ids are stable across runs
        let again = generator.generate(&ds, &root).unwrap();
        assert_eq!(documents, again);
    }

    #[test]
    fn test_memory_store_delete_is_idempotent() {
        let store = MemoryDocumentStore::new();
        let index = BulkAction::index("idx", "d1", json!({"a": 1}));
        let delete = BulkAction::delete("idx", "d1");
        store.bulk(std::slice::from_ref(&index)).unwrap();
        assert_eq!(store.len(), 1);

        let actions = vec![delete.clone(), delete.clone()];
        let responses = store.bulk(&actions).unwrap();
        let outcomes: Vec<_> = actions
            .iter()
            .zip(&responses)
            .map(|(a, r)| classify(a, r))
            .collect();
        let result = tally(&outcomes);
        assert_eq!(result.ok, 1);
        assert_eq!(result.not_found, 1);
        assert_eq!(result.succeeded(true), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_update() {
        let store = MemoryDocumentStore::new();
        store
            .bulk(&[BulkAction::index("idx", "d1", json!({"access": "private"}))])
            .unwrap();
        let responses = store
            .bulk(&[
                BulkAction::update("idx", "d1", json!({"access": "public"})),
                BulkAction::update("idx", "d2", json!({"access": "public"})),
            ])
            .unwrap();
        assert_eq!(responses[0].status, 200);
        assert_eq!(responses[1].status, 404);
        assert_eq!(store.get("idx", "d1").unwrap()["access"], "public");
    }
}
