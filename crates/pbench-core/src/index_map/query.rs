//! Stateless helpers for handlers that query by index map.

use super::{IndexMapStore, IndexMapType};
use crate::dataset::Dataset;
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};

/// Concrete index names a query against `root` should search for a dataset.
///
/// Without a root, every index holding the dataset's documents is returned.
pub fn indices_for_dataset(
    store: &IndexMapStore,
    dataset: &Dataset,
    root: Option<&str>,
) -> Result<Vec<String>> {
    store.indices(dataset, root)
}

/// Document ids held in one concrete index, whatever root it belongs to.
pub fn mappings_for_index<'a>(map: &'a IndexMapType, index: &str) -> Option<&'a [String]> {
    map.values()
        .find_map(|indices| indices.get(index))
        .map(Vec::as_slice)
}

/// Total document ids across the map, duplicates included.
pub fn document_count(map: &IndexMapType) -> usize {
    map.values()
        .flat_map(|indices| indices.values())
        .map(Vec::len)
        .sum()
}

/// Document ids per concrete index with repeats removed, first occurrence kept.
pub fn unique_documents_by_index(map: &IndexMapType) -> BTreeMap<String, Vec<String>> {
    let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for indices in map.values() {
        for (index, documents) in indices {
            let entry = result.entry(index.clone()).or_default();
            let mut seen: BTreeSet<String> = entry.iter().cloned().collect();
            for id in documents {
                if seen.insert(id.clone()) {
                    entry.push(id.clone());
                }
            }
        }
    }
    result
}
