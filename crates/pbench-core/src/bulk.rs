//! Document-store bulk requests and per-item result classification.
//!
//! Each bulk response item is classified into a [`BulkOutcome`], and a batch
//! is summarized by folding those outcomes into a [`BulkTally`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Bulk operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkOp {
    Index,
    Update,
    Delete,
}

/// One action in a bulk request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkAction {
    pub op: BulkOp,
    pub index: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
}

impl BulkAction {
    pub fn index(index: impl Into<String>, id: impl Into<String>, source: Value) -> Self {
        Self {
            op: BulkOp::Index,
            index: index.into(),
            id: id.into(),
            source: Some(source),
        }
    }

    /// Partial document update, e.g. to propagate an access change.
    pub fn update(index: impl Into<String>, id: impl Into<String>, doc: Value) -> Self {
        Self {
            op: BulkOp::Update,
            index: index.into(),
            id: id.into(),
            source: Some(doc),
        }
    }

    pub fn delete(index: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            op: BulkOp::Delete,
            index: index.into(),
            id: id.into(),
            source: None,
        }
    }
}

/// The document store's answer for one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemResponse {
    pub status: u16,
    /// e.g. `created`, `updated`, `deleted`, `not_found`
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl BulkItemResponse {
    pub fn ok(result: &str) -> Self {
        Self {
            status: 200,
            result: Some(result.to_string()),
            error_type: None,
            reason: None,
        }
    }

    pub fn failed(status: u16, error_type: &str, reason: &str) -> Self {
        Self {
            status,
            result: None,
            error_type: Some(error_type.to_string()),
            reason: Some(reason.to_string()),
        }
    }
}

/// Classification of one response item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOutcome {
    Ok,
    /// The target document did not exist.
    NotFound,
    Failed { error_type: String },
}

/// Classify one response item against the action that produced it.
///
/// A delete answered with 404 or `not_found` is [`BulkOutcome::NotFound`];
/// callers decide whether that counts as success.
pub fn classify(action: &BulkAction, response: &BulkItemResponse) -> BulkOutcome {
    let not_found =
        response.status == 404 || response.result.as_deref() == Some("not_found");
    if action.op == BulkOp::Delete && not_found {
        return BulkOutcome::NotFound;
    }
    if (200..300).contains(&response.status) && response.error_type.is_none() {
        return BulkOutcome::Ok;
    }
    BulkOutcome::Failed {
        error_type: response
            .error_type
            .clone()
            .unwrap_or_else(|| format!("http_{}", response.status)),
    }
}

/// Counts of outcomes for a batch or a whole pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkTally {
    pub ok: usize,
    pub not_found: usize,
    /// Failures by error type.
    pub failed: BTreeMap<String, usize>,
}

impl BulkTally {
    pub fn add(mut self, outcome: &BulkOutcome) -> Self {
        match outcome {
            BulkOutcome::Ok => self.ok += 1,
            BulkOutcome::NotFound => self.not_found += 1,
            BulkOutcome::Failed { error_type } => {
                *self.failed.entry(error_type.clone()).or_default() += 1
            }
        }
        self
    }

    /// Combine two tallies.
    pub fn merge(mut self, other: &BulkTally) -> Self {
        self.ok += other.ok;
        self.not_found += other.not_found;
        for (error_type, count) in &other.failed {
            *self.failed.entry(error_type.clone()).or_default() += count;
        }
        self
    }

    pub fn total(&self) -> usize {
        self.ok + self.not_found + self.failures()
    }

    pub fn failures(&self) -> usize {
        self.failed.values().sum()
    }

    /// Successful items. A missing document is a success only when deleting.
    pub fn succeeded(&self, for_delete: bool) -> usize {
        if for_delete {
            self.ok + self.not_found
        } else {
            self.ok
        }
    }

    /// Summary suitable for a status message.
    pub fn as_json(&self) -> Value {
        json!({
            "ok": self.ok,
            "not_found": self.not_found,
            "failure": self.failed,
        })
    }
}

impl fmt::Display for BulkTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_json())
    }
}

/// Fold outcomes into a tally.
pub fn tally<'a>(outcomes: impl IntoIterator<Item = &'a BulkOutcome>) -> BulkTally {
    outcomes
        .into_iter()
        .fold(BulkTally::default(), |acc, outcome| acc.add(outcome))
}
