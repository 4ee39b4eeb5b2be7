//! Dataset lifecycle states and the legal transition table.

use crate::PbenchError;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a dataset.
///
/// States ending in `-ING` are "mutating": a worker currently owns the
/// dataset and is changing its on-disk or indexed representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Uploading,
    Uploaded,
    Unpacking,
    Unpacked,
    Indexing,
    Indexed,
    Expiring,
    Expired,
    Quarantined,
}

impl State {
    pub const ALL: [State; 9] = [
        State::Uploading,
        State::Uploaded,
        State::Unpacking,
        State::Unpacked,
        State::Indexing,
        State::Indexed,
        State::Expiring,
        State::Expired,
        State::Quarantined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Uploading => "UPLOADING",
            State::Uploaded => "UPLOADED",
            State::Unpacking => "UNPACKING",
            State::Unpacked => "UNPACKED",
            State::Indexing => "INDEXING",
            State::Indexed => "INDEXED",
            State::Expiring => "EXPIRING",
            State::Expired => "EXPIRED",
            State::Quarantined => "QUARANTINED",
        }
    }

    /// Human-readable label.
    pub fn friendly(&self) -> &'static str {
        match self {
            State::Uploading => "Uploading",
            State::Uploaded => "Uploaded",
            State::Unpacking => "Unpacking",
            State::Unpacked => "Unpacked",
            State::Indexing => "Indexing",
            State::Indexed => "Indexed",
            State::Expiring => "Expiring",
            State::Expired => "Expired",
            State::Quarantined => "Quarantined",
        }
    }

    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            State::Uploading | State::Unpacking | State::Indexing | State::Expiring
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// States reachable in a single `advance` from this state.
    pub fn allowed_transitions(&self) -> &'static [State] {
        match self {
            State::Uploading => &[State::Uploaded, State::Quarantined],
            State::Uploaded => &[State::Unpacking, State::Quarantined],
            State::Unpacking => &[State::Unpacked, State::Quarantined],
            State::Unpacked => &[State::Indexing, State::Quarantined],
            State::Indexing => &[State::Indexed, State::Quarantined],
            State::Indexed => &[State::Indexing, State::Expiring, State::Quarantined],
            State::Expiring => &[State::Expired, State::Indexed, State::Quarantined],
            State::Expired | State::Quarantined => &[],
        }
    }

    pub fn can_advance_to(&self, next: State) -> bool {
        self.allowed_transitions().contains(&next)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = PbenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        State::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| PbenchError::DatasetBadParameterType {
                value: s.to_string(),
                expected: "dataset state".to_string(),
            })
    }
}

impl ToSql for State {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for State {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: PbenchError| FromSqlError::Other(Box::new(e)))
    }
}

/// Dataset visibility policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Private,
    Public,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Private => "private",
            Access::Public => "public",
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Access {
    type Err = PbenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Ok(Access::Private),
            "public" => Ok(Access::Public),
            _ => Err(PbenchError::DatasetBadParameterType {
                value: s.to_string(),
                expected: "access keyword".to_string(),
            }),
        }
    }
}

impl ToSql for Access {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Access {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: PbenchError| FromSqlError::Other(Box::new(e)))
    }
}
