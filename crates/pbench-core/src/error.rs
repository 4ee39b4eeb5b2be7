//! Error types for the Pbench Server core.
//!
//! Every component reports failures through [`PbenchError`]. Variants are
//! grouped by the component that raises them; [`PbenchError::kind`] folds them
//! onto the coarse taxonomy callers use to decide between rejecting, falling
//! back to a default, or retrying later.

use crate::dataset::State;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the Pbench Server core.
#[derive(Debug, Error)]
pub enum PbenchError {
    // Infrastructure errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // Dataset errors
    #[error("File name {name:?} does not end in \".tar.xz\"")]
    DatasetBadName { name: String },

    #[error("Duplicate dataset {resource_id:?}")]
    DatasetDuplicate { resource_id: String },

    #[error("No dataset {lookup}")]
    DatasetNotFound { lookup: String },

    #[error("Value {value:?} is not a valid {expected}")]
    DatasetBadParameterType { value: String, expected: String },

    #[error("Dataset {dataset} state {state} is terminal and cannot be advanced to {requested}")]
    TerminalStateViolation {
        dataset: String,
        state: State,
        requested: State,
    },

    #[error("Dataset {dataset} desired state {requested} is not allowed from current state {state}")]
    BadStateTransition {
        dataset: String,
        state: State,
        requested: State,
    },

    #[error("Dataset {dataset} is busy in state {state}")]
    DatasetBusy { dataset: String, state: State },

    // Metadata errors
    #[error("Metadata key {key:?} is not supported")]
    MetadataBadKey { key: String },

    #[error("Metadata key {key:?} cannot be modified by client")]
    MetadataProtectedKey { key: String },

    #[error("Metadata key {key:?} value is required")]
    MetadataMissingKeyValue { key: String },

    #[error("Metadata key {key:?} value {value} for dataset {dataset} must be a {expected}")]
    MetadataBadValue {
        dataset: String,
        key: String,
        value: String,
        expected: String,
    },

    #[error("Key {element:?} value for {dataset} in {key:?} is not a JSON object")]
    MetadataBadStructure {
        dataset: String,
        key: String,
        element: String,
    },

    #[error("No metadata {key:?} for {dataset}")]
    MetadataNotFound { dataset: String, key: String },

    // Index map errors
    #[error("Index SQL error on {operation} {dataset}: {message}")]
    IndexMapSql {
        operation: String,
        dataset: String,
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Duplicate index map for {dataset}: {message}")]
    IndexMapDuplicate { dataset: String, message: String },

    #[error("Missing required index map parameter for {dataset}: {message}")]
    IndexMapMissingParameter { dataset: String, message: String },

    // Cache manager errors
    #[error("The file path {path:?} is not a tarball")]
    BadFilename { path: PathBuf },

    #[error("A dataset tarball named {name:?} is already present")]
    DuplicateTarball { name: String },

    #[error("The dataset tarball named {resource_id:?} is not found")]
    TarballNotFound { resource_id: String },

    #[error("An error occurred while unpacking {tarball:?}: {message}")]
    TarballUnpackError {
        tarball: PathBuf,
        message: String,
        stderr: Option<String>,
    },

    #[error("An error occurred while changing file permissions of {directory:?}: {message}")]
    TarballModeChangeError {
        directory: PathBuf,
        message: String,
        stderr: Option<String>,
    },

    #[error("Cache for {resource_id} is locked")]
    CacheLocked { resource_id: String },

    #[error("Unable to extract {path:?} from {tarball:?}")]
    CacheExtractBadPath { tarball: PathBuf, path: String },

    #[error("Path {path:?} is outside of dataset {dataset}")]
    CacheExtractError { dataset: String, path: String },

    // Intake errors
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Dataset {resource_id} is currently being uploaded")]
    UploadInProgress { resource_id: String },

    // Collaborator errors
    #[error("Document store error: {message}")]
    DocumentStore { message: String },

    #[error("Backup error for {key}: {message}")]
    Backup { key: String, message: String },

    #[error("Operation stopped by request")]
    Stopped,
}

/// Coarse error classification shared by interactive and batch callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request was malformed; retrying the same request never helps.
    Validation,
    /// The caller's reference was stale.
    NotFound,
    /// The request collides with existing or in-flight state.
    Conflict,
    /// Infrastructure failure; a later pass may succeed.
    Transient,
}

/// Result type alias for Pbench operations.
pub type Result<T> = std::result::Result<T, PbenchError>;

impl From<std::io::Error> for PbenchError {
    fn from(err: std::io::Error) -> Self {
        PbenchError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PbenchError {
    fn from(err: serde_json::Error) -> Self {
        PbenchError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for PbenchError {
    fn from(err: rusqlite::Error) -> Self {
        PbenchError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<tokio::task::JoinError> for PbenchError {
    fn from(err: tokio::task::JoinError) -> Self {
        PbenchError::Io {
            message: format!("Blocking task failed: {}", err),
            path: None,
            source: None,
        }
    }
}

impl PbenchError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        PbenchError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PbenchError::DatasetBadName { .. }
            | PbenchError::DatasetBadParameterType { .. }
            | PbenchError::MetadataBadKey { .. }
            | PbenchError::MetadataProtectedKey { .. }
            | PbenchError::MetadataMissingKeyValue { .. }
            | PbenchError::MetadataBadValue { .. }
            | PbenchError::MetadataBadStructure { .. }
            | PbenchError::IndexMapMissingParameter { .. }
            | PbenchError::BadFilename { .. }
            | PbenchError::HashMismatch { .. }
            | PbenchError::Unauthorized { .. }
            | PbenchError::CacheExtractError { .. }
            | PbenchError::Config { .. } => ErrorKind::Validation,

            PbenchError::DatasetNotFound { .. }
            | PbenchError::MetadataNotFound { .. }
            | PbenchError::TarballNotFound { .. }
            | PbenchError::CacheExtractBadPath { .. } => ErrorKind::NotFound,

            PbenchError::DatasetDuplicate { .. }
            | PbenchError::DuplicateTarball { .. }
            | PbenchError::IndexMapDuplicate { .. }
            | PbenchError::TerminalStateViolation { .. }
            | PbenchError::BadStateTransition { .. }
            | PbenchError::DatasetBusy { .. }
            | PbenchError::CacheLocked { .. }
            | PbenchError::UploadInProgress { .. } => ErrorKind::Conflict,

            PbenchError::Database { .. }
            | PbenchError::Io { .. }
            | PbenchError::Json { .. }
            | PbenchError::IndexMapSql { .. }
            | PbenchError::TarballUnpackError { .. }
            | PbenchError::TarballModeChangeError { .. }
            | PbenchError::DocumentStore { .. }
            | PbenchError::Backup { .. }
            | PbenchError::Stopped => ErrorKind::Transient,
        }
    }

    /// Check if retrying the failed operation later could succeed.
    ///
    /// Lock contention is retryable; duplicates and bad transitions never are.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Transient => true,
            ErrorKind::Conflict => matches!(
                self,
                PbenchError::CacheLocked { .. }
                    | PbenchError::UploadInProgress { .. }
                    | PbenchError::DatasetBusy { .. }
            ),
            ErrorKind::Validation | ErrorKind::NotFound => false,
        }
    }

    /// Captured stderr of a failed subprocess, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            PbenchError::TarballUnpackError { stderr, .. }
            | PbenchError::TarballModeChangeError { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}
