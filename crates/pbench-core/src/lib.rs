//! Pbench Core - dataset lifecycle and archive management for the Pbench
//! Server.
//!
//! A dataset is an uploaded benchmark-result tarball. This crate tracks each
//! dataset through its lifecycle states, keeps its JSON metadata and the
//! map of documents indexed from it, and manages the archived tarball and
//! its unpacked cache on disk. Batch drivers move datasets through the
//! pipeline; the document store, backup target and identity provider are
//! traits supplied by the host.
//!
//! # Example
//!
//! ```rust,ignore
//! use pbench_core::{CacheManager, Database, DriverContext, ServerConfig, StopToken};
//! use pbench_core::drivers::{SizeBucket, UnpackDriver};
//! use std::sync::Arc;
//!
//! fn main() -> pbench_core::Result<()> {
//!     let config = ServerConfig::load("/etc/pbench-server.json")?;
//!     let db = Database::open(&config.database)?;
//!     let cache = Arc::new(CacheManager::new(&config));
//!     let ctx = DriverContext::new(&config, db, cache, StopToken::new());
//!
//!     let results = UnpackDriver::new(ctx).run(SizeBucket::ALL)?;
//!     println!("{}", results);
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod bulk;
pub mod cache;
pub mod config;
pub mod dataset;
pub mod db;
pub mod documents;
pub mod drivers;
pub mod error;
pub mod hashing;
pub mod identity;
pub mod index_map;
pub mod intake;
pub mod metadata;
pub mod stop;
pub mod sync;

// Re-export commonly used types
pub use backup::{BackupSink, FileBackupSink};
pub use bulk::{BulkAction, BulkItemResponse, BulkOutcome, BulkTally};
pub use cache::{CacheManager, CacheReader, Tarball};
pub use config::ServerConfig;
pub use dataset::{Access, Dataset, DatasetStore, NewDataset, State};
pub use db::Database;
pub use documents::{DocumentGenerator, DocumentStore, IndexDocument};
pub use drivers::{BatchResults, DriverContext};
pub use error::{ErrorKind, PbenchError, Result};
pub use identity::{IdentityProvider, StaticTokenIdentity};
pub use index_map::{IndexMapStore, IndexMapType};
pub use intake::{Intake, UploadRequest};
pub use metadata::MetadataStore;
pub use stop::StopToken;
pub use sync::{Operation, SyncTracker};
