//! Observation log and alias table storage.
//!
//! The engine only talks to the [`ObservationStore`] and [`AliasStore`]
//! traits. Each store exposes a monotonically increasing revision through a
//! [`tokio::sync::watch`] channel so that readers such as the roster
//! aggregator can react to writes without polling.
//!
//! Two implementations are provided:
//!
//! - [`memory`] - process-local stores, used by tests and simulation mode
//! - [`file`] - JSON-lines observation logs and JSON alias maps on disk

use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::watch;

use crate::types::{Alias, ScanObservation};

pub mod file;
pub mod memory;

pub use file::{default_data_dir, JsonAliasStore, JsonLinesObservationStore, StorageLayout};
pub use memory::{MemoryAliasStore, MemoryObservationStore};

/// Errors raised by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The backing file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A stored record could not be decoded.
    #[error("Failed to parse {} (line {line}): {source}", path.display())]
    ParseError {
        /// File that failed.
        path: PathBuf,
        /// 1-based line number (0 for whole-file documents).
        line: usize,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be encoded.
    #[error("Failed to serialize record: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// The data directory could not be created.
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDirError {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Append-only log of scan observations for one radio kind.
pub trait ObservationStore: Send + Sync {
    /// Append one observation. Existing rows are never modified.
    fn append(&self, observation: ScanObservation) -> StoreResult<()>;

    /// Every stored observation, newest first.
    ///
    /// Rows sharing a timestamp keep their append order.
    fn query_all(&self) -> StoreResult<Vec<ScanObservation>>;

    /// Remove every observation.
    fn clear_all(&self) -> StoreResult<()>;

    /// Revision counter, bumped after every successful write.
    fn revision(&self) -> watch::Receiver<u64>;
}

/// Operator aliases keyed by identifier (at most one per identifier).
pub trait AliasStore: Send + Sync {
    /// Insert or replace the alias for `identifier`.
    fn upsert(&self, identifier: &str, label: &str) -> StoreResult<()>;

    /// Every alias, ordered by identifier.
    fn query_all(&self) -> StoreResult<Vec<Alias>>;

    /// The alias label for `identifier`, if any.
    fn lookup(&self, identifier: &str) -> StoreResult<Option<String>>;

    /// Remove the alias for `identifier`. Returns whether one existed.
    fn delete(&self, identifier: &str) -> StoreResult<bool>;

    /// Remove every alias.
    fn clear_all(&self) -> StoreResult<()>;

    /// Revision counter, bumped after every successful write.
    fn revision(&self) -> watch::Receiver<u64>;
}

/// Sort observations newest first, keeping append order among equal timestamps.
pub(crate) fn sort_newest_first(rows: &mut [ScanObservation]) {
    rows.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
}

/// Bump a revision counter.
pub(crate) fn bump(revision: &watch::Sender<u64>) {
    revision.send_modify(|rev| *rev = rev.wrapping_add(1));
}
