//! Process-local stores.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tokio::sync::watch;

use super::{bump, sort_newest_first, AliasStore, ObservationStore, StoreResult};
use crate::types::{Alias, ScanObservation};

/// In-memory observation log.
#[derive(Debug)]
pub struct MemoryObservationStore {
    rows: RwLock<Vec<ScanObservation>>,
    revision: watch::Sender<u64>,
}

impl MemoryObservationStore {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            revision: watch::channel(0).0,
        }
    }

    /// Create a log pre-populated with `rows` (in append order).
    #[must_use]
    pub fn with_rows(rows: Vec<ScanObservation>) -> Self {
        Self {
            rows: RwLock::new(rows),
            revision: watch::channel(0).0,
        }
    }

    /// Number of stored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl Default for MemoryObservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservationStore for MemoryObservationStore {
    fn append(&self, observation: ScanObservation) -> StoreResult<()> {
        self.rows.write().push(observation);
        bump(&self.revision);
        Ok(())
    }

    fn query_all(&self) -> StoreResult<Vec<ScanObservation>> {
        let mut rows = self.rows.read().clone();
        sort_newest_first(&mut rows);
        Ok(rows)
    }

    fn clear_all(&self) -> StoreResult<()> {
        self.rows.write().clear();
        bump(&self.revision);
        Ok(())
    }

    fn revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

/// In-memory alias table.
#[derive(Debug)]
pub struct MemoryAliasStore {
    aliases: RwLock<BTreeMap<String, String>>,
    revision: watch::Sender<u64>,
}

impl MemoryAliasStore {
    /// Create an empty alias table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            aliases: RwLock::new(BTreeMap::new()),
            revision: watch::channel(0).0,
        }
    }
}

impl Default for MemoryAliasStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AliasStore for MemoryAliasStore {
    fn upsert(&self, identifier: &str, label: &str) -> StoreResult<()> {
        self.aliases
            .write()
            .insert(identifier.to_string(), label.to_string());
        bump(&self.revision);
        Ok(())
    }

    fn query_all(&self) -> StoreResult<Vec<Alias>> {
        Ok(self
            .aliases
            .read()
            .iter()
            .map(|(identifier, label)| Alias {
                identifier: identifier.clone(),
                label: label.clone(),
            })
            .collect())
    }

    fn lookup(&self, identifier: &str) -> StoreResult<Option<String>> {
        Ok(self.aliases.read().get(identifier).cloned())
    }

    fn delete(&self, identifier: &str) -> StoreResult<bool> {
        let removed = self.aliases.write().remove(identifier).is_some();
        if removed {
            bump(&self.revision);
        }
        Ok(removed)
    }

    fn clear_all(&self) -> StoreResult<()> {
        self.aliases.write().clear();
        bump(&self.revision);
        Ok(())
    }

    fn revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
