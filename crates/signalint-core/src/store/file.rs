//! Persistent storage on the local filesystem.
//!
//! Each radio kind gets its own files under the data directory:
//!
//! ```text
//! <data_dir>/
//! ├── ble/observations.jsonl
//! ├── ble/aliases.json
//! ├── wifi/observations.jsonl
//! └── wifi/aliases.json
//! ```
//!
//! Observation logs are JSON lines and only ever appended to. Alias maps are
//! small and rewritten whole (temp file + rename) on every change.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::debug;

use super::{bump, sort_newest_first, AliasStore, ObservationStore, StoreError, StoreResult};
use crate::types::{Alias, RadioKind, ScanObservation};

/// Get the default data directory.
///
/// On Linux: `/var/lib/signalint/`
/// Elsewhere: the platform data directory (e.g. `~/Library/Application Support/signalint`).
#[must_use]
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/signalint")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "signalint")
            .map_or_else(|| PathBuf::from("./data"), |dirs| dirs.data_dir().to_path_buf())
    }
}

/// File layout for persisted stores.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    data_dir: PathBuf,
}

impl StorageLayout {
    /// Create a layout rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Root data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the observation log for `kind`.
    #[must_use]
    pub fn observation_log_path(&self, kind: RadioKind) -> PathBuf {
        self.data_dir.join(kind.as_str()).join("observations.jsonl")
    }

    /// Path of the alias map for `kind`.
    #[must_use]
    pub fn alias_path(&self, kind: RadioKind) -> PathBuf {
        self.data_dir.join(kind.as_str()).join("aliases.json")
    }

    /// Open the observation log for `kind`.
    pub fn open_observation_log(&self, kind: RadioKind) -> StoreResult<JsonLinesObservationStore> {
        JsonLinesObservationStore::open(self.observation_log_path(kind))
    }

    /// Open the alias map for `kind`.
    pub fn open_aliases(&self, kind: RadioKind) -> StoreResult<JsonAliasStore> {
        JsonAliasStore::open(self.alias_path(kind))
    }
}

fn ensure_parent(path: &Path) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::CreateDirError {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Observation log stored as one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesObservationStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    revision: watch::Sender<u64>,
}

impl JsonLinesObservationStore {
    /// Open (or lazily create) the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        ensure_parent(&path)?;
        debug!(path = %path.display(), "Opened observation log");
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            revision: watch::channel(0).0,
        })
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_rows(&self) -> StoreResult<Vec<ScanObservation>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::ReadError {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str(line).map_err(|source| StoreError::ParseError {
                    path: self.path.clone(),
                    line: index + 1,
                    source,
                })
            })
            .collect()
    }
}

impl ObservationStore for JsonLinesObservationStore {
    fn append(&self, observation: ScanObservation) -> StoreResult<()> {
        let mut line = serde_json::to_string(&observation)?;
        line.push('\n');

        let guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| StoreError::WriteError {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| StoreError::WriteError {
                path: self.path.clone(),
                source,
            })?;
        drop(guard);

        bump(&self.revision);
        Ok(())
    }

    fn query_all(&self) -> StoreResult<Vec<ScanObservation>> {
        let guard = self.write_lock.lock();
        let mut rows = self.read_rows()?;
        drop(guard);
        sort_newest_first(&mut rows);
        Ok(rows)
    }

    fn clear_all(&self) -> StoreResult<()> {
        let guard = self.write_lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::WriteError {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        drop(guard);

        bump(&self.revision);
        Ok(())
    }

    fn revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

/// Alias map persisted as a pretty-printed JSON object.
#[derive(Debug)]
pub struct JsonAliasStore {
    path: PathBuf,
    aliases: RwLock<BTreeMap<String, String>>,
    revision: watch::Sender<u64>,
}

impl JsonAliasStore {
    /// Open the alias map at `path`, loading existing entries.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        ensure_parent(&path)?;

        let aliases = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| StoreError::ParseError {
                    path: path.clone(),
                    line: 0,
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::ReadError { path, source }),
        };

        debug!(path = %path.display(), count = aliases.len(), "Loaded aliases");
        Ok(Self {
            path,
            aliases: RwLock::new(aliases),
            revision: watch::channel(0).0,
        })
    }

    /// Location of the alias file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the map, persist it, then publish it.
    fn mutate<F>(&self, change: F) -> StoreResult<bool>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool,
    {
        let mut aliases = self.aliases.write();
        let mut next = aliases.clone();
        if !change(&mut next) {
            return Ok(false);
        }

        let content = serde_json::to_string_pretty(&next)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|source| StoreError::WriteError {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| StoreError::WriteError {
            path: self.path.clone(),
            source,
        })?;

        *aliases = next;
        drop(aliases);
        bump(&self.revision);
        Ok(true)
    }
}

impl AliasStore for JsonAliasStore {
    fn upsert(&self, identifier: &str, label: &str) -> StoreResult<()> {
        self.mutate(|map| {
            map.insert(identifier.to_string(), label.to_string());
            true
        })
        .map(|_| ())
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
        self.mutate(|map| map.remove(identifier).is_some())
    }

    fn clear_all(&self) -> StoreResult<()> {
        self.mutate(|map| {
            map.clear();
            true
        })
        .map(|_| ())
    }

    fn revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use tempfile::TempDir;

    use super::*;

    fn at(millis: i64) -> chrono::DateTime<chrono::Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    #[test]
    fn test_layout_paths_are_per_kind() {
        let layout = StorageLayout::new("/data");
        assert_eq!(
            layout.observation_log_path(RadioKind::Ble),
            PathBuf::from("/data/ble/observations.jsonl")
        );
        assert_eq!(
            layout.alias_path(RadioKind::Wifi),
            PathBuf::from("/data/wifi/aliases.json")
        );
    }

    #[test]
    fn test_log_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());

        {
            let log = layout.open_observation_log(RadioKind::Wifi).unwrap();
            log.append(ScanObservation::wifi("B1", "Home", -40, 2412, at(1_000)))
                .unwrap();
            log.append(ScanObservation::wifi("B2", "", -80, 5745, at(2_000)))
                .unwrap();
        }

        let log = layout.open_observation_log(RadioKind::Wifi).unwrap();
        let rows = log.query_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].identifier, "B2");
        assert_eq!(rows[1].frequency_mhz(), Some(2412));
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = JsonLinesObservationStore::open(dir.path().join("none.jsonl")).unwrap();
        assert!(log.query_all().unwrap().is_empty());
    }

    #[test]
    fn test_clear_removes_rows_and_bumps_revision() {
        let dir = TempDir::new().unwrap();
        let log = JsonLinesObservationStore::open(dir.path().join("log.jsonl")).unwrap();
        let rev = log.revision();

        log.append(ScanObservation::ble("A", "Tag", -60, at(1))).unwrap();
        log.clear_all().unwrap();
        // Clearing an already empty log is fine.
        log.clear_all().unwrap();

        assert!(log.query_all().unwrap().is_empty());
        assert_eq!(*rev.borrow(), 3);
    }

    #[test]
    fn test_corrupt_line_reports_position() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        let log = JsonLinesObservationStore::open(&path).unwrap();
        log.append(ScanObservation::ble("A", "Tag", -60, at(1))).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{not json}\n")
            .unwrap();

        let err = log.query_all().unwrap_err();
        assert!(matches!(err, StoreError::ParseError { line: 2, .. }));
    }

    #[test]
    fn test_aliases_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ble").join("aliases.json");

        {
            let aliases = JsonAliasStore::open(&path).unwrap();
            aliases.upsert("AA:BB", "Printer").unwrap();
            aliases.upsert("CC:DD", "Speaker").unwrap();
            assert!(aliases.delete("CC:DD").unwrap());
        }

        let aliases = JsonAliasStore::open(&path).unwrap();
        assert_eq!(aliases.lookup("AA:BB").unwrap().as_deref(), Some("Printer"));
        assert_eq!(aliases.lookup("CC:DD").unwrap(), None);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_alias_clear_empties_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aliases.json");
        let aliases = JsonAliasStore::open(&path).unwrap();
        aliases.upsert("AA", "x").unwrap();
        aliases.clear_all().unwrap();

        let reopened = JsonAliasStore::open(&path).unwrap();
        assert!(reopened.query_all().unwrap().is_empty());
    }
}
