//! Per-radio wiring.
//!
//! A [`Radio`] bundles everything that exists once per [`RadioKind`]: the
//! observation log, the alias table, the scan controller feeding the log,
//! the roster aggregator reading it and the export coordinator. BLE and WiFi
//! each get their own instance, so their data never mixes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::distance::PathLossModel;
use crate::error::{Result, SignalError};
use crate::export::{ExportCoordinator, ExportOptions, ExportSink, ExportStatus};
use crate::ingest::{ScanController, ScanStatus, ScanSummary};
use crate::roster::{
    derive_roster, read_snapshot, RosterAggregator, RosterEntry, RosterHealth, RosterOptions,
};
use crate::scan::{ScanSource, DEFAULT_SCAN_BUFFER};
use crate::store::{AliasStore, ObservationStore};
use crate::types::{Alias, RadioKind, ScanObservation};

/// Collaborators for one radio.
pub struct RadioParts {
    /// Platform scanner.
    pub source: Arc<dyn ScanSource>,
    /// Observation log.
    pub log: Arc<dyn ObservationStore>,
    /// Alias table.
    pub aliases: Arc<dyn AliasStore>,
    /// Export destination.
    pub sink: Arc<dyn ExportSink>,
}

/// Tuning for one radio.
#[derive(Debug, Clone, Copy)]
pub struct RadioOptions {
    /// Roster debounce and distance model.
    pub roster: RosterOptions,
    /// Export formatting and status reset.
    pub export: ExportOptions,
    /// Capacity between the platform pump and ingestion.
    pub scan_buffer: usize,
}

impl Default for RadioOptions {
    fn default() -> Self {
        Self {
            roster: RosterOptions::default(),
            export: ExportOptions::default(),
            scan_buffer: DEFAULT_SCAN_BUFFER,
        }
    }
}

/// Everything signalint maintains for one radio kind.
pub struct Radio {
    kind: RadioKind,
    log: Arc<dyn ObservationStore>,
    aliases: Arc<dyn AliasStore>,
    model: PathLossModel,
    scanner: ScanController,
    roster: RosterAggregator,
    export: ExportCoordinator,
}

impl Radio {
    /// Wire up a radio. Must be called within a Tokio runtime.
    pub fn new(parts: RadioParts, options: RadioOptions) -> Self {
        let kind = parts.source.kind();
        let scanner = ScanController::new(parts.source, Arc::clone(&parts.log))
            .with_buffer(options.scan_buffer);
        let roster = RosterAggregator::spawn(
            kind,
            Arc::clone(&parts.log),
            Arc::clone(&parts.aliases),
            options.roster,
        );
        let export =
            ExportCoordinator::new(kind, Arc::clone(&parts.log), parts.sink, options.export);
        info!(%kind, "Radio ready");

        Self {
            kind,
            log: parts.log,
            aliases: parts.aliases,
            model: options.roster.model,
            scanner,
            roster,
            export,
        }
    }

    /// Radio kind.
    #[must_use]
    pub const fn kind(&self) -> RadioKind {
        self.kind
    }

    // =========================================================================
    // SCANNING
    // =========================================================================

    /// Start scanning, stopping by itself after `max_duration` if given.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::ScanAlreadyRunning`] if a scan is active.
    pub fn start_scan(&self, max_duration: Option<Duration>) -> Result<()> {
        self.scanner.start(max_duration)?;
        Ok(())
    }

    /// Stop the active scan, if any, and report what it recorded.
    pub async fn stop_scan(&self) -> Option<ScanSummary> {
        self.scanner.stop().await
    }

    /// Current scan status.
    #[must_use]
    pub fn scan_status(&self) -> ScanStatus {
        self.scanner.status()
    }

    /// Watch the scan status.
    #[must_use]
    pub fn subscribe_scan_status(&self) -> watch::Receiver<ScanStatus> {
        self.scanner.subscribe_status()
    }

    // =========================================================================
    // ROSTER
    // =========================================================================

    /// The live roster, filtered by the current search text.
    #[must_use]
    pub fn roster(&self) -> Vec<RosterEntry> {
        self.roster.current()
    }

    /// Watch the live roster.
    #[must_use]
    pub fn subscribe_roster(&self) -> watch::Receiver<Vec<RosterEntry>> {
        self.roster.subscribe()
    }

    /// Health of the live roster.
    #[must_use]
    pub fn roster_health(&self) -> RosterHealth {
        self.roster.health()
    }

    /// Replace the live roster's search text (debounced).
    pub fn set_search_query(&self, query: impl Into<String>) {
        self.roster.set_query(query);
    }

    /// Current search text of the live roster.
    #[must_use]
    pub fn search_query(&self) -> String {
        self.roster.query()
    }

    /// Derive a roster for `query` right now, bypassing the debounce.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if either store cannot be read.
    pub fn search(&self, query: &str) -> Result<Vec<RosterEntry>> {
        let (rows, table) = read_snapshot(self.log.as_ref(), self.aliases.as_ref())?;
        Ok(derive_roster(self.kind, &rows, &table, query, &self.model))
    }

    /// Every stored observation, newest first.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the log cannot be read.
    pub fn observations(&self) -> Result<Vec<ScanObservation>> {
        Ok(self.log.query_all()?)
    }

    /// Delete every stored observation.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the log cannot be cleared.
    pub fn clear_logs(&self) -> Result<()> {
        self.log.clear_all()?;
        info!(kind = %self.kind, "Observation log cleared");
        Ok(())
    }

    // =========================================================================
    // ALIASES
    // =========================================================================

    /// Give `identifier` a display name. Returns the stored label.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::InvalidAlias`] for a blank identifier or label,
    /// or a persistence error if the alias cannot be stored.
    pub fn rename(&self, identifier: &str, label: &str) -> Result<Alias> {
        let identifier = identifier.trim();
        let label = label.trim();
        if identifier.is_empty() {
            return Err(SignalError::InvalidAlias("identifier must not be blank".into()));
        }
        if label.is_empty() {
            return Err(SignalError::InvalidAlias("label must not be blank".into()));
        }
        self.aliases.upsert(identifier, label)?;
        debug!(kind = %self.kind, identifier, label, "Alias stored");
        Ok(Alias {
            identifier: identifier.to_string(),
            label: label.to_string(),
        })
    }

    /// Remove the alias for `identifier`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the alias table cannot be written.
    pub fn remove_alias(&self, identifier: &str) -> Result<bool> {
        Ok(self.aliases.delete(identifier)?)
    }

    /// Every alias, ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the alias table cannot be read.
    pub fn aliases(&self) -> Result<Vec<Alias>> {
        Ok(self.aliases.query_all()?)
    }

    /// Delete every alias.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the alias table cannot be cleared.
    pub fn clear_aliases(&self) -> Result<()> {
        self.aliases.clear_all()?;
        info!(kind = %self.kind, "Alias table cleared");
        Ok(())
    }

    // =========================================================================
    // EXPORT
    // =========================================================================

    /// Export the whole log. Returns the number of rows exported.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::ExportIoFailure`] if the export fails.
    pub async fn export(&self) -> Result<usize> {
        Ok(self.export.export_log().await?)
    }

    /// Current export status.
    #[must_use]
    pub fn export_status(&self) -> ExportStatus {
        self.export.status()
    }
}

impl std::fmt::Debug for Radio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Radio")
            .field("kind", &self.kind)
            .field("scan_status", &self.scan_status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tokio_test::assert_ok;

    use super::*;
    use crate::export::ExportArtifact;
    use crate::export::ExportResult;
    use crate::platform::simulated::ScriptedScanSource;
    use crate::scan::{RawScanEvent, RawSighting};
    use crate::store::{MemoryAliasStore, MemoryObservationStore, StoreResult};

    #[derive(Default)]
    struct Capture(parking_lot::Mutex<Vec<ExportArtifact>>);

    #[async_trait::async_trait]
    impl ExportSink for Capture {
        async fn deliver(&self, artifact: &ExportArtifact) -> ExportResult<()> {
            self.0.lock().push(artifact.clone());
            Ok(())
        }
    }

    fn radio(source: ScriptedScanSource) -> (Radio, Arc<Capture>) {
        let sink = Arc::new(Capture::default());
        let radio = Radio::new(
            RadioParts {
                source: Arc::new(source),
                log: Arc::new(MemoryObservationStore::new()),
                aliases: Arc::new(MemoryAliasStore::new()),
                sink: Arc::clone(&sink) as Arc<dyn ExportSink>,
            },
            RadioOptions::default(),
        );
        (radio, sink)
    }

    async fn scan_to_completion(radio: &Radio) {
        assert_ok!(radio.start_scan(None));
        let mut status = radio.subscribe_scan_status();
        status
            .wait_for(|s| !matches!(s, ScanStatus::Scanning))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scan_feeds_roster_and_export() {
        let source = ScriptedScanSource::new(RadioKind::Ble).with_events(vec![
            RawScanEvent::single(RawSighting::ble("AA:01", Some("Tag"), -60)),
            RawScanEvent::single(RawSighting::ble("AA:02", None, -75)),
        ]);
        let (radio, sink) = radio(source);
        scan_to_completion(&radio).await;

        assert_eq!(radio.observations().unwrap().len(), 2);
        let mut roster = radio.subscribe_roster();
        let entries = roster.wait_for(|r| r.len() == 2).await.unwrap().clone();
        assert!(entries.iter().any(|e| e.display_name == "Unknown Device"));

        assert_eq!(radio.export().await.unwrap(), 2);
        let delivered = sink.0.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_rename_trims_and_rejects_blank() {
        let (radio, _) = radio(ScriptedScanSource::new(RadioKind::Wifi));

        let alias = radio.rename(" 00:11 ", "  Office AP ").unwrap();
        assert_eq!(alias.label, "Office AP");
        assert_eq!(radio.aliases().unwrap(), vec![alias]);

        let err = radio.rename("00:11", "   ").unwrap_err();
        assert!(matches!(err, SignalError::InvalidAlias(_)));
        assert_eq!(radio.aliases().unwrap()[0].label, "Office AP");

        assert!(radio.remove_alias("00:11").unwrap());
        assert!(!radio.remove_alias("00:11").unwrap());
    }

    #[tokio::test]
    async fn test_search_applies_alias_overlay_immediately() {
        let source = ScriptedScanSource::new(RadioKind::Ble).with_events(vec![
            RawScanEvent::single(RawSighting::ble("AA:01", Some("Tag"), -60)),
            RawScanEvent::single(RawSighting::ble("AA:02", Some("Beacon"), -70)),
        ]);
        let (radio, _) = radio(source);
        scan_to_completion(&radio).await;

        radio.rename("AA:02", "Front door").unwrap();
        let hits = radio.search("door").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].identifier, "AA:02");
        assert!(hits[0].is_aliased);

        assert_eq!(radio.search("  ").unwrap().len(), 2);
    }

    /// Alias table whose next read is raced by a fresh sighting, once armed.
    struct SightingDuringRead {
        inner: MemoryAliasStore,
        log: Arc<MemoryObservationStore>,
        armed: AtomicBool,
        reads: AtomicUsize,
    }

    impl AliasStore for SightingDuringRead {
        fn upsert(&self, identifier: &str, label: &str) -> StoreResult<()> {
            self.inner.upsert(identifier, label)
        }

        fn query_all(&self) -> StoreResult<Vec<Alias>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let aliases = self.inner.query_all()?;
            if self.armed.swap(false, Ordering::SeqCst) {
                let later = chrono::Utc::now() + chrono::Duration::seconds(1);
                self.log
                    .append(ScanObservation::ble("AA:02", "Beacon", -70, later))?;
            }
            Ok(aliases)
        }

        fn lookup(&self, identifier: &str) -> StoreResult<Option<String>> {
            self.inner.lookup(identifier)
        }

        fn delete(&self, identifier: &str) -> StoreResult<bool> {
            self.inner.delete(identifier)
        }

        fn clear_all(&self) -> StoreResult<()> {
            self.inner.clear_all()
        }

        fn revision(&self) -> watch::Receiver<u64> {
            self.inner.revision()
        }
    }

    #[tokio::test]
    async fn test_search_rereads_when_log_changes_mid_read() {
        let log = Arc::new(MemoryObservationStore::new());
        log.append(ScanObservation::ble("AA:01", "Tag", -60, chrono::Utc::now()))
            .unwrap();
        let aliases = Arc::new(SightingDuringRead {
            inner: MemoryAliasStore::new(),
            log: Arc::clone(&log),
            armed: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        });
        aliases.upsert("AA:02", "Front door").unwrap();
        let radio = Radio::new(
            RadioParts {
                source: Arc::new(ScriptedScanSource::new(RadioKind::Ble)),
                log: Arc::clone(&log) as Arc<dyn ObservationStore>,
                aliases: Arc::clone(&aliases) as Arc<dyn AliasStore>,
                sink: Arc::new(Capture::default()),
            },
            RadioOptions::default(),
        );

        aliases.armed.store(true, Ordering::SeqCst);
        let before = aliases.reads.load(Ordering::SeqCst);
        let hits = radio.search("").unwrap();

        assert_eq!(aliases.reads.load(Ordering::SeqCst) - before, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].identifier, "AA:02");
        assert_eq!(hits[0].display_name, "Front door");
        assert!(hits[0].is_aliased);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (radio, _) = radio(ScriptedScanSource::new(RadioKind::Ble).keep_open());
        assert_ok!(radio.start_scan(None));
        let err = radio.start_scan(None).unwrap_err();
        assert!(matches!(err, SignalError::ScanAlreadyRunning(RadioKind::Ble)));
        assert!(radio.stop_scan().await.is_some());
    }

    #[tokio::test]
    async fn test_clear_logs_empties_roster() {
        let source = ScriptedScanSource::new(RadioKind::Wifi).with_events(vec![
            RawScanEvent::single(RawSighting::wifi("00:11", Some("Home"), -50, 2437)),
        ]);
        let (radio, _) = radio(source);
        scan_to_completion(&radio).await;
        radio.subscribe_roster().wait_for(|r| r.len() == 1).await.unwrap();

        radio.clear_logs().unwrap();
        radio.subscribe_roster().wait_for(Vec::is_empty).await.unwrap();
        assert!(radio.observations().unwrap().is_empty());
    }
}
