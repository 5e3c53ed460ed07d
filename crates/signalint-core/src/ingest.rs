//! Ingestion controller.
//!
//! Drives one scan stream per radio kind into that kind's observation log.
//! Only one scan may be active per controller at a time; every accepted
//! observation is appended in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::scan::{start_scan, ScanOptions, ScanSource, ScanStream};
use crate::store::ObservationStore;
use crate::types::RadioKind;

/// Errors raised when controlling a scan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// A scan is already running for this radio.
    #[error("A {kind} scan is already running")]
    ScanAlreadyRunning {
        /// Radio that is busy.
        kind: RadioKind,
    },
}

/// Scan status for one radio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScanStatus {
    /// No scan running.
    Idle,
    /// A scan is running.
    Scanning,
    /// The last scan ended with an error. Cleared by the next start.
    Failed {
        /// Human-readable failure.
        reason: String,
    },
}

/// Outcome of one finished scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    /// Radio that was scanned.
    pub kind: RadioKind,
    /// Observations appended to the log.
    pub recorded: usize,
    /// Why the scan ended early, if it failed.
    pub error: Option<String>,
}

struct ActiveScan {
    cancel: CancellationToken,
    handle: JoinHandle<ScanSummary>,
}

/// Scan slot of a controller. A scan stays in the slot until its task has
/// been awaited, so no new scan can start while the old one is stopping.
enum Slot {
    Empty,
    Running(ActiveScan),
    Stopping,
}

impl Slot {
    fn is_busy(&self) -> bool {
        match self {
            Self::Empty => false,
            Self::Running(scan) => !scan.handle.is_finished(),
            Self::Stopping => true,
        }
    }
}

/// Holds a scan being stopped. If the stopping future is dropped before the
/// task finishes, the cancelled scan goes back into the slot.
struct StopGuard<'a> {
    slot: &'a Mutex<Slot>,
    scan: Option<ActiveScan>,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        *slot = self.scan.take().map_or(Slot::Empty, Slot::Running);
    }
}

/// Runs scans for one radio kind and records their observations.
pub struct ScanController {
    kind: RadioKind,
    source: Arc<dyn ScanSource>,
    log: Arc<dyn ObservationStore>,
    buffer: usize,
    status: watch::Sender<ScanStatus>,
    generation: Arc<AtomicU64>,
    slot: Mutex<Slot>,
}

impl ScanController {
    /// Create a controller feeding `log` from `source`.
    pub fn new(source: Arc<dyn ScanSource>, log: Arc<dyn ObservationStore>) -> Self {
        Self {
            kind: source.kind(),
            source,
            log,
            buffer: crate::scan::DEFAULT_SCAN_BUFFER,
            status: watch::channel(ScanStatus::Idle).0,
            generation: Arc::new(AtomicU64::new(0)),
            slot: Mutex::new(Slot::Empty),
        }
    }

    /// Override the scan channel capacity.
    #[must_use]
    pub const fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    /// Radio this controller scans.
    #[must_use]
    pub const fn kind(&self) -> RadioKind {
        self.kind
    }

    /// Start scanning, stopping normally after `max_duration` if given.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::ScanAlreadyRunning`] while another scan is
    /// active or still stopping.
    pub fn start(&self, max_duration: Option<Duration>) -> Result<(), IngestError> {
        let mut slot = self.slot.lock();
        if slot.is_busy() {
            return Err(IngestError::ScanAlreadyRunning { kind: self.kind });
        }

        let stream = start_scan(
            Arc::clone(&self.source),
            ScanOptions {
                max_duration,
                buffer: self.buffer,
            },
        );
        let cancel = stream.cancellation_token();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_replace(ScanStatus::Scanning);
        info!(kind = %self.kind, generation, ?max_duration, "Starting ingestion");

        let handle = tokio::spawn(ingest(
            self.kind,
            stream,
            Arc::clone(&self.log),
            StatusPublisher {
                status: self.status.clone(),
                current: Arc::clone(&self.generation),
                generation,
            },
        ));
        *slot = Slot::Running(ActiveScan { cancel, handle });
        Ok(())
    }

    /// Stop the active scan and wait for it to finish.
    ///
    /// Returns the summary of the stopped scan, or `None` if nothing was running.
    pub async fn stop(&self) -> Option<ScanSummary> {
        let scan = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Stopping) {
                Slot::Running(scan) => scan,
                other => {
                    *slot = other;
                    return None;
                }
            }
        };
        scan.cancel.cancel();

        let mut guard = StopGuard {
            slot: &self.slot,
            scan: Some(scan),
        };
        let joined = (&mut guard.scan.as_mut()?.handle).await;
        guard.scan = None;
        drop(guard);

        match joined {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "Ingestion task failed");
                self.status.send_replace(ScanStatus::Failed {
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    /// Current scan status.
    #[must_use]
    pub fn status(&self) -> ScanStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to scan status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ScanStatus> {
        self.status.subscribe()
    }

    /// Whether a scan is currently running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.slot.lock().is_busy()
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        if let Slot::Running(scan) = self.slot.get_mut() {
            scan.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for ScanController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanController")
            .field("kind", &self.kind)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

/// Publishes the final status of one scan unless a newer scan has started.
struct StatusPublisher {
    status: watch::Sender<ScanStatus>,
    current: Arc<AtomicU64>,
    generation: u64,
}

impl StatusPublisher {
    fn finish(&self, next: ScanStatus) {
        self.status.send_if_modified(|status| {
            if self.current.load(Ordering::SeqCst) != self.generation {
                return false;
            }
            *status = next;
            true
        });
    }
}

async fn ingest(
    kind: RadioKind,
    mut stream: ScanStream,
    log: Arc<dyn ObservationStore>,
    status: StatusPublisher,
) -> ScanSummary {
    let mut recorded = 0usize;
    let mut error = None;

    while let Some(item) = stream.next().await {
        match item {
            Ok(observation) => {
                debug!(
                    %kind,
                    identifier = %observation.identifier,
                    rssi = observation.rssi_dbm,
                    "Recording observation"
                );
                if let Err(e) = log.append(observation) {
                    warn!(%kind, error = %e, "Failed to record observation, stopping scan");
                    error = Some(e.to_string());
                    stream.cancel();
                    break;
                }
                recorded += 1;
            }
            Err(e) => {
                warn!(%kind, error = %e, "Scan failed");
                error = Some(e.to_string());
            }
        }
    }
    // Drain so the pump has called stop_scan before the summary is reported.
    while stream.next().await.is_some() {}

    status.finish(error.as_ref().map_or(ScanStatus::Idle, |reason| {
        ScanStatus::Failed {
            reason: reason.clone(),
        }
    }));
    info!(%kind, recorded, failed = error.is_some(), "Ingestion finished");

    ScanSummary {
        kind,
        recorded,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::simulated::ScriptedScanSource;
    use crate::scan::{RawScanEvent, RawSighting, ScanError};
    use crate::store::MemoryObservationStore;

    fn controller(source: &ScriptedScanSource) -> (ScanController, Arc<MemoryObservationStore>) {
        let log = Arc::new(MemoryObservationStore::new());
        let controller = ScanController::new(Arc::new(source.clone()), log.clone());
        (controller, log)
    }

    async fn started(source: &ScriptedScanSource, calls: usize) {
        while source.start_calls() < calls {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_records_every_observation() {
        let source = ScriptedScanSource::new(RadioKind::Ble).with_events(vec![
            RawScanEvent::Batch(vec![
                RawSighting::ble("A", Some("Tag"), -50),
                RawSighting::ble("A", Some("Tag"), -52),
            ]),
            RawScanEvent::single(RawSighting::ble("B", None, -80)),
        ]);
        let (controller, log) = controller(&source);
        let mut status = controller.subscribe_status();

        controller.start(None).unwrap();
        status.wait_for(|s| *s == ScanStatus::Idle).await.unwrap();

        assert_eq!(log.len(), 3);
        assert!(!controller.is_scanning());
        assert_eq!(source.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let source = ScriptedScanSource::new(RadioKind::Wifi).keep_open();
        let (controller, _log) = controller(&source);

        controller.start(None).unwrap();
        assert_eq!(
            controller.start(None),
            Err(IngestError::ScanAlreadyRunning {
                kind: RadioKind::Wifi
            })
        );

        let summary = controller.stop().await.unwrap();
        assert_eq!(summary.recorded, 0);
        assert_eq!(summary.error, None);
        assert_eq!(controller.status(), ScanStatus::Idle);

        // A new scan may start once the previous one stopped.
        controller.start(None).unwrap();
        assert!(controller.is_scanning());
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_start_rejected_while_previous_scan_is_stopping() {
        let source = ScriptedScanSource::new(RadioKind::Ble).keep_open();
        let (controller, _log) = controller(&source);
        controller.start(None).unwrap();
        started(&source, 1).await;

        let stop = controller.stop();
        tokio::pin!(stop);
        assert!(futures::poll!(&mut stop).is_pending());

        assert_eq!(
            controller.start(None),
            Err(IngestError::ScanAlreadyRunning {
                kind: RadioKind::Ble
            })
        );
        assert!(controller.is_scanning());

        assert!(stop.await.is_some());
        assert_eq!(controller.status(), ScanStatus::Idle);

        controller.start(None).unwrap();
        started(&source, 2).await;
        assert_eq!(controller.status(), ScanStatus::Scanning);
        assert_eq!(source.stop_calls(), 1);
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_stop_keeps_scan_in_slot() {
        let source = ScriptedScanSource::new(RadioKind::Ble).keep_open();
        let (controller, _log) = controller(&source);
        controller.start(None).unwrap();

        {
            let stop = controller.stop();
            tokio::pin!(stop);
            assert!(futures::poll!(&mut stop).is_pending());
        }

        // The cancelled scan winds down on its own and frees the slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!controller.is_scanning());
        assert_eq!(controller.status(), ScanStatus::Idle);

        controller.start(None).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.status(), ScanStatus::Scanning);
        assert_eq!(controller.stop().await.map(|s| s.recorded), Some(0));
    }

    #[tokio::test]
    async fn test_stop_without_scan_is_noop() {
        let source = ScriptedScanSource::new(RadioKind::Ble);
        let (controller, _log) = controller(&source);
        assert_eq!(controller.stop().await, None);
        assert_eq!(source.stop_calls(), 0);
    }

    #[tokio::test]
    async fn test_scan_failure_is_reported_on_status() {
        let source = ScriptedScanSource::new(RadioKind::Ble).with_radio_enabled(false);
        let (controller, log) = controller(&source);
        let mut status = controller.subscribe_status();

        controller.start(None).unwrap();
        let failed = status
            .wait_for(|s| matches!(s, ScanStatus::Failed { .. }))
            .await
            .unwrap()
            .clone();

        assert_eq!(
            failed,
            ScanStatus::Failed {
                reason: ScanError::RadioDisabled {
                    kind: RadioKind::Ble
                }
                .to_string()
            }
        );
        assert!(log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_returns_to_idle() {
        let source = ScriptedScanSource::new(RadioKind::Ble)
            .with_events(vec![RawScanEvent::single(RawSighting::ble("A", None, -60))])
            .keep_open();
        let (controller, log) = controller(&source);

        controller.start(Some(Duration::from_secs(10))).unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(!controller.is_scanning());
        assert_eq!(controller.status(), ScanStatus::Idle);
        assert_eq!(log.len(), 1);
        assert_eq!(source.stop_calls(), 1);
    }
}
