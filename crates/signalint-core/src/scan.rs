//! Scan stream adapter.
//!
//! Wraps a platform [`ScanSource`] as a lazily started, cancellable
//! [`Stream`] of typed results. The platform side reports bursts of raw
//! sightings; the adapter expands them into one [`ScanObservation`] per
//! sighting, in the order received, without deduplicating anything.
//!
//! # Termination
//!
//! - Radio disabled, scanner unavailable or permission denied: the first
//!   element is the failure and the stream ends.
//! - A platform error code mid-scan: one failure element, then the stream ends.
//! - Cancellation, drop, or the optional maximum duration elapsing: the stream
//!   simply ends. Expiry is a normal stop, not an error.
//!
//! In every case the adapter attempts [`ScanSource::stop_scan`] once the
//! platform scan was started. A failing stop is logged, never propagated.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::types::{RadioKind, ScanObservation};

/// Default capacity of the channel between the platform pump and the consumer.
pub const DEFAULT_SCAN_BUFFER: usize = 64;

/// Errors produced by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// No scanner exists for this radio.
    #[error("{kind} scanner is not available on this system")]
    RadioUnavailable {
        /// Radio that was requested.
        kind: RadioKind,
    },

    /// The radio exists but is switched off.
    #[error("{kind} radio is disabled")]
    RadioDisabled {
        /// Radio that was requested.
        kind: RadioKind,
    },

    /// The platform refused the scan.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The platform reported an error code while scanning.
    #[error("Scan failed: {code}")]
    PlatformFailure {
        /// Platform-specific error code.
        code: i32,
    },

    /// The platform scan could not be started for another reason.
    #[error("Failed to start scan: {0}")]
    StartFailed(String),

    /// The platform scan could not be stopped.
    #[error("Failed to stop scan: {0}")]
    StopFailed(String),
}

/// Result type for scan operations.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// One sighting as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSighting {
    /// Hardware address.
    pub identifier: String,
    /// Advertised name or SSID, if any.
    pub label: Option<String>,
    /// Signal strength in dBm.
    pub rssi_dbm: i16,
    /// Channel frequency (WiFi only).
    pub frequency_mhz: Option<u32>,
}

impl RawSighting {
    /// A BLE sighting.
    pub fn ble(identifier: impl Into<String>, label: Option<&str>, rssi_dbm: i16) -> Self {
        Self {
            identifier: identifier.into(),
            label: label.map(str::to_string),
            rssi_dbm,
            frequency_mhz: None,
        }
    }

    /// A WiFi sighting.
    pub fn wifi(
        identifier: impl Into<String>,
        ssid: Option<&str>,
        rssi_dbm: i16,
        frequency_mhz: u32,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            label: ssid.map(str::to_string),
            rssi_dbm,
            frequency_mhz: Some(frequency_mhz),
        }
    }
}

/// Event delivered by a platform scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawScanEvent {
    /// One or more sightings, in the order the platform reported them.
    Batch(Vec<RawSighting>),
    /// The platform scan failed with an error code.
    Failed {
        /// Platform-specific error code.
        code: i32,
    },
}

impl RawScanEvent {
    /// A batch holding a single sighting.
    #[must_use]
    pub fn single(sighting: RawSighting) -> Self {
        Self::Batch(vec![sighting])
    }
}

/// Platform radio scanner.
///
/// `start_scan` hands back a channel of raw events; the channel closing means
/// the platform stopped on its own.
#[async_trait]
pub trait ScanSource: Send + Sync {
    /// Radio this source scans.
    fn kind(&self) -> RadioKind;

    /// Whether the radio is currently switched on.
    fn is_radio_enabled(&self) -> bool;

    /// Start the platform scan.
    async fn start_scan(&self) -> ScanResult<mpsc::Receiver<RawScanEvent>>;

    /// Stop the platform scan and release its handle.
    async fn stop_scan(&self) -> ScanResult<()>;
}

/// Options for a scan stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// Stop normally after this long. `None` scans until cancelled.
    pub max_duration: Option<Duration>,
    /// Capacity of the internal channel. Producers wait when it is full.
    pub buffer: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_duration: None,
            buffer: DEFAULT_SCAN_BUFFER,
        }
    }
}

impl ScanOptions {
    /// Options with a maximum duration.
    #[must_use]
    pub fn with_max_duration(duration: Duration) -> Self {
        Self {
            max_duration: Some(duration),
            ..Self::default()
        }
    }
}

/// Start a scan on `source`.
///
/// Nothing happens until the returned stream is first polled.
#[must_use]
pub fn start_scan(source: Arc<dyn ScanSource>, options: ScanOptions) -> ScanStream {
    ScanStream::new(source, options)
}

enum StreamState {
    Idle {
        source: Arc<dyn ScanSource>,
        options: ScanOptions,
    },
    Running(mpsc::Receiver<ScanResult<ScanObservation>>),
    Done,
}

/// Cancellable stream of scan results.
///
/// Dropping the stream cancels the underlying scan.
pub struct ScanStream {
    state: StreamState,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
}

impl ScanStream {
    fn new(source: Arc<dyn ScanSource>, options: ScanOptions) -> Self {
        let cancel = CancellationToken::new();
        Self {
            state: StreamState::Idle { source, options },
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
        }
    }

    /// Token that cancels this scan when triggered.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the scan. The stream ends once the platform scan is stopped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ScanStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            StreamState::Idle { .. } => "idle",
            StreamState::Running(_) => "running",
            StreamState::Done => "done",
        };
        f.debug_struct("ScanStream")
            .field("state", &state)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Stream for ScanStream {
    type Item = ScanResult<ScanObservation>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                StreamState::Idle { .. } => {
                    let StreamState::Idle { source, options } =
                        std::mem::replace(&mut this.state, StreamState::Done)
                    else {
                        unreachable!("state checked above");
                    };
                    if this.cancel.is_cancelled() {
                        return Poll::Ready(None);
                    }
                    let (tx, rx) = mpsc::channel(options.buffer.max(1));
                    tokio::spawn(pump(source, options, tx, this.cancel.clone()));
                    this.state = StreamState::Running(rx);
                }
                StreamState::Running(rx) => {
                    return match rx.poll_recv(cx) {
                        Poll::Ready(None) => {
                            this.state = StreamState::Done;
                            Poll::Ready(None)
                        }
                        other => other,
                    };
                }
                StreamState::Done => return Poll::Ready(None),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    Expired,
    ConsumerGone,
    SourceClosed,
    PlatformError,
}

/// Convert a platform sighting, discarding ones without an identifier.
fn observation_from(kind: RadioKind, sighting: RawSighting) -> Option<ScanObservation> {
    if sighting.identifier.trim().is_empty() {
        debug!(%kind, "Discarding sighting without identifier");
        return None;
    }
    let label = sighting.label.unwrap_or_default();
    let now = Utc::now();
    Some(match kind {
        RadioKind::Ble => ScanObservation::ble(sighting.identifier, label, sighting.rssi_dbm, now),
        RadioKind::Wifi => ScanObservation::wifi(
            sighting.identifier,
            label,
            sighting.rssi_dbm,
            sighting.frequency_mhz.unwrap_or_default(),
            now,
        ),
    })
}

/// Send one item, waiting for capacity unless the scan is cancelled first.
async fn forward(
    tx: &mpsc::Sender<ScanResult<ScanObservation>>,
    cancel: &CancellationToken,
    item: ScanResult<ScanObservation>,
) -> Option<StopReason> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Some(StopReason::Cancelled),
        sent = tx.send(item) => sent.err().map(|_| StopReason::ConsumerGone),
    }
}

async fn pump(
    source: Arc<dyn ScanSource>,
    options: ScanOptions,
    tx: mpsc::Sender<ScanResult<ScanObservation>>,
    cancel: CancellationToken,
) {
    let kind = source.kind();

    if !source.is_radio_enabled() {
        warn!(%kind, "Radio disabled, not scanning");
        let _ = tx.send(Err(ScanError::RadioDisabled { kind })).await;
        return;
    }

    let mut events = match source.start_scan().await {
        Ok(events) => events,
        Err(e) => {
            warn!(%kind, error = %e, "Scan could not be started");
            let _ = tx.send(Err(e)).await;
            return;
        }
    };
    info!(%kind, max_duration = ?options.max_duration, "Scan started");

    let deadline = options.max_duration.map(|d| Instant::now() + d);
    let expiry = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));
    tokio::pin!(expiry);

    let mut forwarded = 0usize;
    let reason = 'scan: loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break StopReason::Cancelled,
            () = &mut expiry, if deadline.is_some() => {
                cancel.cancel();
                break StopReason::Expired;
            }
            event = events.recv() => match event {
                None => break StopReason::SourceClosed,
                Some(RawScanEvent::Batch(sightings)) => {
                    for sighting in sightings {
                        let Some(observation) = observation_from(kind, sighting) else {
                            continue;
                        };
                        if let Some(reason) = forward(&tx, &cancel, Ok(observation)).await {
                            break 'scan reason;
                        }
                        forwarded += 1;
                    }
                }
                Some(RawScanEvent::Failed { code }) => {
                    warn!(%kind, code, "Platform reported scan failure");
                    let _ = forward(&tx, &cancel, Err(ScanError::PlatformFailure { code })).await;
                    break StopReason::PlatformError;
                }
            }
        }
    };

    match source.stop_scan().await {
        Ok(()) => debug!(%kind, "Platform scan stopped"),
        Err(e) => warn!(%kind, error = %e, "Error stopping scan"),
    }
    info!(%kind, ?reason, forwarded, "Scan finished");
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::platform::simulated::ScriptedScanSource;

    #[tokio::test]
    async fn test_batches_expand_in_order() {
        let source = ScriptedScanSource::new(RadioKind::Ble).with_events(vec![
            RawScanEvent::Batch(vec![
                RawSighting::ble("A", Some("Tag"), -50),
                RawSighting::ble("B", None, -70),
            ]),
            RawScanEvent::single(RawSighting::ble("A", Some("Tag"), -55)),
        ]);
        let stream = start_scan(Arc::new(source.clone()), ScanOptions::default());

        let items: Vec<_> = stream.collect().await;
        let ids: Vec<_> = items
            .iter()
            .map(|r| r.as_ref().unwrap().identifier.as_str())
            .collect();
        assert_eq!(ids, ["A", "B", "A"]);
        assert_eq!(items[1].as_ref().unwrap().label, "");
        assert_eq!(source.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_disabled_radio_fails_fast() {
        let source = ScriptedScanSource::new(RadioKind::Ble).with_radio_enabled(false);
        let items: Vec<_> = start_scan(Arc::new(source.clone()), ScanOptions::default())
            .collect()
            .await;

        assert_eq!(
            items,
            vec![Err(ScanError::RadioDisabled {
                kind: RadioKind::Ble
            })]
        );
        assert_eq!(source.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_is_terminal() {
        let source = ScriptedScanSource::new(RadioKind::Wifi)
            .with_start_error(ScanError::PermissionDenied("location".into()));
        let items: Vec<_> = start_scan(Arc::new(source), ScanOptions::default())
            .collect()
            .await;

        assert_eq!(
            items,
            vec![Err(ScanError::PermissionDenied("location".into()))]
        );
    }

    #[tokio::test]
    async fn test_platform_error_emits_one_failure_then_closes() {
        let source = ScriptedScanSource::new(RadioKind::Ble).with_events(vec![
            RawScanEvent::single(RawSighting::ble("A", None, -60)),
            RawScanEvent::Failed { code: 2 },
            RawScanEvent::single(RawSighting::ble("B", None, -60)),
        ]);
        let items: Vec<_> = start_scan(Arc::new(source.clone()), ScanOptions::default())
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(items[1], Err(ScanError::PlatformFailure { code: 2 }));
        assert_eq!(source.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let source = ScriptedScanSource::new(RadioKind::Ble);
        let stream = start_scan(Arc::new(source.clone()), ScanOptions::default());
        tokio::task::yield_now().await;
        assert_eq!(source.start_calls(), 0);
        drop(stream);
        tokio::task::yield_now().await;
        assert_eq!(source.start_calls(), 0);
        assert_eq!(source.stop_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_is_a_normal_stop() {
        let source = ScriptedScanSource::new(RadioKind::Ble)
            .with_events(vec![RawScanEvent::single(RawSighting::ble("A", None, -60))])
            .keep_open();
        let stream = start_scan(
            Arc::new(source.clone()),
            ScanOptions::with_max_duration(Duration::from_secs(10)),
        );

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
        assert_eq!(source.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_platform_scan() {
        let source = ScriptedScanSource::new(RadioKind::Wifi)
            .with_events(vec![RawScanEvent::single(RawSighting::wifi(
                "B1",
                Some("Cafe"),
                -60,
                2412,
            ))])
            .keep_open();
        let mut stream = start_scan(Arc::new(source.clone()), ScanOptions::default());

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.frequency_mhz(), Some(2412));

        stream.cancel();
        assert!(stream.next().await.is_none());
        assert_eq!(source.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_failure_is_not_propagated() {
        let source = ScriptedScanSource::new(RadioKind::Ble)
            .with_events(vec![RawScanEvent::single(RawSighting::ble("A", None, -60))])
            .with_stop_error(ScanError::StopFailed("handle already released".into()));
        let items: Vec<_> = start_scan(Arc::new(source.clone()), ScanOptions::default())
            .collect()
            .await;

        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
        assert_eq!(source.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_blank_identifiers_are_discarded() {
        let source = ScriptedScanSource::new(RadioKind::Ble).with_events(vec![RawScanEvent::Batch(
            vec![RawSighting::ble("  ", None, -60), RawSighting::ble("A", None, -61)],
        )]);
        let items: Vec<_> = start_scan(Arc::new(source), ScanOptions::default())
            .collect()
            .await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_slow_consumer_gets_every_event() {
        let sightings: Vec<_> = (0..50)
            .map(|i| RawSighting::ble(format!("DEV{i:02}"), None, -60))
            .collect();
        let source = ScriptedScanSource::new(RadioKind::Ble)
            .with_events(vec![RawScanEvent::Batch(sightings)]);
        let mut stream = start_scan(
            Arc::new(source),
            ScanOptions {
                max_duration: None,
                buffer: 2,
            },
        );

        let mut seen = Vec::new();
        while let Some(item) = stream.next().await {
            tokio::task::yield_now().await;
            seen.push(item.unwrap().identifier);
        }
        assert_eq!(seen.len(), 50);
        assert_eq!(seen.first().map(String::as_str), Some("DEV00"));
        assert_eq!(seen.last().map(String::as_str), Some("DEV49"));
    }
}
