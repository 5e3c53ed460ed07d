//! Observation log export.
//!
//! Renders a radio's complete observation log as CSV and hands it to an
//! [`ExportSink`]. Progress is published as an [`ExportStatus`] that returns
//! to `Idle` a short while after each export finishes.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::distance::PathLossModel;
use crate::store::ObservationStore;
use crate::types::{ObservationDetail, RadioKind, ScanObservation};

/// MIME type of exported logs.
pub const CSV_MIME_TYPE: &str = "text/csv";

/// Default delay before the status returns to `Idle`.
pub const DEFAULT_STATUS_RESET: Duration = Duration::from_millis(2000);

const BLE_HEADER: &str = "Timestamp,Time_Formatted,Device_Name,MAC_Address,RSSI_dBm,Distance_Meters";
const WIFI_HEADER: &str = "Timestamp,Time_Formatted,SSID,BSSID,Frequency_MHz,Signal_dBm";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors raised while exporting.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The log could not be read.
    #[error("Failed to read log: {0}")]
    ReadFailed(String),

    /// The artifact could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    ExportIoFailure {
        /// Destination that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The sink refused the artifact.
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Result type for export operations.
pub type ExportResult<T> = std::result::Result<T, ExportError>;

/// A rendered export ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    /// Suggested file name.
    pub file_name: String,
    /// MIME type of `body`.
    pub mime_type: String,
    /// Subject line for share targets.
    pub subject: String,
    /// CSV content.
    pub body: String,
}

/// Destination for export artifacts.
#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Deliver one artifact.
    async fn deliver(&self, artifact: &ExportArtifact) -> ExportResult<()>;
}

/// Writes artifacts into a directory.
///
/// Files are written to a temporary name and renamed into place, so a
/// reader never sees a partial export.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    /// Create a sink writing into `dir` (created on first delivery).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Target directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ExportSink for DirectorySink {
    async fn deliver(&self, artifact: &ExportArtifact) -> ExportResult<()> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ExportError::ExportIoFailure { path, source }
        };

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_err(&self.dir))?;

        let target = self.dir.join(&artifact.file_name);
        let temp = self.dir.join(format!(".{}.tmp", artifact.file_name));
        tokio::fs::write(&temp, artifact.body.as_bytes())
            .await
            .map_err(io_err(&temp))?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_err(&target)(e));
        }

        info!(path = %target.display(), bytes = artifact.body.len(), "Export written");
        Ok(())
    }
}

/// Export progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExportStatus {
    /// Nothing happening.
    Idle,
    /// An export is running.
    InProgress,
    /// The last export delivered this many records.
    Succeeded {
        /// Rows exported.
        records: usize,
    },
    /// The last export failed.
    Failed {
        /// Human-readable failure.
        reason: String,
    },
}

/// Options for an [`ExportCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportOptions {
    /// Distance model for the BLE distance column.
    pub model: PathLossModel,
    /// Timezone of the human-readable time column.
    pub timezone: Tz,
    /// Delay before a finished export's status returns to `Idle`.
    pub status_reset: Duration,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            model: PathLossModel::default(),
            timezone: Tz::UTC,
            status_reset: DEFAULT_STATUS_RESET,
        }
    }
}

/// Replace commas, which would otherwise split a CSV field.
#[must_use]
pub fn sanitize_label(label: &str) -> String {
    label.replace(',', " ")
}

/// Render `rows` as CSV for `kind`.
///
/// Every line, the header included, ends with `\n`.
#[must_use]
pub fn render_csv(
    kind: RadioKind,
    rows: &[ScanObservation],
    model: &PathLossModel,
    timezone: Tz,
) -> String {
    let header = match kind {
        RadioKind::Ble => BLE_HEADER,
        RadioKind::Wifi => WIFI_HEADER,
    };
    let mut out = String::with_capacity(header.len() + 1 + rows.len() * 64);
    out.push_str(header);
    out.push('\n');

    for row in rows {
        let millis = row.observed_at.timestamp_millis();
        let formatted = row.observed_at.with_timezone(&timezone).format(TIME_FORMAT);
        // Writing into a String cannot fail.
        let _ = match row.detail {
            ObservationDetail::Ble => {
                let name = if row.label.is_empty() {
                    RadioKind::Ble.unknown_label()
                } else {
                    row.label.as_str()
                };
                writeln!(
                    out,
                    "{millis},{formatted},{},{},{},{:.2}",
                    sanitize_label(name),
                    row.identifier,
                    row.rssi_dbm,
                    model.estimate(row.rssi_dbm)
                )
            }
            ObservationDetail::Wifi { frequency_mhz } => writeln!(
                out,
                "{millis},{formatted},{},{},{frequency_mhz},{}",
                sanitize_label(&row.label),
                row.identifier,
                row.rssi_dbm
            ),
        };
    }
    out
}

/// File name for an export created at `millis`.
#[must_use]
pub fn export_file_name(kind: RadioKind, millis: i64) -> String {
    match kind {
        RadioKind::Ble => format!("BLE_LOG_{millis}.csv"),
        RadioKind::Wifi => format!("SIGINT_LOG_{millis}.csv"),
    }
}

/// Subject line for an export.
#[must_use]
pub const fn export_subject(kind: RadioKind) -> &'static str {
    match kind {
        RadioKind::Ble => "BLE Signal Intelligence Log",
        RadioKind::Wifi => "Signal Intelligence Log",
    }
}

/// Exports one radio's observation log.
pub struct ExportCoordinator {
    kind: RadioKind,
    log: Arc<dyn ObservationStore>,
    sink: Arc<dyn ExportSink>,
    options: ExportOptions,
    status: watch::Sender<ExportStatus>,
    generation: Arc<AtomicU64>,
}

impl ExportCoordinator {
    /// Create a coordinator exporting `log` to `sink`.
    pub fn new(
        kind: RadioKind,
        log: Arc<dyn ObservationStore>,
        sink: Arc<dyn ExportSink>,
        options: ExportOptions,
    ) -> Self {
        Self {
            kind,
            log,
            sink,
            options,
            status: watch::channel(ExportStatus::Idle).0,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Export the whole log. Returns the number of rows exported.
    ///
    /// Nothing is delivered if the log cannot be read.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] if reading or delivery fails. The failure is
    /// also published on the status.
    pub async fn export_log(&self) -> ExportResult<usize> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_replace(ExportStatus::InProgress);
        debug!(kind = %self.kind, "Export started");

        let result = self.run().await;
        match &result {
            Ok(records) => {
                info!(kind = %self.kind, records, "Export finished");
                self.status
                    .send_replace(ExportStatus::Succeeded { records: *records });
            }
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "Export failed");
                self.status.send_replace(ExportStatus::Failed {
                    reason: format!("Export failed: {e}"),
                });
            }
        }
        self.schedule_reset(generation);
        result
    }

    async fn run(&self) -> ExportResult<usize> {
        let rows = self
            .log
            .query_all()
            .map_err(|e| ExportError::ReadFailed(e.to_string()))?;
        let body = render_csv(self.kind, &rows, &self.options.model, self.options.timezone);
        let artifact = ExportArtifact {
            file_name: export_file_name(self.kind, Utc::now().timestamp_millis()),
            mime_type: CSV_MIME_TYPE.to_string(),
            subject: export_subject(self.kind).to_string(),
            body,
        };
        self.sink.deliver(&artifact).await?;
        Ok(rows.len())
    }

    /// Return to `Idle` after the reset delay unless a newer export started.
    fn schedule_reset(&self, generation: u64) {
        let status = self.status.clone();
        let current = Arc::clone(&self.generation);
        let delay = self.options.status_reset;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::SeqCst) == generation {
                status.send_replace(ExportStatus::Idle);
            }
        });
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ExportStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ExportStatus> {
        self.status.subscribe()
    }
}

impl std::fmt::Debug for ExportCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportCoordinator")
            .field("kind", &self.kind)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}
