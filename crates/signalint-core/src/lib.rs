//! # signalint-core
//!
//! Telemetry aggregation and device-session engine for nearby BLE peripherals
//! and WiFi access points.
//!
//! This crate provides:
//! - Lazy, cancellable scan streams over a platform radio
//! - Ingestion of scan results into per-radio observation logs
//! - A reactive, alias-resolved and searchable device roster
//! - A single GATT connection session driven as an explicit state machine
//! - CSV export of the observation logs
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`distance`] - RSSI to distance estimation (log-distance path loss)
//! - [`scan`] - Scan source trait and the scan stream adapter
//! - [`ingest`] - Scan controller writing a scan stream into a log
//! - [`roster`] - Roster derivation and the reactive aggregator
//! - [`session`] - Connection session state machine and GATT traits
//! - [`export`] - CSV rendering, export sinks and the export coordinator
//! - [`store`] - Observation and alias stores (memory and JSON files)
//! - [`radio`] - Per-radio wiring of the above
//! - [`platform`] - Simulated and BlueZ radio backends
//! - [`config`] - Application configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod config;
pub mod distance;
pub mod error;
pub mod export;
pub mod ingest;
pub mod platform;
pub mod radio;
pub mod roster;
pub mod scan;
pub mod session;
pub mod store;
pub mod types;

// Re-export primary types for convenience
pub use config::{
    is_valid_mac_address, is_valid_timezone_format, Config, ConfigError, ConfigResult,
    RadioBackend,
};
pub use distance::{estimate_distance, PathLossModel, UNKNOWN_DISTANCE};
pub use error::{Result, SignalError};
pub use export::{DirectorySink, ExportCoordinator, ExportError, ExportSink, ExportStatus};
pub use ingest::{ScanController, ScanStatus, ScanSummary};
pub use radio::{Radio, RadioOptions, RadioParts};
pub use roster::{derive_roster, RosterAggregator, RosterEntry, RosterHealth};
pub use scan::{start_scan, ScanError, ScanOptions, ScanSource, ScanStream};
pub use session::{
    ConnectionState, DataChannel, GattCentral, GattPeer, GattProfile, SessionError,
    SessionManager, SessionOptions,
};
pub use store::{
    default_data_dir, AliasStore, JsonAliasStore, JsonLinesObservationStore,
    MemoryAliasStore, MemoryObservationStore, ObservationStore, StorageLayout, StoreError,
};
pub use types::{Alias, ObservationDetail, RadioKind, ScanObservation, SessionMessage};
