//! Simulated radios.
//!
//! [`ScriptedScanSource`] replays a fixed list of platform events and records
//! how it was driven; [`SimulatedScanSource`] produces an endless stream of
//! advertisement bursts from a fixed set of emitters. [`SimulatedCentral`] and
//! [`SimulatedPeer`] stand in for a GATT stack, with an echoing peer and
//! knobs for injecting faults.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::scan::{RawScanEvent, RawSighting, ScanError, ScanResult, ScanSource};
use crate::session::{
    DiscoveredCharacteristic, DiscoveredService, GattCentral, GattPeer, GattProfile, LinkEvent,
    SessionError, SessionResult,
};
use crate::types::RadioKind;

const LINK_CAPACITY: usize = 32;

// =============================================================================
// SCRIPTED SCAN SOURCE
// =============================================================================

#[derive(Debug, Default)]
struct ScriptState {
    events: Vec<RawScanEvent>,
    start_error: Option<ScanError>,
    stop_error: Option<ScanError>,
    open: Option<mpsc::Sender<RawScanEvent>>,
}

/// Scan source that replays a script of platform events.
///
/// Clones share state, so a test can keep a handle to inspect call counts.
#[derive(Debug, Clone)]
pub struct ScriptedScanSource {
    kind: RadioKind,
    radio_enabled: Arc<AtomicBool>,
    keep_open: bool,
    state: Arc<Mutex<ScriptState>>,
    start_calls: Arc<AtomicUsize>,
    stop_calls: Arc<AtomicUsize>,
}

impl ScriptedScanSource {
    /// An enabled radio with an empty script.
    #[must_use]
    pub fn new(kind: RadioKind) -> Self {
        Self {
            kind,
            radio_enabled: Arc::new(AtomicBool::new(true)),
            keep_open: false,
            state: Arc::default(),
            start_calls: Arc::default(),
            stop_calls: Arc::default(),
        }
    }

    /// Events delivered on every start.
    #[must_use]
    pub fn with_events(self, events: Vec<RawScanEvent>) -> Self {
        self.state.lock().events = events;
        self
    }

    /// Switch the radio on or off.
    #[must_use]
    pub fn with_radio_enabled(self, enabled: bool) -> Self {
        self.radio_enabled.store(enabled, Ordering::SeqCst);
        self
    }

    /// Fail `start_scan` with `error`.
    #[must_use]
    pub fn with_start_error(self, error: ScanError) -> Self {
        self.state.lock().start_error = Some(error);
        self
    }

    /// Fail `stop_scan` with `error`.
    #[must_use]
    pub fn with_stop_error(self, error: ScanError) -> Self {
        self.state.lock().stop_error = Some(error);
        self
    }

    /// Keep the event channel open after the script until stopped.
    #[must_use]
    pub const fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    /// Number of `start_scan` calls.
    #[must_use]
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// Number of `stop_scan` calls.
    #[must_use]
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanSource for ScriptedScanSource {
    fn kind(&self) -> RadioKind {
        self.kind
    }

    fn is_radio_enabled(&self) -> bool {
        self.radio_enabled.load(Ordering::SeqCst)
    }

    async fn start_scan(&self) -> ScanResult<mpsc::Receiver<RawScanEvent>> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(error) = state.start_error.clone() {
            return Err(error);
        }

        let (tx, rx) = mpsc::channel(state.events.len().max(1));
        for event in &state.events {
            // Capacity covers the whole script.
            let _ = tx.try_send(event.clone());
        }
        if self.keep_open {
            state.open = Some(tx);
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> ScanResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.open = None;
        state.stop_error.clone().map_or(Ok(()), Err)
    }
}

// =============================================================================
// SYNTHETIC SCAN SOURCE
// =============================================================================

/// A synthetic emitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedEmitter {
    /// Hardware address.
    pub identifier: String,
    /// Advertised name or SSID (`None` for anonymous emitters).
    pub label: Option<String>,
    /// Mean signal strength.
    pub base_rssi_dbm: i16,
    /// Channel frequency (WiFi only).
    pub frequency_mhz: Option<u32>,
}

impl SimulatedEmitter {
    fn sighting(&self, tick: u64, index: usize) -> RawSighting {
        // Deterministic wobble of +-4 dB.
        let wobble = (tick.wrapping_mul(7).wrapping_add(index as u64 * 3) % 9) as i16 - 4;
        RawSighting {
            identifier: self.identifier.clone(),
            label: self.label.clone(),
            rssi_dbm: self.base_rssi_dbm.saturating_add(wobble).min(-1),
            frequency_mhz: self.frequency_mhz,
        }
    }
}

/// Scan source emitting periodic bursts from a fixed set of emitters.
#[derive(Debug)]
pub struct SimulatedScanSource {
    kind: RadioKind,
    emitters: Vec<SimulatedEmitter>,
    interval: Duration,
    running: Mutex<Option<CancellationToken>>,
}

impl SimulatedScanSource {
    /// Create a source for `emitters`, bursting every `interval`.
    #[must_use]
    pub fn new(kind: RadioKind, emitters: Vec<SimulatedEmitter>, interval: Duration) -> Self {
        Self {
            kind,
            emitters,
            interval,
            running: Mutex::new(None),
        }
    }

    /// A small neighbourhood of typical emitters for `kind`.
    #[must_use]
    pub fn demo(kind: RadioKind, interval: Duration) -> Self {
        let emitter = |identifier: &str, label: Option<&str>, rssi: i16, freq: Option<u32>| {
            SimulatedEmitter {
                identifier: identifier.to_string(),
                label: label.map(str::to_string),
                base_rssi_dbm: rssi,
                frequency_mhz: freq,
            }
        };
        let emitters = match kind {
            RadioKind::Ble => vec![
                emitter(DEMO_PEER, Some("HM-10 Serial"), -58, None),
                emitter("C4:7C:8D:6A:12:34", Some("Flower care"), -71, None),
                emitter("F0:99:B6:01:02:03", None, -84, None),
                emitter("E2:15:00:AA:BB:CC", Some("Tile, Keys"), -66, None),
            ],
            RadioKind::Wifi => vec![
                emitter("00:1A:2B:3C:4D:5E", Some("HomeNet"), -48, Some(2437)),
                emitter("00:1A:2B:3C:4D:5F", Some("HomeNet-5G"), -55, Some(5180)),
                emitter("A0:63:91:11:22:33", None, -77, Some(2412)),
                emitter("10:0C:6B:44:55:66", Some("Cafe, Guest"), -82, Some(5745)),
            ],
        };
        Self::new(kind, emitters, interval)
    }
}

/// Identifier of the echoing peer in the demo neighbourhood.
pub const DEMO_PEER: &str = "D4:36:39:00:10:01";

#[async_trait]
impl ScanSource for SimulatedScanSource {
    fn kind(&self) -> RadioKind {
        self.kind
    }

    fn is_radio_enabled(&self) -> bool {
        true
    }

    async fn start_scan(&self) -> ScanResult<mpsc::Receiver<RawScanEvent>> {
        let (tx, rx) = mpsc::channel(LINK_CAPACITY);
        let cancel = CancellationToken::new();
        if let Some(previous) = self.running.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let emitters = self.emitters.clone();
        let interval = self.interval;
        let kind = self.kind;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut tick = 0u64;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let burst: Vec<_> = emitters
                            .iter()
                            .enumerate()
                            .map(|(index, emitter)| emitter.sighting(tick, index))
                            .collect();
                        trace!(%kind, tick, sightings = burst.len(), "Simulated burst");
                        if tx.send(RawScanEvent::Batch(burst)).await.is_err() {
                            break;
                        }
                        tick += 1;
                    }
                }
            }
            debug!(%kind, "Simulated scan stopped");
        });
        Ok(rx)
    }

    async fn stop_scan(&self) -> ScanResult<()> {
        if let Some(cancel) = self.running.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

// =============================================================================
// SIMULATED GATT
// =============================================================================

/// GATT central resolving identifiers against a fixed set of peers.
#[derive(Default)]
pub struct SimulatedCentral {
    peers: HashMap<String, Arc<SimulatedPeer>>,
}

impl SimulatedCentral {
    /// A central with no peers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer.
    #[must_use]
    pub fn with_peer(mut self, peer: Arc<SimulatedPeer>) -> Self {
        self.peers.insert(peer.identifier.clone(), peer);
        self
    }
}

#[async_trait]
impl GattCentral for SimulatedCentral {
    async fn resolve_peer(&self, identifier: &str) -> SessionResult<Option<Arc<dyn GattPeer>>> {
        Ok(self
            .peers
            .get(identifier)
            .map(|peer| Arc::clone(peer) as Arc<dyn GattPeer>))
    }
}

#[derive(Default)]
struct PeerState {
    link: Option<mpsc::Sender<LinkEvent>>,
    writes: Vec<Vec<u8>>,
    disconnect_calls: usize,
    notifications_enabled: usize,
}

/// Simulated GATT peripheral that echoes writes back as notifications.
pub struct SimulatedPeer {
    identifier: String,
    profile: GattProfile,
    services: Option<Vec<DiscoveredService>>,
    connect_error: Option<SessionError>,
    establish: bool,
    echo: bool,
    state: Mutex<PeerState>,
}

impl SimulatedPeer {
    /// An echoing peer exposing `profile`'s default service.
    pub fn echo(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            profile: GattProfile::default(),
            services: None,
            connect_error: None,
            establish: true,
            echo: true,
            state: Mutex::default(),
        }
    }

    /// Use `profile` instead of the default identifiers.
    #[must_use]
    pub const fn with_profile(mut self, profile: GattProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Report these services instead of the profile's.
    #[must_use]
    pub fn with_services(mut self, services: Vec<DiscoveredService>) -> Self {
        self.services = Some(services);
        self
    }

    /// Fail connecting with `error`.
    #[must_use]
    pub fn with_connect_error(mut self, error: SessionError) -> Self {
        self.connect_error = Some(error);
        self
    }

    /// Accept the connect but never bring the link up.
    #[must_use]
    pub const fn never_establish(mut self) -> Self {
        self.establish = false;
        self
    }

    /// Push a notification on the read characteristic.
    pub fn notify(&self, value: Vec<u8>) {
        self.send(LinkEvent::Notification {
            characteristic: self.profile.read_characteristic,
            value,
        });
    }

    /// Drop the link from the peer side.
    pub fn lose_link(&self) {
        self.send(LinkEvent::Lost);
        self.state.lock().link = None;
    }

    /// Values written so far.
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    /// Number of `disconnect` calls.
    #[must_use]
    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }

    /// Number of successful `enable_notifications` calls.
    #[must_use]
    pub fn notifications_enabled(&self) -> usize {
        self.state.lock().notifications_enabled
    }

    fn send(&self, event: LinkEvent) {
        if let Some(link) = self.state.lock().link.as_ref() {
            if link.try_send(event).is_err() {
                debug!(identifier = %self.identifier, "Simulated link full or closed");
            }
        }
    }

    fn default_services(&self) -> Vec<DiscoveredService> {
        vec![DiscoveredService {
            uuid: self.profile.service,
            characteristics: vec![
                DiscoveredCharacteristic {
                    uuid: self.profile.read_characteristic,
                    notify: true,
                    write: false,
                },
                DiscoveredCharacteristic {
                    uuid: self.profile.write_characteristic,
                    notify: false,
                    write: true,
                },
            ],
        }]
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.services
            .clone()
            .unwrap_or_else(|| self.default_services())
            .iter()
            .filter(|s| s.uuid == service)
            .any(|s| s.characteristics.iter().any(|c| c.uuid == characteristic))
    }
}

#[async_trait]
impl GattPeer for SimulatedPeer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn connect(&self) -> SessionResult<mpsc::Receiver<LinkEvent>> {
        if let Some(error) = self.connect_error.clone() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(LINK_CAPACITY);
        if self.establish {
            let _ = tx.try_send(LinkEvent::Established);
        }
        self.state.lock().link = Some(tx);
        Ok(rx)
    }

    async fn discover_services(&self) -> SessionResult<Vec<DiscoveredService>> {
        Ok(self
            .services
            .clone()
            .unwrap_or_else(|| self.default_services()))
    }

    async fn enable_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
        _descriptor: Uuid,
    ) -> SessionResult<()> {
        if !self.has_characteristic(service, characteristic) {
            return Err(SessionError::DiscoveryFailed(format!(
                "characteristic {characteristic} not found"
            )));
        }
        self.state.lock().notifications_enabled += 1;
        Ok(())
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> SessionResult<()> {
        if !self.has_characteristic(service, characteristic) {
            return Err(SessionError::WriteFailed(format!(
                "characteristic {characteristic} not found"
            )));
        }
        if self.state.lock().link.is_none() {
            return Err(SessionError::NotConnected);
        }
        self.state.lock().writes.push(value.to_vec());
        if self.echo {
            self.notify(value.to_vec());
        }
        Ok(())
    }

    async fn disconnect(&self) -> SessionResult<()> {
        let mut state = self.state.lock();
        state.disconnect_calls += 1;
        state.link = None;
        Ok(())
    }
}
