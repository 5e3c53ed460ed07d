//! BlueZ backend over D-Bus.
//!
//! Discovery uses the default adapter's device discovery. Each device that
//! appears yields a sighting, and later RSSI changes yield further sightings
//! so the observation log sees the device move.
//!
//! The GATT side maps a resolved [`bluer::Device`] onto [`GattPeer`]. BlueZ
//! writes the client configuration descriptor itself when a notification
//! session starts, so the descriptor is only used for logging here.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty, ErrorKind,
};
use futures::stream::SelectAll;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::is_valid_mac_address;
use crate::scan::{
    RawScanEvent, RawSighting, ScanError, ScanResult, ScanSource, DEFAULT_SCAN_BUFFER,
};
use crate::session::{
    DiscoveredCharacteristic, DiscoveredService, GattCentral, GattPeer, LinkEvent, SessionError,
    SessionResult,
};
use crate::types::RadioKind;

type DeviceEvents = Pin<Box<dyn Stream<Item = (Address, DeviceEvent)> + Send>>;

const LINK_CAPACITY: usize = 32;

fn scan_error(err: &bluer::Error) -> ScanError {
    match err.kind {
        ErrorKind::NotPermitted | ErrorKind::NotAuthorized => {
            ScanError::PermissionDenied(err.message.clone())
        }
        _ => ScanError::StartFailed(err.to_string()),
    }
}

async fn open_adapter() -> bluer::Result<(bluer::Session, Adapter)> {
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    Ok((session, adapter))
}

// =============================================================================
// DISCOVERY
// =============================================================================

/// BLE scan source backed by the default BlueZ adapter.
pub struct BluezScanSource {
    _session: bluer::Session,
    adapter: Adapter,
    powered: Arc<AtomicBool>,
    running: Mutex<Option<CancellationToken>>,
    _watcher: DropGuard,
}

impl BluezScanSource {
    /// Connect to BlueZ and open the default adapter.
    ///
    /// # Errors
    ///
    /// Returns `RadioUnavailable` when there is no D-Bus session or adapter.
    pub async fn new() -> ScanResult<Self> {
        let (session, adapter) = open_adapter().await.map_err(|e| {
            warn!(error = %e, "BlueZ adapter unavailable");
            ScanError::RadioUnavailable {
                kind: RadioKind::Ble,
            }
        })?;
        let powered = Arc::new(AtomicBool::new(adapter.is_powered().await.unwrap_or(false)));
        info!(
            adapter = %adapter.name(),
            powered = powered.load(Ordering::SeqCst),
            "BlueZ adapter opened"
        );

        let watcher = CancellationToken::new();
        match adapter.events().await {
            Ok(events) => {
                tokio::spawn(watch_power(events, Arc::clone(&powered), watcher.clone()));
            }
            Err(e) => warn!(error = %e, "Adapter power changes will not be tracked"),
        }

        Ok(Self {
            _session: session,
            adapter,
            powered,
            running: Mutex::new(None),
            _watcher: watcher.drop_guard(),
        })
    }

    async fn sighting(
        adapter: &Adapter,
        address: Address,
        rssi: Option<i16>,
    ) -> Option<RawSighting> {
        let device = adapter.device(address).ok()?;
        let rssi = match rssi {
            Some(rssi) => rssi,
            None => device.rssi().await.ok().flatten()?,
        };
        let name = device.name().await.ok().flatten();
        Some(RawSighting::ble(address.to_string(), name.as_deref(), rssi))
    }
}

#[async_trait]
impl ScanSource for BluezScanSource {
    fn kind(&self) -> RadioKind {
        RadioKind::Ble
    }

    fn is_radio_enabled(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    async fn start_scan(&self) -> ScanResult<mpsc::Receiver<RawScanEvent>> {
        let powered = self.adapter.is_powered().await.map_err(|e| scan_error(&e))?;
        self.powered.store(powered, Ordering::SeqCst);
        if !powered {
            return Err(ScanError::RadioDisabled {
                kind: RadioKind::Ble,
            });
        }

        let mut discovery = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| scan_error(&e))?;

        let (tx, rx) = mpsc::channel(DEFAULT_SCAN_BUFFER);
        let cancel = CancellationToken::new();
        if let Some(previous) = self.running.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            let mut device_events: SelectAll<DeviceEvents> = SelectAll::new();
            loop {
                let sighting = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = discovery.next() => match event {
                        Some(AdapterEvent::DeviceAdded(address)) => {
                            if let Ok(device) = adapter.device(address) {
                                if let Ok(events) = device.events().await {
                                    device_events.push(Box::pin(events.map(move |e| (address, e))));
                                }
                            }
                            Self::sighting(&adapter, address, None).await
                        }
                        Some(_) => None,
                        None => break,
                    },
                    Some((address, event)) = device_events.next(), if !device_events.is_empty() => {
                        match event {
                            DeviceEvent::PropertyChanged(DeviceProperty::Rssi(rssi)) => {
                                Self::sighting(&adapter, address, Some(rssi)).await
                            }
                            _ => None,
                        }
                    }
                };

                if let Some(sighting) = sighting {
                    if tx.send(RawScanEvent::single(sighting)).await.is_err() {
                        break;
                    }
                }
            }
            // Dropping the discovery stream ends the adapter's discovery session.
            debug!("BlueZ discovery stopped");
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

/// Power state carried by an adapter event, if any.
const fn power_change(event: &AdapterEvent) -> Option<bool> {
    match event {
        AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => Some(*powered),
        _ => None,
    }
}

/// Keep `powered` in step with the adapter until cancelled.
async fn watch_power(
    events: impl Stream<Item = AdapterEvent> + Send,
    powered: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    tokio::pin!(events);
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if let Some(on) = power_change(&event) {
            info!(powered = on, "Adapter power changed");
            powered.store(on, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// GATT
// =============================================================================

/// GATT central backed by the default BlueZ adapter.
pub struct BluezCentral {
    _session: bluer::Session,
    adapter: Adapter,
}

impl BluezCentral {
    /// Connect to BlueZ and open the default adapter.
    ///
    /// # Errors
    ///
    /// Returns `Adapter` when there is no D-Bus session or adapter.
    pub async fn new() -> SessionResult<Self> {
        let (session, adapter) = open_adapter()
            .await
            .map_err(|e| SessionError::Adapter(e.to_string()))?;
        Ok(Self {
            _session: session,
            adapter,
        })
    }
}

#[async_trait]
impl GattCentral for BluezCentral {
    async fn resolve_peer(&self, identifier: &str) -> SessionResult<Option<Arc<dyn GattPeer>>> {
        if !is_valid_mac_address(identifier) {
            return Ok(None);
        }
        let Ok(address) = identifier.parse::<Address>() else {
            return Ok(None);
        };
        let known = self
            .adapter
            .device_addresses()
            .await
            .map_err(|e| SessionError::Adapter(e.to_string()))?;
        if !known.contains(&address) {
            return Ok(None);
        }
        let device = self
            .adapter
            .device(address)
            .map_err(|e| SessionError::Adapter(e.to_string()))?;
        Ok(Some(Arc::new(BluezPeer::new(identifier, device))))
    }
}

/// A BlueZ device as a GATT peer.
pub struct BluezPeer {
    identifier: String,
    device: Device,
    link: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    cancel: Mutex<CancellationToken>,
}

impl BluezPeer {
    fn new(identifier: &str, device: Device) -> Self {
        Self {
            identifier: identifier.to_string(),
            device,
            link: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> SessionResult<Characteristic> {
        let fail = |e: bluer::Error| SessionError::DiscoveryFailed(e.to_string());
        for remote in self.device.services().await.map_err(fail)? {
            if remote.uuid().await.map_err(fail)? != service {
                continue;
            }
            for candidate in remote.characteristics().await.map_err(fail)? {
                if candidate.uuid().await.map_err(fail)? == characteristic {
                    return Ok(candidate);
                }
            }
        }
        Err(SessionError::DiscoveryFailed(format!(
            "characteristic {characteristic} not found"
        )))
    }
}

#[async_trait]
impl GattPeer for BluezPeer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn connect(&self) -> SessionResult<mpsc::Receiver<LinkEvent>> {
        let mut events = self
            .device
            .events()
            .await
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;
        self.device
            .connect()
            .await
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(LINK_CAPACITY);
        let _ = tx.try_send(LinkEvent::Established);
        *self.link.lock() = Some(tx.clone());

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        let identifier = self.identifier.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) | None => {
                            info!(%identifier, "BlueZ link lost");
                            let _ = tx.send(LinkEvent::Lost).await;
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn discover_services(&self) -> SessionResult<Vec<DiscoveredService>> {
        let fail = |e: bluer::Error| SessionError::DiscoveryFailed(e.to_string());
        let mut discovered = Vec::new();
        for service in self.device.services().await.map_err(fail)? {
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await.map_err(fail)? {
                let flags = characteristic.flags().await.map_err(fail)?;
                characteristics.push(DiscoveredCharacteristic {
                    uuid: characteristic.uuid().await.map_err(fail)?,
                    notify: flags.notify,
                    write: flags.write || flags.write_without_response,
                });
            }
            discovered.push(DiscoveredService {
                uuid: service.uuid().await.map_err(fail)?,
                characteristics,
            });
        }
        Ok(discovered)
    }

    async fn enable_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> SessionResult<()> {
        let remote = self.characteristic(service, characteristic).await?;
        let mut values = remote
            .notify()
            .await
            .map_err(|e| SessionError::DiscoveryFailed(e.to_string()))?;
        let Some(tx) = self.link.lock().clone() else {
            return Err(SessionError::NotConnected);
        };
        debug!(%characteristic, %descriptor, "Notifications enabled");

        let cancel = self.cancel.lock().clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    value = values.next() => {
                        let Some(value) = value else { break };
                        let event = LinkEvent::Notification { characteristic, value };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> SessionResult<()> {
        let remote = self.characteristic(service, characteristic).await?;
        remote
            .write(value)
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&self) -> SessionResult<()> {
        self.cancel.lock().cancel();
        *self.link.lock() = None;
        match self.device.disconnect().await {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind, ErrorKind::NotConnected) => Ok(()),
            Err(e) => Err(SessionError::Adapter(e.to_string())),
        }
    }
}
