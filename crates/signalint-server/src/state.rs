//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use signalint_core::export::ExportSink;
use signalint_core::platform::simulated::{
    SimulatedCentral, SimulatedPeer, SimulatedScanSource, DEMO_PEER,
};
use signalint_core::store::{AliasStore, ObservationStore};
use signalint_core::{
    Config, DirectorySink, GattCentral, MemoryAliasStore, MemoryObservationStore, Radio,
    RadioBackend, RadioKind, RadioOptions, RadioParts, ScanSource, SessionManager, StorageLayout,
};
use tracing::info;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    ble: Radio,
    wifi: Radio,
    session: SessionManager,
}

struct Backends {
    ble: Arc<dyn ScanSource>,
    wifi: Arc<dyn ScanSource>,
    central: Arc<dyn GattCentral>,
}

impl AppState {
    /// Build the state described by `config`. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a store cannot be opened or the configured
    /// backend is unavailable.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let backends = backends(&config).await?;
        let sink: Arc<dyn ExportSink> = Arc::new(DirectorySink::new(config.export_dir()));
        let options = RadioOptions {
            roster: config.roster_options(),
            export: config.export_options(),
            scan_buffer: config.scan.buffer,
        };

        let layout = StorageLayout::new(&config.storage.data_dir);
        let radio = |kind: RadioKind, source: Arc<dyn ScanSource>| -> anyhow::Result<Radio> {
            let (log, aliases): (Arc<dyn ObservationStore>, Arc<dyn AliasStore>) =
                if config.storage.in_memory {
                    (
                        Arc::new(MemoryObservationStore::new()),
                        Arc::new(MemoryAliasStore::new()),
                    )
                } else {
                    (
                        Arc::new(layout.open_observation_log(kind)?),
                        Arc::new(layout.open_aliases(kind)?),
                    )
                };
            Ok(Radio::new(
                RadioParts {
                    source,
                    log,
                    aliases,
                    sink: Arc::clone(&sink),
                },
                options,
            ))
        };

        let ble = radio(RadioKind::Ble, backends.ble)?;
        let wifi = radio(RadioKind::Wifi, backends.wifi)?;
        let session = SessionManager::new(backends.central, config.session_options());

        info!(
            backend = ?config.scan.backend,
            in_memory = config.storage.in_memory,
            data_dir = %config.storage.data_dir.display(),
            "Application state ready"
        );
        Ok(Self::from_parts(config, ble, wifi, session))
    }

    /// Assemble state from already built parts.
    #[must_use]
    pub fn from_parts(config: Config, ble: Radio, wifi: Radio, session: SessionManager) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                ble,
                wifi,
                session,
            }),
        }
    }

    /// Configuration the state was built from.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The radio for `kind`.
    #[must_use]
    pub fn radio(&self, kind: RadioKind) -> &Radio {
        match kind {
            RadioKind::Ble => &self.inner.ble,
            RadioKind::Wifi => &self.inner.wifi,
        }
    }

    /// The connection session.
    #[must_use]
    pub fn session(&self) -> &SessionManager {
        &self.inner.session
    }
}

async fn backends(config: &Config) -> anyhow::Result<Backends> {
    match config.scan.backend {
        RadioBackend::Simulated => {
            let interval = Duration::from_millis(config.scan.simulated_interval_ms);
            let peer = SimulatedPeer::echo(DEMO_PEER).with_profile(config.session.profile());
            info!(peer = DEMO_PEER, "Using simulated radios");
            Ok(Backends {
                ble: Arc::new(SimulatedScanSource::demo(RadioKind::Ble, interval)),
                wifi: Arc::new(SimulatedScanSource::demo(RadioKind::Wifi, interval)),
                central: Arc::new(SimulatedCentral::new().with_peer(Arc::new(peer))),
            })
        }
        RadioBackend::Bluez => bluez_backends().await,
    }
}

#[cfg(feature = "bluetooth")]
async fn bluez_backends() -> anyhow::Result<Backends> {
    use signalint_core::platform::bluez::{BluezCentral, BluezScanSource};
    use signalint_core::platform::UnavailableScanSource;

    info!("Using BlueZ radios");
    Ok(Backends {
        ble: Arc::new(BluezScanSource::new().await?),
        wifi: Arc::new(UnavailableScanSource::new(RadioKind::Wifi)),
        central: Arc::new(BluezCentral::new().await?),
    })
}

#[cfg(not(feature = "bluetooth"))]
#[allow(clippy::unused_async)]
async fn bluez_backends() -> anyhow::Result<Backends> {
    anyhow::bail!("scan.backend = \"bluez\" requires building with the `bluetooth` feature")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_in_memory_state() {
        let mut config = Config::default();
        config.storage.in_memory = true;
        let state = AppState::new(config).await.unwrap();

        assert_eq!(state.radio(RadioKind::Ble).kind(), RadioKind::Ble);
        assert_eq!(state.radio(RadioKind::Wifi).kind(), RadioKind::Wifi);
        assert!(state.radio(RadioKind::Ble).observations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_state_creates_stores() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let state = AppState::new(config).await.unwrap();

        state.radio(RadioKind::Wifi).rename("00:11", "AP").unwrap();
        assert_eq!(state.radio(RadioKind::Wifi).aliases().unwrap().len(), 1);
        assert!(state.radio(RadioKind::Ble).aliases().unwrap().is_empty());
    }

    #[cfg(not(feature = "bluetooth"))]
    #[tokio::test]
    async fn test_bluez_backend_needs_feature() {
        let mut config = Config::default();
        config.storage.in_memory = true;
        config.scan.backend = RadioBackend::Bluez;
        assert!(AppState::new(config).await.is_err());
    }
}
