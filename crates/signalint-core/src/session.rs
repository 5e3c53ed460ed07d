//! Connection session state machine.
//!
//! A [`SessionManager`] owns at most one live point-to-point connection. It
//! drives the lifecycle connect, service discovery, notification subscription,
//! message exchange and teardown through an explicit [`ConnectionState`]
//! machine.
//!
//! ```text
//!                connect            link established
//! Disconnected ----------> Connecting ----------------> Connected
//!      ^  |                    |                            |
//!      |  | peer not found     | connect failed / timeout   | link lost,
//!      |  v                    v                            | disconnect
//!      +---- Error(reason) <---+                            |
//!      ^         (transient)                                |
//!      +----------------------------------------------------+
//! ```
//!
//! Every transition is published on a broadcast channel, including the
//! transient `Error`, and the current state on a watch channel. Events from a
//! torn-down session are recognised by a generation counter and ignored.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::types::SessionMessage;

/// State reason when the requested identifier cannot be resolved.
pub const REASON_DEVICE_NOT_FOUND: &str = "device not found";

/// State reason when the link is not established in time.
pub const REASON_CONNECT_TIMEOUT: &str = "connection timed out";

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

const TRANSITION_CAPACITY: usize = 64;
const MESSAGE_CAPACITY: usize = 256;

/// Errors raised by sessions and GATT backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No peer is known under the identifier.
    #[error("Device not found: {identifier}")]
    PeerNotFound {
        /// Identifier that was requested.
        identifier: String,
    },

    /// The platform connect call failed.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The link was not established within the connect timeout.
    #[error("connection timed out")]
    ConnectTimeout,

    /// The link dropped.
    #[error("Link lost")]
    LinkLost,

    /// Services or characteristics could not be discovered or subscribed.
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    /// A characteristic write failed.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The operation needs a connected session.
    #[error("Not connected")]
    NotConnected,

    /// The platform adapter reported an error.
    #[error("Adapter error: {0}")]
    Adapter(String),
}

/// Result type for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Connection lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session. Initial and terminal state.
    Disconnected,
    /// Waiting for the link.
    Connecting,
    /// Link established.
    Connected,
    /// A failure, immediately followed by `Disconnected`.
    Error(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A connect was requested for a resolved peer.
    ConnectRequested,
    /// The platform reported the link up.
    LinkEstablished,
    /// Connecting failed (including an unresolvable peer).
    Failed(String),
    /// The platform reported the link down.
    LinkLost,
    /// The owner asked to disconnect.
    DisconnectRequested,
    /// Leave the transient error state.
    Settle,
}

impl ConnectionState {
    /// State after `event`, or `None` if the event does not apply here.
    #[must_use]
    pub fn next(&self, event: &SessionEvent) -> Option<Self> {
        use ConnectionState as S;
        use SessionEvent as E;

        match (self, event) {
            (S::Disconnected, E::ConnectRequested) => Some(S::Connecting),
            (S::Connecting, E::LinkEstablished) => Some(S::Connected),
            (S::Disconnected | S::Connecting, E::Failed(reason)) => Some(S::Error(reason.clone())),
            (S::Connecting | S::Connected | S::Error(_), E::LinkLost | E::DisconnectRequested)
            | (S::Error(_), E::Settle) => Some(S::Disconnected),
            _ => None,
        }
    }
}

/// GATT identifiers used for the message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattProfile {
    /// Service carrying both characteristics.
    pub service: Uuid,
    /// Characteristic notifications arrive on.
    pub read_characteristic: Uuid,
    /// Characteristic outgoing messages are written to.
    pub write_characteristic: Uuid,
    /// Client characteristic configuration descriptor.
    pub notify_descriptor: Uuid,
}

impl GattProfile {
    /// Expand a 16-bit Bluetooth SIG UUID.
    #[must_use]
    pub const fn short_uuid(short: u16) -> Uuid {
        Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
    }
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: Self::short_uuid(0xffe0),
            read_characteristic: Self::short_uuid(0xffe1),
            write_characteristic: Self::short_uuid(0xffe2),
            notify_descriptor: Self::short_uuid(0x2902),
        }
    }
}

/// A characteristic found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Supports notifications.
    pub notify: bool,
    /// Supports writes.
    pub write: bool,
}

/// A service found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics of the service.
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Event reported by a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link is up.
    Established,
    /// The link went down.
    Lost,
    /// A characteristic value notification.
    Notification {
        /// Characteristic that notified.
        characteristic: Uuid,
        /// Raw value.
        value: Vec<u8>,
    },
}

/// Platform GATT client used to look up peers.
#[async_trait]
pub trait GattCentral: Send + Sync {
    /// Resolve an identifier to a peer. `Ok(None)` if it is unknown.
    async fn resolve_peer(&self, identifier: &str) -> SessionResult<Option<Arc<dyn GattPeer>>>;
}

/// A remote GATT peripheral.
#[async_trait]
pub trait GattPeer: Send + Sync {
    /// Hardware address of the peer.
    fn identifier(&self) -> &str;

    /// Open the link. Link events arrive on the returned channel; the channel
    /// closing counts as a lost link.
    async fn connect(&self) -> SessionResult<mpsc::Receiver<LinkEvent>>;

    /// Discover the peer's services.
    async fn discover_services(&self) -> SessionResult<Vec<DiscoveredService>>;

    /// Enable notifications by writing the descriptor of a characteristic.
    async fn enable_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> SessionResult<()>;

    /// Write a characteristic value.
    async fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> SessionResult<()>;

    /// Close the link and release the platform handle.
    async fn disconnect(&self) -> SessionResult<()>;
}

/// Whether messages can be exchanged on the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum DataChannel {
    /// No link.
    Closed,
    /// Discovery in progress.
    Discovering,
    /// Notifications enabled and the write characteristic resolved.
    Ready,
    /// Connected, but discovery failed. Messages cannot be sent.
    Unavailable(String),
}

/// Options for a [`SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// GATT identifiers of the message channel.
    pub profile: GattProfile,
    /// Give up on a connect that does not establish a link in time.
    pub connect_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            profile: GattProfile::default(),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }
}

/// The live session. It is registered before the platform connect is awaited
/// so that a disconnect can cancel a pending connect.
struct LiveSession {
    peer: Arc<dyn GattPeer>,
    cancel: CancellationToken,
    generation: u64,
    _driver: Option<JoinHandle<()>>,
}

struct SessionShared {
    options: SessionOptions,
    generation: AtomicU64,
    shutdown: CancellationToken,
    live: Mutex<Option<LiveSession>>,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    data_channel: watch::Sender<DataChannel>,
    peer_identifier: RwLock<Option<String>>,
    messages: RwLock<Vec<SessionMessage>>,
    message_events: broadcast::Sender<SessionMessage>,
}

impl SessionShared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Apply `event`. With a generation, the event is dropped if that
    /// session has been torn down.
    fn apply(&self, generation: Option<u64>, event: &SessionEvent) -> bool {
        let mut entered = None;
        self.state.send_if_modified(|state| {
            if generation.is_some_and(|g| !self.is_current(g)) {
                return false;
            }
            match state.next(event) {
                Some(next) => {
                    *state = next.clone();
                    entered = Some(next);
                    true
                }
                None => false,
            }
        });

        let Some(next) = entered else {
            if generation.is_some_and(|g| !self.is_current(g)) {
                debug!(?event, "Ignoring event from a previous session");
            }
            return false;
        };
        info!(state = %next, "Session state changed");
        if next == ConnectionState::Disconnected {
            *self.peer_identifier.write() = None;
            self.data_channel.send_replace(DataChannel::Closed);
        }
        let _ = self.transitions.send(next);
        true
    }

    /// Pass through the transient error state back to `Disconnected`.
    fn fail(&self, generation: Option<u64>, reason: &str) {
        if self.apply(generation, &SessionEvent::Failed(reason.to_string())) {
            self.apply(generation, &SessionEvent::Settle);
        }
    }

    fn set_data_channel(&self, generation: u64, channel: DataChannel) {
        self.data_channel.send_if_modified(|current| {
            if !self.is_current(generation) || *current == channel {
                return false;
            }
            *current = channel;
            true
        });
    }

    fn record(&self, message: SessionMessage) {
        self.messages.write().push(message.clone());
        let _ = self.message_events.send(message);
    }

    fn receive(&self, generation: u64, characteristic: Uuid, value: &[u8]) {
        if !self.is_current(generation) || *self.state.borrow() != ConnectionState::Connected {
            debug!(%characteristic, "Dropping notification outside a connected session");
            return;
        }
        if characteristic != self.options.profile.read_characteristic {
            debug!(%characteristic, "Ignoring notification from unrelated characteristic");
            return;
        }
        let text = String::from_utf8_lossy(value).into_owned();
        debug!(bytes = value.len(), "Message received");
        self.record(SessionMessage {
            text,
            at: Utc::now(),
            sent: false,
        });
    }

    async fn discover(&self, peer: &dyn GattPeer) -> SessionResult<()> {
        let profile = self.options.profile;
        let services = peer.discover_services().await?;
        let service = services
            .iter()
            .find(|s| s.uuid == profile.service)
            .ok_or_else(|| {
                SessionError::DiscoveryFailed(format!("service {} not found", profile.service))
            })?;

        let find = |uuid: Uuid| {
            service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .ok_or_else(|| {
                    SessionError::DiscoveryFailed(format!("characteristic {uuid} not found"))
                })
        };
        let read = find(profile.read_characteristic)?;
        if !read.notify {
            return Err(SessionError::DiscoveryFailed(format!(
                "characteristic {} does not notify",
                read.uuid
            )));
        }
        peer.enable_notifications(profile.service, read.uuid, profile.notify_descriptor)
            .await?;

        let write = find(profile.write_characteristic)?;
        if !write.write {
            return Err(SessionError::DiscoveryFailed(format!(
                "characteristic {} is not writable",
                write.uuid
            )));
        }
        Ok(())
    }

    /// Remove the live session if it still belongs to `generation`.
    async fn detach(&self, generation: u64) -> bool {
        let mut live = self.live.lock().await;
        if live.as_ref().is_some_and(|session| session.generation == generation) {
            live.take();
            true
        } else {
            false
        }
    }

    async fn teardown(&self, live: LiveSession) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        live.cancel.cancel();
        if let Err(e) = live.peer.disconnect().await {
            warn!(identifier = %live.peer.identifier(), error = %e, "Error releasing peer");
        }
        self.apply(None, &SessionEvent::DisconnectRequested);
    }
}

/// Owner of the single connection session.
///
/// Dropping the manager tears down any live session.
pub struct SessionManager {
    central: Arc<dyn GattCentral>,
    shared: Arc<SessionShared>,
}

impl SessionManager {
    /// Create a manager using `central` to reach peers.
    pub fn new(central: Arc<dyn GattCentral>, options: SessionOptions) -> Self {
        Self {
            central,
            shared: Arc::new(SessionShared {
                options,
                generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                live: Mutex::new(None),
                state: watch::channel(ConnectionState::Disconnected).0,
                transitions: broadcast::channel(TRANSITION_CAPACITY).0,
                data_channel: watch::channel(DataChannel::Closed).0,
                peer_identifier: RwLock::new(None),
                messages: RwLock::new(Vec::new()),
                message_events: broadcast::channel(MESSAGE_CAPACITY).0,
            }),
        }
    }

    /// Connect to `identifier`, first tearing down any live session.
    ///
    /// Returns once the platform connect has been issued; the session then
    /// moves to `Connected` when the link comes up. A [`disconnect`] while
    /// the platform connect is pending abandons it.
    ///
    /// [`disconnect`]: Self::disconnect
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PeerNotFound`] for an unknown identifier, or the
    /// platform error if connecting fails. The state passes through `Error`
    /// back to `Disconnected` in both cases. Returns
    /// [`SessionError::ConnectFailed`] if the attempt was abandoned.
    pub async fn connect(&self, identifier: &str) -> SessionResult<()> {
        let (generation, peer, cancel) = {
            let mut live = self.shared.live.lock().await;
            if let Some(previous) = live.take() {
                info!(identifier = %previous.peer.identifier(), "Replacing live session");
                self.shared.teardown(previous).await;
            }
            self.shared.apply(None, &SessionEvent::DisconnectRequested);

            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.shared.messages.write().clear();

            let peer = match self.central.resolve_peer(identifier).await {
                Ok(Some(peer)) => peer,
                Ok(None) => {
                    warn!(%identifier, "Peer not found");
                    self.shared.fail(Some(generation), REASON_DEVICE_NOT_FOUND);
                    return Err(SessionError::PeerNotFound {
                        identifier: identifier.to_string(),
                    });
                }
                Err(e) => {
                    warn!(%identifier, error = %e, "Peer lookup failed");
                    self.shared.fail(Some(generation), &e.to_string());
                    return Err(e);
                }
            };

            *self.shared.peer_identifier.write() = Some(identifier.to_string());
            self.shared.apply(Some(generation), &SessionEvent::ConnectRequested);
            info!(%identifier, "Connecting");

            let cancel = self.shared.shutdown.child_token();
            *live = Some(LiveSession {
                peer: Arc::clone(&peer),
                cancel: cancel.clone(),
                generation,
                _driver: None,
            });
            (generation, peer, cancel)
        };

        let deadline = self
            .shared
            .options
            .connect_timeout
            .map(|timeout| Instant::now() + timeout);
        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(%identifier, "Pending connect abandoned");
                return Err(abandoned());
            }
            opened = open_link(peer.as_ref(), deadline) => opened,
        };

        let events = match opened {
            Ok(events) => events,
            Err(e) => {
                warn!(%identifier, error = %e, "Connect failed");
                if self.shared.detach(generation).await {
                    if let Err(release) = peer.disconnect().await {
                        debug!(%identifier, error = %release, "Error releasing peer after failed connect");
                    }
                    let reason = match &e {
                        SessionError::ConnectTimeout => REASON_CONNECT_TIMEOUT.to_string(),
                        other => other.to_string(),
                    };
                    self.shared.fail(Some(generation), &reason);
                }
                return Err(e);
            }
        };

        let mut live = self.shared.live.lock().await;
        match live.as_mut() {
            Some(session) if session.generation == generation => {
                session._driver = Some(tokio::spawn(drive(
                    Arc::clone(&self.shared),
                    generation,
                    peer,
                    events,
                    cancel,
                    deadline,
                )));
                Ok(())
            }
            _ => {
                debug!(%identifier, "Session torn down while connecting");
                Err(abandoned())
            }
        }
    }

    /// Tear down the session. Does nothing when already disconnected.
    ///
    /// A pending connect is abandoned immediately.
    pub async fn disconnect(&self) {
        let mut live = self.shared.live.lock().await;
        match live.take() {
            Some(session) => {
                info!(identifier = %session.peer.identifier(), "Disconnecting");
                self.shared.teardown(session).await;
            }
            None => {
                self.shared.apply(None, &SessionEvent::DisconnectRequested);
            }
        }
    }

    /// Send `text` to the peer.
    ///
    /// Returns `false` unless connected with a ready data channel and the
    /// write succeeds. Sent messages are appended to the history.
    pub async fn send_message(&self, text: &str) -> bool {
        let live = self.shared.live.lock().await;
        let Some(session) = live.as_ref() else {
            debug!("Send attempted without a session");
            return false;
        };
        if *self.shared.state.borrow() != ConnectionState::Connected
            || *self.shared.data_channel.borrow() != DataChannel::Ready
        {
            debug!("Send attempted without a ready data channel");
            return false;
        }

        let profile = self.shared.options.profile;
        match session
            .peer
            .write(profile.service, profile.write_characteristic, text.as_bytes())
            .await
        {
            Ok(()) => {
                self.shared.record(SessionMessage {
                    text: text.to_string(),
                    at: Utc::now(),
                    sent: true,
                });
                true
            }
            Err(e) => {
                warn!(error = %e, "Message write failed");
                false
            }
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Subscribe to the current state.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to every transition, including transient errors.
    #[must_use]
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.transitions.subscribe()
    }

    /// Message history of the current session, in order.
    #[must_use]
    pub fn messages(&self) -> Vec<SessionMessage> {
        self.shared.messages.read().clone()
    }

    /// Subscribe to new messages, both sent and received.
    #[must_use]
    pub fn subscribe_messages(&self) -> broadcast::Receiver<SessionMessage> {
        self.shared.message_events.subscribe()
    }

    /// Identifier of the peer while a session is live.
    #[must_use]
    pub fn peer_identifier(&self) -> Option<String> {
        self.shared.peer_identifier.read().clone()
    }

    /// Current data channel status.
    #[must_use]
    pub fn data_channel(&self) -> DataChannel {
        self.shared.data_channel.borrow().clone()
    }

    /// Subscribe to data channel changes.
    #[must_use]
    pub fn subscribe_data_channel(&self) -> watch::Receiver<DataChannel> {
        self.shared.data_channel.subscribe()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.shutdown.cancel();
        let Some(live) = self
            .shared
            .live
            .try_lock()
            .ok()
            .and_then(|mut live| live.take())
        else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            handle.spawn(async move { shared.teardown(live).await });
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &*self.shared.state.borrow())
            .field("peer", &*self.shared.peer_identifier.read())
            .finish_non_exhaustive()
    }
}

fn abandoned() -> SessionError {
    SessionError::ConnectFailed("connection abandoned".to_string())
}

/// Issue the platform connect, bounded by `deadline`.
async fn open_link(
    peer: &dyn GattPeer,
    deadline: Option<Instant>,
) -> SessionResult<mpsc::Receiver<LinkEvent>> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, peer.connect())
            .await
            .unwrap_or(Err(SessionError::ConnectTimeout)),
        None => peer.connect().await,
    }
}

/// Release the peer after the driver ended the session on its own.
async fn release(shared: &SessionShared, generation: u64, peer: &dyn GattPeer) -> bool {
    if !shared.detach(generation).await {
        return false;
    }
    if let Err(e) = peer.disconnect().await {
        debug!(identifier = %peer.identifier(), error = %e, "Error releasing peer");
    }
    true
}

async fn drive(
    shared: Arc<SessionShared>,
    generation: u64,
    peer: Arc<dyn GattPeer>,
    mut events: mpsc::Receiver<LinkEvent>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
) {
    let expiry = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));
    tokio::pin!(expiry);
    let mut established = false;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = &mut expiry, if deadline.is_some() && !established => {
                warn!(identifier = %peer.identifier(), "Connection timed out");
                if release(&shared, generation, peer.as_ref()).await {
                    shared.fail(Some(generation), REASON_CONNECT_TIMEOUT);
                }
                break;
            }
            event = events.recv() => match event {
                Some(LinkEvent::Established) => {
                    if established {
                        continue;
                    }
                    established = true;
                    if !shared.apply(Some(generation), &SessionEvent::LinkEstablished) {
                        break;
                    }
                    shared.set_data_channel(generation, DataChannel::Discovering);

                    let outcome = tokio::select! {
                        biased;
                        () = cancel.cancelled() => None,
                        result = shared.discover(peer.as_ref()) => Some(result),
                    };
                    match outcome {
                        None => break,
                        Some(Ok(())) => {
                            info!(identifier = %peer.identifier(), "Data channel ready");
                            shared.set_data_channel(generation, DataChannel::Ready);
                        }
                        Some(Err(e)) => {
                            warn!(identifier = %peer.identifier(), error = %e, "Discovery failed, session degraded");
                            shared.set_data_channel(generation, DataChannel::Unavailable(e.to_string()));
                        }
                    }
                }
                Some(LinkEvent::Notification { characteristic, value }) => {
                    shared.receive(generation, characteristic, &value);
                }
                Some(LinkEvent::Lost) | None => {
                    info!(identifier = %peer.identifier(), "Link lost");
                    if release(&shared, generation, peer.as_ref()).await {
                        shared.apply(Some(generation), &SessionEvent::LinkLost);
                    }
                    break;
                }
            }
        }
    }
    debug!(generation, "Session driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::simulated::{SimulatedCentral, SimulatedPeer};

    const PEER: &str = "AA:BB:CC:DD:EE:01";

    fn manager(peer: &Arc<SimulatedPeer>) -> SessionManager {
        let central = SimulatedCentral::new().with_peer(Arc::clone(peer));
        SessionManager::new(Arc::new(central), SessionOptions::default())
    }

    async fn wait_for(manager: &SessionManager, state: ConnectionState) {
        let mut rx = manager.subscribe_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    fn drain(rx: &mut broadcast::Receiver<ConnectionState>) -> Vec<ConnectionState> {
        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state);
        }
        seen
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState as S;
        use SessionEvent as E;

        assert_eq!(S::Disconnected.next(&E::ConnectRequested), Some(S::Connecting));
        assert_eq!(S::Connecting.next(&E::LinkEstablished), Some(S::Connected));
        assert_eq!(
            S::Connecting.next(&E::Failed("boom".into())),
            Some(S::Error("boom".into()))
        );
        assert_eq!(S::Error("boom".into()).next(&E::Settle), Some(S::Disconnected));
        assert_eq!(S::Connected.next(&E::LinkLost), Some(S::Disconnected));
        assert_eq!(S::Connecting.next(&E::DisconnectRequested), Some(S::Disconnected));

        assert_eq!(S::Disconnected.next(&E::DisconnectRequested), None);
        assert_eq!(S::Disconnected.next(&E::LinkEstablished), None);
        assert_eq!(S::Connected.next(&E::ConnectRequested), None);
        assert_eq!(S::Connected.next(&E::Settle), None);
    }

    #[test]
    fn test_default_profile_uuids() {
        let profile = GattProfile::default();
        assert_eq!(
            profile.service.to_string(),
            "0000ffe0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            profile.notify_descriptor.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_state_json_shape() {
        let json = serde_json::to_string(&ConnectionState::Error("boom".into())).unwrap();
        assert_eq!(json, r#"{"state":"error","reason":"boom"}"#);
        let json = serde_json::to_string(&ConnectionState::Connected).unwrap();
        assert_eq!(json, r#"{"state":"connected"}"#);
    }

    #[tokio::test]
    async fn test_connect_visits_connecting_then_connected() {
        let peer = Arc::new(SimulatedPeer::echo(PEER));
        let manager = manager(&peer);
        let mut transitions = manager.transitions();

        manager.connect(PEER).await.unwrap();
        let mut channel = manager.subscribe_data_channel();
        channel.wait_for(|c| *c == DataChannel::Ready).await.unwrap();

        assert_eq!(
            drain(&mut transitions),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(manager.peer_identifier().as_deref(), Some(PEER));
        assert_eq!(peer.notifications_enabled(), 1);
    }

    #[tokio::test]
    async fn test_unknown_peer_errors_without_connecting() {
        let peer = Arc::new(SimulatedPeer::echo(PEER));
        let manager = manager(&peer);
        let mut transitions = manager.transitions();

        let err = manager.connect("00:00:00:00:00:00").await.unwrap_err();
        assert!(matches!(err, SessionError::PeerNotFound { .. }));
        assert_eq!(
            drain(&mut transitions),
            vec![
                ConnectionState::Error(REASON_DEVICE_NOT_FOUND.into()),
                ConnectionState::Disconnected
            ]
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_settles_to_disconnected() {
        let peer = Arc::new(
            SimulatedPeer::echo(PEER).with_connect_error(SessionError::ConnectFailed("busy".into())),
        );
        let manager = manager(&peer);
        let mut transitions = manager.transitions();

        assert!(manager.connect(PEER).await.is_err());
        let seen = drain(&mut transitions);
        assert_eq!(seen.first(), Some(&ConnectionState::Connecting));
        assert!(matches!(&seen[1], ConnectionState::Error(reason) if reason.contains("busy")));
        assert_eq!(seen.last(), Some(&ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_round_trip_messages() {
        let peer = Arc::new(SimulatedPeer::echo(PEER));
        let manager = manager(&peer);
        manager.connect(PEER).await.unwrap();
        manager
            .subscribe_data_channel()
            .wait_for(|c| *c == DataChannel::Ready)
            .await
            .unwrap();
        let mut inbound = manager.subscribe_messages();

        assert!(manager.send_message("hello").await);
        let sent = inbound.recv().await.unwrap();
        assert!(sent.sent);
        let echoed = inbound.recv().await.unwrap();
        assert!(!echoed.sent);
        assert_eq!(echoed.text, "hello");

        let history = manager.messages();
        assert_eq!(history.len(), 2);
        assert_eq!(peer.writes(), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_notifications_are_decoded_lossily_in_order() {
        let peer = Arc::new(SimulatedPeer::echo(PEER));
        let manager = manager(&peer);
        manager.connect(PEER).await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;
        let mut inbound = manager.subscribe_messages();

        peer.notify(b"one".to_vec());
        peer.notify(vec![0x66, 0xff, 0x6f]);
        peer.notify(b"one".to_vec());

        let mut texts = Vec::new();
        for _ in 0..3 {
            texts.push(inbound.recv().await.unwrap().text);
        }
        assert_eq!(texts, ["one", "f\u{fffd}o", "one"]);
    }

    #[tokio::test]
    async fn test_discovery_failure_leaves_session_degraded() {
        let peer = Arc::new(SimulatedPeer::echo(PEER).with_services(Vec::new()));
        let manager = manager(&peer);
        manager.connect(PEER).await.unwrap();

        let mut channel = manager.subscribe_data_channel();
        channel
            .wait_for(|c| matches!(c, DataChannel::Unavailable(_)))
            .await
            .unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(!manager.send_message("hello").await);
        assert!(peer.writes().is_empty());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let peer = Arc::new(SimulatedPeer::echo(PEER));
        let manager = manager(&peer);
        assert!(!manager.send_message("hello").await);
        assert!(manager.messages().is_empty());
    }

    #[tokio::test]
    async fn test_link_loss_disconnects() {
        let peer = Arc::new(SimulatedPeer::echo(PEER));
        let manager = manager(&peer);
        manager.connect(PEER).await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;

        peer.lose_link();
        wait_for(&manager, ConnectionState::Disconnected).await;
        assert_eq!(manager.peer_identifier(), None);
        assert_eq!(manager.data_channel(), DataChannel::Closed);
    }

    #[tokio::test]
    async fn test_double_disconnect_is_idempotent() {
        let peer = Arc::new(SimulatedPeer::echo(PEER));
        let manager = manager(&peer);
        manager.connect(PEER).await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;
        let mut transitions = manager.transitions();

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(drain(&mut transitions), vec![ConnectionState::Disconnected]);
        assert_eq!(peer.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_tears_down_previous_session() {
        let first = Arc::new(SimulatedPeer::echo(PEER));
        let second = Arc::new(SimulatedPeer::echo("AA:BB:CC:DD:EE:02"));
        let central = SimulatedCentral::new()
            .with_peer(Arc::clone(&first))
            .with_peer(Arc::clone(&second));
        let manager = SessionManager::new(Arc::new(central), SessionOptions::default());

        manager.connect(PEER).await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;
        manager.connect("AA:BB:CC:DD:EE:02").await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;

        assert_eq!(first.disconnect_calls(), 1);
        // Events from the first link no longer affect the session.
        first.lose_link();
        tokio::task::yield_now().await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.peer_identifier().as_deref(), Some("AA:BB:CC:DD:EE:02"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let peer = Arc::new(SimulatedPeer::echo(PEER).never_establish());
        let manager = manager(&peer);
        let mut transitions = manager.transitions();

        manager.connect(PEER).await.unwrap();
        tokio::time::sleep(DEFAULT_CONNECT_TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(
            drain(&mut transitions),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Error(REASON_CONNECT_TIMEOUT.into()),
                ConnectionState::Disconnected
            ]
        );
        assert_eq!(peer.disconnect_calls(), 1);
    }

    /// Peer whose platform connect never returns.
    struct StallingPeer {
        releases: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl GattPeer for StallingPeer {
        fn identifier(&self) -> &str {
            PEER
        }

        async fn connect(&self) -> SessionResult<mpsc::Receiver<LinkEvent>> {
            std::future::pending().await
        }

        async fn discover_services(&self) -> SessionResult<Vec<DiscoveredService>> {
            Ok(Vec::new())
        }

        async fn enable_notifications(&self, _: Uuid, _: Uuid, _: Uuid) -> SessionResult<()> {
            Ok(())
        }

        async fn write(&self, _: Uuid, _: Uuid, _: &[u8]) -> SessionResult<()> {
            Err(SessionError::NotConnected)
        }

        async fn disconnect(&self) -> SessionResult<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StallingCentral(Arc<StallingPeer>);

    #[async_trait]
    impl GattCentral for StallingCentral {
        async fn resolve_peer(&self, _: &str) -> SessionResult<Option<Arc<dyn GattPeer>>> {
            Ok(Some(Arc::clone(&self.0) as Arc<dyn GattPeer>))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_abandons_pending_connect() {
        let peer = Arc::new(StallingPeer {
            releases: std::sync::atomic::AtomicUsize::new(0),
        });
        let manager = Arc::new(SessionManager::new(
            Arc::new(StallingCentral(Arc::clone(&peer))),
            SessionOptions {
                connect_timeout: None,
                ..SessionOptions::default()
            },
        ));

        let connecting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.connect(PEER).await }
        });
        wait_for(&manager, ConnectionState::Connecting).await;

        let disconnected = tokio::time::timeout(Duration::from_secs(1), manager.disconnect()).await;
        assert!(disconnected.is_ok());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(peer.releases.load(Ordering::SeqCst), 1);

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(SessionError::ConnectFailed(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_link_loss_releases_peer_once() {
        let peer = Arc::new(SimulatedPeer::echo(PEER));
        let manager = manager(&peer);
        manager.connect(PEER).await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;

        peer.lose_link();
        wait_for(&manager, ConnectionState::Disconnected).await;
        while peer.disconnect_calls() == 0 {
            tokio::task::yield_now().await;
        }

        let mut transitions = manager.transitions();
        manager.disconnect().await;
        assert_eq!(peer.disconnect_calls(), 1);
        assert!(drain(&mut transitions).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_session_is_not_released_again() {
        let peer = Arc::new(SimulatedPeer::echo(PEER).never_establish());
        let manager = manager(&peer);
        manager.connect(PEER).await.unwrap();
        tokio::time::sleep(DEFAULT_CONNECT_TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(peer.disconnect_calls(), 1);

        manager.disconnect().await;
        assert_eq!(peer.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_peer() {
        let peer = Arc::new(SimulatedPeer::echo(PEER));
        let manager = manager(&peer);
        manager.connect(PEER).await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;

        drop(manager);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(peer.disconnect_calls(), 1);
    }
}
