//! Connection state machine.
//!
//! A connection attempt runs through these stages, any of which can fail:
//!
//! ```text
//! [scan for address] -> establish link -> negotiate MTU -> discover services
//!     -> resolve tx/rx characteristics -> enable notifications -> Ready
//! ```
//!
//! Handles only exist in the `Ready` state of the internal link enum, so a
//! connection that is up but missing a characteristic cannot be
//! represented. Each attempt gets its own cancellation token (a child of the
//! manager's root token); cancelling it stops the scan, the setup sequence,
//! the notification forwarder and any transfer running on the link.
//!
//! Raw state changes from the transport are forwarded to
//! [`observe_connection_state`](ConnectionManager::observe_connection_state)
//! as they happen, independent of whether setup later succeeds.

use crate::ble::{
    BleTransport, CharacteristicHandle, ConnectionState, MtuSize, PeerAddress, ScanResult,
    ServiceHandle, TransportError, DEFAULT_ATT_MTU,
};
use crate::config::LinkConfig;
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

/// Capacity of every event channel the client publishes.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Reasons a connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("scan timed out before {0} was seen")]
    ScanTimeout(PeerAddress),

    #[error("scan ended before {0} was seen")]
    ScanEnded(PeerAddress),

    #[error("link establishment failed: {0}")]
    Link(TransportError),

    #[error("MTU negotiation failed: {0}")]
    Mtu(TransportError),

    #[error("service discovery failed: {0}")]
    Discovery(TransportError),

    #[error("service {0} not found")]
    ServiceNotFound(Uuid),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// The attempt was closed, superseded or lost its link during setup.
    #[error("connection attempt aborted")]
    Aborted,
}

/// Handles of a fully set-up connection.
///
/// Snapshots are cheap to clone and stay internally consistent; once the
/// link is torn down the snapshot's cancellation token is cancelled.
#[derive(Debug, Clone)]
pub struct ConnectedLink<S> {
    peer: PeerAddress,
    session: S,
    service: ServiceHandle,
    tx: CharacteristicHandle,
    rx: CharacteristicHandle,
    mtu: MtuSize,
    cancel: CancellationToken,
}

impl<S> ConnectedLink<S> {
    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn service(&self) -> &ServiceHandle {
        &self.service
    }

    /// Characteristic used for writes.
    pub fn tx(&self) -> &CharacteristicHandle {
        &self.tx
    }

    /// Characteristic used for notifications.
    pub fn rx(&self) -> &CharacteristicHandle {
        &self.rx
    }

    pub fn mtu(&self) -> MtuSize {
        self.mtu
    }

    /// Token cancelled when this link is torn down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Stop signal and exit marker of one attempt's state listener.
#[derive(Clone)]
struct Listener {
    stop: CancellationToken,
    stopped: CancellationToken,
}

impl Listener {
    fn new(parent: &CancellationToken) -> Self {
        Self {
            stop: parent.child_token(),
            stopped: CancellationToken::new(),
        }
    }

    /// Guard held by the listener task; marks it stopped when dropped.
    fn exit_guard(&self) -> DropGuard {
        self.stopped.clone().drop_guard()
    }

    /// Have the listener forward what is already queued, then wait for it
    /// to exit.
    async fn shut_down(&self) {
        self.stop.cancel();
        self.stopped.cancelled().await;
    }
}

enum Link<S> {
    Idle,
    Connecting {
        attempt: u64,
        session: Option<S>,
        cancel: CancellationToken,
        listener: Listener,
    },
    Ready {
        attempt: u64,
        link: ConnectedLink<S>,
        listener: Listener,
    },
}

impl<S> Link<S> {
    fn attempt(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Connecting { attempt, .. } | Self::Ready { attempt, .. } => Some(*attempt),
        }
    }
}

type TeardownHook = Box<dyn Fn() + Send + Sync>;

/// State shared with the background listener task.
struct Shared<T: BleTransport> {
    transport: Arc<T>,
    link: Mutex<Link<T::Session>>,
    state_tx: broadcast::Sender<ConnectionState>,
    teardown_hooks: Mutex<Vec<TeardownHook>>,
}

impl<T: BleTransport> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Link<T::Session>> {
        match self.link.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Link state mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Take the link out if it still belongs to `attempt`.
    fn take_if(&self, attempt: u64) -> Option<Link<T::Session>> {
        let mut link = self.lock();
        if link.attempt() == Some(attempt) {
            Some(std::mem::replace(&mut *link, Link::Idle))
        } else {
            None
        }
    }

    fn run_teardown_hooks(&self) {
        let hooks = match self.teardown_hooks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Teardown hook mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        for hook in hooks.iter() {
            hook();
        }
    }

    /// Run the teardown hooks, cancel everything tied to `link` and release
    /// its session. Hooks run before anything is released.
    async fn teardown(&self, link: Link<T::Session>) -> Option<Listener> {
        let (session, cancel, listener) = match link {
            Link::Idle => return None,
            Link::Connecting {
                session,
                cancel,
                listener,
                ..
            } => (session, cancel, listener),
            Link::Ready { link, listener, .. } => (Some(link.session), link.cancel, listener),
        };
        self.run_teardown_hooks();
        cancel.cancel();
        if let Some(session) = session {
            self.transport.release(&session).await;
        }
        Some(listener)
    }

    /// Tear `link` down and wait for its listener to forward the
    /// transport's final state reports.
    async fn release(&self, link: Link<T::Session>) {
        if let Some(listener) = self.teardown(link).await {
            listener.shut_down().await;
        }
    }

    /// Called from the attempt's own listener, which stops itself afterwards.
    async fn handle_link_loss(&self, attempt: u64) {
        if let Some(link) = self.take_if(attempt) {
            warn!("Link lost, invalidating handles");
            if let Some(listener) = self.teardown(link).await {
                listener.stop.cancel();
            }
        }
    }
}

/// Owns the connection to one peripheral.
pub struct ConnectionManager<T: BleTransport> {
    shared: Arc<Shared<T>>,
    config: LinkConfig,
    attempts: AtomicU64,
    notify_tx: broadcast::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl<T: BleTransport> ConnectionManager<T> {
    /// Create a manager driving `transport` for the peripheral described by `config`.
    pub fn new(transport: Arc<T>, config: LinkConfig) -> Self {
        let (state_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (notify_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                transport,
                link: Mutex::new(Link::Idle),
                state_tx,
                teardown_hooks: Mutex::new(Vec::new()),
            }),
            config,
            attempts: AtomicU64::new(0),
            notify_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }

    /// True once setup completed and until the link is torn down.
    pub fn is_connected(&self) -> bool {
        matches!(*self.shared.lock(), Link::Ready { .. })
    }

    /// Snapshot of the current connection's handles.
    pub fn connected(&self) -> Option<ConnectedLink<T::Session>> {
        match &*self.shared.lock() {
            Link::Ready { link, .. } => Some(link.clone()),
            _ => None,
        }
    }

    /// Register `hook` to run whenever a link is torn down, before its
    /// session is released.
    pub fn on_teardown<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        match self.shared.teardown_hooks.lock() {
            Ok(mut hooks) => hooks.push(Box::new(hook)),
            Err(poisoned) => poisoned.into_inner().push(Box::new(hook)),
        }
    }

    /// Raw link state changes reported by the transport.
    pub fn observe_connection_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Values notified on the rx characteristic.
    pub fn notifications(&self) -> broadcast::Receiver<Vec<u8>> {
        self.notify_tx.subscribe()
    }

    /// Advertisement reports straight from the transport.
    pub fn scan(&self) -> mpsc::Receiver<ScanResult> {
        self.shared.transport.scan()
    }

    /// Connect and report the outcome to `on_result` exactly once.
    pub async fn connect<F>(&self, address: PeerAddress, scan_timeout: Option<Duration>, on_result: F)
    where
        F: FnOnce(bool),
    {
        on_result(self.establish(address, scan_timeout).await.is_ok());
    }

    /// Connect to `address`, replacing any existing connection.
    ///
    /// With `scan_timeout`, the address must first show up in a scan within
    /// that time. On failure the attempt is torn down before returning.
    pub async fn establish(
        &self,
        address: PeerAddress,
        scan_timeout: Option<Duration>,
    ) -> Result<(), ConnectionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.cancel.child_token();
        let listener = Listener::new(&self.cancel);
        let exit_guard = listener.exit_guard();

        let previous = std::mem::replace(
            &mut *self.shared.lock(),
            Link::Connecting {
                attempt,
                session: None,
                cancel: cancel.clone(),
                listener: listener.clone(),
            },
        );
        if previous.attempt().is_some() {
            debug!("Replacing previous connection");
            self.shared.release(previous).await;
        }

        info!("Connecting to {}", address);
        self.spawn_state_listener(&address, attempt, listener.stop, exit_guard);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectionError::Aborted),
            result = self.setup(&address, scan_timeout, attempt) => result,
        };

        match result {
            Ok(()) => {
                info!("Connected to {}", address);
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", address, e);
                if let Some(link) = self.shared.take_if(attempt) {
                    self.shared.release(link).await;
                }
                Err(e)
            }
        }
    }

    /// Cancel everything tied to the current connection and release it.
    ///
    /// Safe to call at any time, including repeatedly.
    pub async fn close_connection(&self) {
        let link = std::mem::replace(&mut *self.shared.lock(), Link::Idle);
        if link.attempt().is_none() {
            debug!("No connection to close");
            return;
        }
        info!("Closing connection");
        self.shared.release(link).await;
    }

    async fn setup(
        &self,
        address: &PeerAddress,
        scan_timeout: Option<Duration>,
        attempt: u64,
    ) -> Result<(), ConnectionError> {
        if let Some(limit) = scan_timeout {
            self.scan_for(address, limit).await?;
        }

        let transport = &self.shared.transport;
        let session = transport
            .establish_connection(address)
            .await
            .map_err(ConnectionError::Link)?;

        // Record the session so a concurrent close can release it
        let adopted = {
            let mut link = self.shared.lock();
            match &mut *link {
                Link::Connecting {
                    attempt: current,
                    session: slot,
                    ..
                } if *current == attempt => {
                    *slot = Some(session.clone());
                    true
                }
                _ => false,
            }
        };
        if !adopted {
            transport.release(&session).await;
            return Err(ConnectionError::Aborted);
        }

        debug!(
            "Link to {} established, requesting MTU {}",
            address, self.config.requested_mtu
        );
        let mtu = match transport.negotiate_mtu(&session, self.config.requested_mtu).await {
            Ok(mtu) => mtu,
            Err(TransportError::Unsupported) => {
                info!("MTU negotiation unsupported, using default {}", DEFAULT_ATT_MTU);
                MtuSize::default()
            }
            Err(e) => return Err(ConnectionError::Mtu(e)),
        };
        info!("MTU for {} is {}", address, mtu);

        let service = transport
            .discover_services(&session)
            .await
            .map_err(ConnectionError::Discovery)?
            .into_iter()
            .find(|s| s.uuid() == self.config.service_uuid)
            .ok_or(ConnectionError::ServiceNotFound(self.config.service_uuid))?;
        let tx = resolve_characteristic(&service, self.config.tx_char_uuid)?;
        let rx = resolve_characteristic(&service, self.config.rx_char_uuid)?;
        debug!(
            "Resolved tx 0x{:04x} and rx 0x{:04x} on service {}",
            tx.handle(),
            rx.handle(),
            service.uuid()
        );

        let notifications = match transport.subscribe_notifications(&session, &rx).await {
            Ok(notifications) => Some(notifications),
            Err(e) => {
                warn!("Failed to enable notifications on {}: {}", rx.uuid(), e);
                None
            }
        };

        let cancel = {
            let mut link = self.shared.lock();
            let (cancel, listener) = match &*link {
                Link::Connecting {
                    attempt: current,
                    cancel,
                    listener,
                    ..
                } if *current == attempt => (cancel.clone(), listener.clone()),
                _ => return Err(ConnectionError::Aborted),
            };
            *link = Link::Ready {
                attempt,
                listener,
                link: ConnectedLink {
                    peer: address.clone(),
                    session,
                    service,
                    tx,
                    rx,
                    mtu,
                    cancel: cancel.clone(),
                },
            };
            cancel
        };

        if let Some(notifications) = notifications {
            self.spawn_notification_forwarder(notifications, cancel);
        }
        Ok(())
    }

    /// Scan until `address` is seen or `limit` elapses. The scan stops when
    /// this returns.
    async fn scan_for(&self, address: &PeerAddress, limit: Duration) -> Result<(), ConnectionError> {
        debug!("Scanning for {} (timeout {:?})", address, limit);
        let mut scan = self.shared.transport.scan();
        let found = timeout(limit, async {
            while let Some(report) = scan.recv().await {
                if &report.address == address {
                    return true;
                }
            }
            false
        })
        .await;

        match found {
            Ok(true) => {
                debug!("Found {} while scanning", address);
                Ok(())
            }
            Ok(false) => Err(ConnectionError::ScanEnded(address.clone())),
            Err(_) => Err(ConnectionError::ScanTimeout(address.clone())),
        }
    }

    fn spawn_state_listener(
        &self,
        peer: &PeerAddress,
        attempt: u64,
        stop: CancellationToken,
        exit_guard: DropGuard,
    ) {
        let mut states = self.shared.transport.connection_state_changes(peer);
        let shared = Arc::clone(&self.shared);
        let peer = peer.clone();

        tokio::spawn(async move {
            let _exit_guard = exit_guard;
            let mut last = ConnectionState::Disconnected;
            loop {
                let state = tokio::select! {
                    biased;
                    _ = stop.cancelled() => {
                        // Forward what was reported before the stop, nothing after
                        loop {
                            match states.try_recv() {
                                Ok(state) => forward_state(&shared.state_tx, &peer, &mut last, state),
                                Err(TryRecvError::Lagged(missed)) => {
                                    warn!("Missed {} state changes for {}", missed, peer);
                                }
                                Err(_) => break,
                            }
                        }
                        break;
                    }
                    result = states.recv() => match result {
                        Ok(state) => state,
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Missed {} state changes for {}", missed, peer);
                            continue;
                        }
                        Err(RecvError::Closed) => {
                            warn!("State stream for {} closed", peer);
                            shared.handle_link_loss(attempt).await;
                            break;
                        }
                    },
                };

                // Tear down first so subscribers never see a stale Ready link
                if state == ConnectionState::Disconnected {
                    shared.handle_link_loss(attempt).await;
                }
                forward_state(&shared.state_tx, &peer, &mut last, state);
            }
            debug!("State listener for {} stopped", peer);
        });
    }

    fn spawn_notification_forwarder(
        &self,
        mut notifications: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        let notify_tx = self.notify_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    value = notifications.recv() => match value {
                        Some(value) => {
                            trace!("received : {}", hex::encode(&value));
                            let _ = notify_tx.send(value);
                        }
                        None => {
                            warn!("Notification stream ended");
                            break;
                        }
                    },
                }
            }
            debug!("Notification forwarder stopped");
        });
    }
}

impl<T: BleTransport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn forward_state(
    state_tx: &broadcast::Sender<ConnectionState>,
    peer: &PeerAddress,
    last: &mut ConnectionState,
    state: ConnectionState,
) {
    if !last.can_transition_to(state) {
        warn!("Unexpected state change for {}: {} -> {}", peer, last, state);
    }
    *last = state;
    info!("{} is {}", peer, state);
    let _ = state_tx.send(state);
}

fn resolve_characteristic(
    service: &ServiceHandle,
    uuid: Uuid,
) -> Result<CharacteristicHandle, ConnectionError> {
    service
        .characteristic(uuid)
        .cloned()
        .ok_or(ConnectionError::CharacteristicNotFound(uuid))
}
