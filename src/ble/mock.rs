//! Deterministic in-memory transport.
//!
//! `MockTransport` behaves like a single well-behaved peripheral by default:
//! it connects, negotiates the requested MTU, exposes the configured
//! service, and accepts every write. Each stage can be scripted to fail,
//! and tests can inject link loss, state events and notifications. All
//! successful writes are recorded for inspection.
//!
//! Clones share state, so a test keeps one clone while the client owns
//! another.
//!
//! # Example
//!
//! ```
//! use ble_link::{LinkConfig, MockTransport};
//! use uuid::Uuid;
//!
//! let config = LinkConfig::new(Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3)).unwrap();
//! let mock = MockTransport::for_config(&config).with_mtu(247).fail_write_at(4);
//! assert_eq!(mock.write_count(), 0);
//! ```

use super::transport::{AckStrategy, BleTransport, TransportError};
use super::types::{
    CharacteristicHandle, ConnectionState, MtuSize, PeerAddress, ScanResult, ServiceHandle,
    MAX_ATT_MTU,
};
use crate::config::LinkConfig;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Capacity of the state change channel.
const STATE_CHANNEL_CAPACITY: usize = 32;

/// Capacity of the scan and notification channels.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Attribute handle of the first characteristic built by [`MockTransport::for_config`].
const FIRST_CHAR_HANDLE: u16 = 0x0010;

/// Session handed out by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSession {
    id: u64,
    peer: PeerAddress,
}

impl MockSession {
    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }
}

#[derive(Debug, Default)]
struct MockState {
    services: Vec<ServiceHandle>,
    scan_results: Vec<ScanResult>,
    scan_interval: Duration,
    /// Largest MTU the peer accepts; `None` means negotiation is unsupported.
    peer_mtu: Option<u16>,
    connect_error: Option<TransportError>,
    mtu_error: Option<TransportError>,
    discovery_error: Option<TransportError>,
    notification_error: Option<TransportError>,
    fail_write_at: Option<usize>,
    fail_long_write_at: Option<usize>,
    write_latency: Duration,
    write_attempts: usize,
    writes: Vec<Vec<u8>>,
    active_session: Option<u64>,
    next_session: u64,
    notifiers: Vec<mpsc::Sender<Vec<u8>>>,
    releases: usize,
    state_stream_closed: bool,
}

/// Scriptable transport for host tests.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    state_tx: broadcast::Sender<ConnectionState>,
}

impl MockTransport {
    /// Create a mock exposing the given services.
    pub fn new(services: Vec<ServiceHandle>) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let state = MockState {
            services,
            peer_mtu: Some(MAX_ATT_MTU),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            state_tx,
        }
    }

    /// Create a mock exposing the service and characteristics named by `config`.
    pub fn for_config(config: &LinkConfig) -> Self {
        let mut characteristics = vec![CharacteristicHandle::new(config.tx_char_uuid, FIRST_CHAR_HANDLE)];
        if config.rx_char_uuid != config.tx_char_uuid {
            characteristics.push(CharacteristicHandle::new(config.rx_char_uuid, FIRST_CHAR_HANDLE + 2));
        }
        Self::new(vec![ServiceHandle::new(config.service_uuid, characteristics)])
    }

    /// Cap the MTU the peer accepts.
    pub fn with_mtu(self, mtu: u16) -> Self {
        self.lock().peer_mtu = Some(mtu);
        self
    }

    /// Make MTU negotiation report [`TransportError::Unsupported`].
    pub fn without_mtu_support(self) -> Self {
        self.lock().peer_mtu = None;
        self
    }

    /// Advertisements reported by every scan, one per `interval`.
    pub fn with_scan_results(self, results: Vec<ScanResult>, interval: Duration) -> Self {
        {
            let mut state = self.lock();
            state.scan_results = results;
            state.scan_interval = interval;
        }
        self
    }

    /// Delay every write (and every long-write chunk) by `latency`.
    pub fn with_write_latency(self, latency: Duration) -> Self {
        self.lock().write_latency = latency;
        self
    }

    /// Hand out state subscriptions that are already closed, as a stack
    /// does when its event source goes away.
    pub fn without_state_stream(self) -> Self {
        self.lock().state_stream_closed = true;
        self
    }

    pub fn fail_connect(self, error: TransportError) -> Self {
        self.lock().connect_error = Some(error);
        self
    }

    pub fn fail_mtu(self, error: TransportError) -> Self {
        self.lock().mtu_error = Some(error);
        self
    }

    pub fn fail_discovery(self, error: TransportError) -> Self {
        self.lock().discovery_error = Some(error);
        self
    }

    pub fn fail_notifications(self, error: TransportError) -> Self {
        self.lock().notification_error = Some(error);
        self
    }

    /// Fail the write attempt with this 0-based index (counted across all
    /// single writes).
    pub fn fail_write_at(self, index: usize) -> Self {
        self.lock().fail_write_at = Some(index);
        self
    }

    /// Fail the long-write chunk with this 0-based index.
    pub fn fail_long_write_at(self, index: usize) -> Self {
        self.lock().fail_long_write_at = Some(index);
        self
    }

    /// Successful writes, in order. Long-write chunks are recorded one per chunk.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    /// Number of sessions released through [`BleTransport::release`].
    pub fn release_count(&self) -> usize {
        self.lock().releases
    }

    pub fn is_session_open(&self) -> bool {
        self.lock().active_session.is_some()
    }

    /// Simulate the peer vanishing: the session dies and Disconnected is reported.
    pub fn drop_link(&self) {
        let had_session = {
            let mut state = self.lock();
            state.notifiers.clear();
            state.active_session.take().is_some()
        };
        if had_session {
            debug!("Mock link dropped");
            let _ = self.state_tx.send(ConnectionState::Disconnected);
        }
    }

    /// Report an arbitrary state change.
    pub fn emit_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    /// Deliver a notification to every subscriber. Returns how many received it.
    pub fn push_notification(&self, value: &[u8]) -> usize {
        let state = self.lock();
        state
            .notifiers
            .iter()
            .filter(|tx| tx.try_send(value.to_vec()).is_ok())
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Mock transport mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn check_session(&self, session: &MockSession) -> Result<(), TransportError> {
        if self.lock().active_session == Some(session.id) {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().write_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    type Session = MockSession;

    fn scan(&self) -> mpsc::Receiver<ScanResult> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (results, interval) = {
            let state = self.lock();
            (state.scan_results.clone(), state.scan_interval)
        };
        tokio::spawn(async move {
            for result in results {
                tokio::time::sleep(interval).await;
                if tx.send(result).await.is_err() {
                    return;
                }
            }
            // A real scan keeps running until the receiver goes away
            tx.closed().await;
        });
        rx
    }

    fn connection_state_changes(&self, _peer: &PeerAddress) -> broadcast::Receiver<ConnectionState> {
        if self.lock().state_stream_closed {
            // Sender dropped right away
            let (_, rx) = broadcast::channel(1);
            return rx;
        }
        self.state_tx.subscribe()
    }

    async fn establish_connection(&self, peer: &PeerAddress) -> Result<MockSession, TransportError> {
        let _ = self.state_tx.send(ConnectionState::Connecting);
        let result = {
            let mut state = self.lock();
            match state.connect_error.clone() {
                Some(error) => Err(error),
                None => {
                    state.next_session += 1;
                    let id = state.next_session;
                    state.active_session = Some(id);
                    Ok(MockSession {
                        id,
                        peer: peer.clone(),
                    })
                }
            }
        };
        let next = match result {
            Ok(_) => ConnectionState::Connected,
            Err(_) => ConnectionState::Disconnected,
        };
        let _ = self.state_tx.send(next);
        result
    }

    async fn negotiate_mtu(&self, session: &MockSession, requested: u16) -> Result<MtuSize, TransportError> {
        self.check_session(session)?;
        let state = self.lock();
        if let Some(error) = state.mtu_error.clone() {
            return Err(error);
        }
        state
            .peer_mtu
            .map(|peer_mtu| MtuSize::new(requested.min(peer_mtu)))
            .ok_or(TransportError::Unsupported)
    }

    async fn discover_services(&self, session: &MockSession) -> Result<Vec<ServiceHandle>, TransportError> {
        self.check_session(session)?;
        let state = self.lock();
        match state.discovery_error.clone() {
            Some(error) => Err(error),
            None => Ok(state.services.clone()),
        }
    }

    async fn write_characteristic(
        &self,
        session: &MockSession,
        _characteristic: &CharacteristicHandle,
        bytes: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        self.check_session(session)?;
        self.simulate_latency().await;

        let mut state = self.lock();
        let attempt = state.write_attempts;
        state.write_attempts += 1;
        if state.fail_write_at == Some(attempt) {
            return Err(TransportError::Gatt(format!("injected failure on write {}", attempt)));
        }
        if state.active_session != Some(session.id) {
            return Err(TransportError::Disconnected);
        }
        state.writes.push(bytes.to_vec());
        Ok(bytes.to_vec())
    }

    async fn long_write(
        &self,
        session: &MockSession,
        _characteristic: &CharacteristicHandle,
        bytes: &[u8],
        max_chunk: usize,
        ack: &mut dyn AckStrategy,
    ) -> Result<(), TransportError> {
        self.check_session(session)?;
        if max_chunk == 0 {
            return Err(TransportError::Gatt("long write chunk size is zero".to_string()));
        }

        for (index, chunk) in bytes.chunks(max_chunk).enumerate() {
            self.simulate_latency().await;
            {
                let mut state = self.lock();
                if state.active_session != Some(session.id) {
                    return Err(TransportError::Disconnected);
                }
                if state.fail_long_write_at == Some(index) {
                    return Err(TransportError::Gatt(format!(
                        "injected failure on chunk {}",
                        index
                    )));
                }
                state.writes.push(chunk.to_vec());
            }
            ack.on_ack(index, chunk).await?;
        }
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        session: &MockSession,
        _characteristic: &CharacteristicHandle,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        self.check_session(session)?;
        let mut state = self.lock();
        if let Some(error) = state.notification_error.clone() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        state.notifiers.push(tx);
        Ok(rx)
    }

    async fn release(&self, session: &MockSession) {
        let released = {
            let mut state = self.lock();
            if state.active_session == Some(session.id) {
                state.active_session = None;
                state.notifiers.clear();
                state.releases += 1;
                true
            } else {
                false
            }
        };
        if released {
            let _ = self.state_tx.send(ConnectionState::Disconnecting);
            let _ = self.state_tx.send(ConnectionState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn config() -> LinkConfig {
        LinkConfig::new(Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3)).unwrap()
    }

    struct CountingAck(usize);

    #[async_trait]
    impl AckStrategy for CountingAck {
        async fn on_ack(&mut self, _index: usize, _chunk: &[u8]) -> Result<(), TransportError> {
            self.0 += 1;
            Ok(())
        }
    }

    #[test]
    fn test_for_config_builds_service() {
        let config = config();
        let mock = MockTransport::for_config(&config);
        let services = mock.lock().services.clone();

        assert_eq!(services.len(), 1);
        assert!(services[0].characteristic(config.tx_char_uuid).is_some());
        assert!(services[0].characteristic(config.rx_char_uuid).is_some());
    }

    #[tokio::test]
    async fn test_connect_reports_states() {
        let mock = MockTransport::for_config(&config());
        let mut states = mock.connection_state_changes(&PeerAddress::from("peer"));

        let session = mock.establish_connection(&"peer".into()).await.unwrap();
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Connecting);
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Connected);
        assert!(mock.is_session_open());

        mock.release(&session).await;
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Disconnecting);
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Disconnected);
        assert_eq!(mock.release_count(), 1);

        // Releasing twice is a no-op
        mock.release(&session).await;
        assert_eq!(mock.release_count(), 1);
    }

    #[tokio::test]
    async fn test_mtu_negotiation() {
        let mock = MockTransport::for_config(&config()).with_mtu(185);
        let session = mock.establish_connection(&"peer".into()).await.unwrap();
        assert_eq!(mock.negotiate_mtu(&session, 512).await.unwrap(), MtuSize::new(185));
        assert_eq!(mock.negotiate_mtu(&session, 100).await.unwrap(), MtuSize::new(100));

        let mock = MockTransport::for_config(&config()).without_mtu_support();
        let session = mock.establish_connection(&"peer".into()).await.unwrap();
        assert_eq!(
            mock.negotiate_mtu(&session, 512).await,
            Err(TransportError::Unsupported)
        );
    }

    #[tokio::test]
    async fn test_scripted_write_failure() {
        let mock = MockTransport::for_config(&config()).fail_write_at(1);
        let session = mock.establish_connection(&"peer".into()).await.unwrap();
        let tx = CharacteristicHandle::new(Uuid::from_u128(2), FIRST_CHAR_HANDLE);

        assert!(mock.write_characteristic(&session, &tx, &[1]).await.is_ok());
        assert!(matches!(
            mock.write_characteristic(&session, &tx, &[2]).await,
            Err(TransportError::Gatt(_))
        ));
        assert!(mock.write_characteristic(&session, &tx, &[3]).await.is_ok());
        assert_eq!(mock.writes(), vec![vec![1], vec![3]]);
    }

    #[tokio::test]
    async fn test_writes_fail_after_link_drop() {
        let mock = MockTransport::for_config(&config());
        let session = mock.establish_connection(&"peer".into()).await.unwrap();
        let tx = CharacteristicHandle::new(Uuid::from_u128(2), FIRST_CHAR_HANDLE);

        mock.drop_link();
        assert_eq!(
            mock.write_characteristic(&session, &tx, &[1]).await,
            Err(TransportError::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_long_write_acks_every_chunk() {
        let mock = MockTransport::for_config(&config());
        let session = mock.establish_connection(&"peer".into()).await.unwrap();
        let tx = CharacteristicHandle::new(Uuid::from_u128(2), FIRST_CHAR_HANDLE);
        let mut ack = CountingAck(0);

        mock.long_write(&session, &tx, &[7u8; 45], 20, &mut ack).await.unwrap();
        assert_eq!(ack.0, 3);
        assert_eq!(mock.writes().concat(), vec![7u8; 45]);
    }

    #[tokio::test]
    async fn test_notifications_delivered_until_release() {
        let mock = MockTransport::for_config(&config());
        let session = mock.establish_connection(&"peer".into()).await.unwrap();
        let rx_char = CharacteristicHandle::new(Uuid::from_u128(3), FIRST_CHAR_HANDLE + 2);
        let mut notifications = mock.subscribe_notifications(&session, &rx_char).await.unwrap();

        assert_eq!(mock.push_notification(b"hi"), 1);
        assert_eq!(notifications.recv().await, Some(b"hi".to_vec()));

        mock.release(&session).await;
        assert_eq!(notifications.recv().await, None);
    }
}
