//! Caller-facing client.
//!
//! [`BleClient`] ties a [`ConnectionManager`] and a [`TransferEngine`] to one
//! transport and one [`LinkConfig`]. It is cheap to clone; clones share the
//! same connection and event streams.
//!
//! # Example
//!
//! ```
//! use ble_link::{BatchState, BleClient, LinkConfig, MockTransport};
//! use uuid::Uuid;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = LinkConfig::new(Uuid::from_u128(0x10), Uuid::from_u128(0x11), Uuid::from_u128(0x12)).unwrap();
//! let client = BleClient::new(MockTransport::for_config(&config), config).unwrap();
//!
//! assert!(client.connect("AA:BB:CC:DD:EE:FF", None).await);
//! let state = client.send_batch_default(b"hello world").await.unwrap();
//! assert_eq!(state, BatchState::TransferEnded);
//! client.disconnect().await;
//! # }
//! ```

use crate::ble::{BleTransport, ConnectionState, MtuSize, PeerAddress, ScanResult};
use crate::config::{ConfigError, LinkConfig};
use crate::connection::ConnectionManager;
use crate::transfer::{BatchProgress, BatchState, TransferEngine, TransferError, WriteError};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Client for one GATT peripheral.
pub struct BleClient<T: BleTransport> {
    manager: Arc<ConnectionManager<T>>,
    engine: Arc<TransferEngine<T>>,
}

impl<T: BleTransport> Clone for BleClient<T> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<T: BleTransport> BleClient<T> {
    /// Create a client. Fails if `config` does not validate.
    pub fn new(transport: T, config: LinkConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let manager = Arc::new(ConnectionManager::new(Arc::new(transport), config));
        let engine = Arc::new(TransferEngine::new(Arc::clone(&manager)));
        Ok(Self { manager, engine })
    }

    pub fn config(&self) -> &LinkConfig {
        self.manager.config()
    }

    /// Advertisement reports. Dropping the receiver stops the scan.
    pub fn scan(&self) -> mpsc::Receiver<ScanResult> {
        self.manager.scan()
    }

    /// Connect to `address`, first scanning for it when `timeout` is given.
    ///
    /// Resolves to `true` once the link is up and the tx and rx
    /// characteristics are resolved. Any failure is logged and resolves to
    /// `false`.
    pub async fn connect(&self, address: impl Into<PeerAddress>, timeout: Option<Duration>) -> bool {
        self.manager.establish(address.into(), timeout).await.is_ok()
    }

    /// Connect in the background and call `on_result` exactly once with the
    /// outcome.
    pub fn connect_with<F>(
        &self,
        address: impl Into<PeerAddress>,
        timeout: Option<Duration>,
        on_result: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let manager = Arc::clone(&self.manager);
        let address = address.into();
        tokio::spawn(async move {
            manager.connect(address, timeout, on_result).await;
        })
    }

    /// Close the connection. An active transfer reports `TransferFailed`
    /// before the session is released.
    pub async fn disconnect(&self) {
        info!("Disconnecting");
        self.manager.close_connection().await;
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// Negotiated MTU of the current connection.
    pub fn mtu(&self) -> Option<MtuSize> {
        self.manager.connected().map(|link| link.mtu())
    }

    /// Address of the connected peer.
    pub fn peer(&self) -> Option<PeerAddress> {
        self.manager.connected().map(|link| link.peer().clone())
    }

    /// Single write to the tx characteristic.
    pub async fn send(&self, bytes: &[u8]) -> Result<usize, WriteError> {
        self.engine.write(bytes).await
    }

    /// Paced transfer with an explicit batch size and inter-packet delay.
    pub async fn send_paced(
        &self,
        bytes: &[u8],
        max_batch_size: usize,
        delay: Duration,
    ) -> Result<BatchState, TransferError> {
        self.engine.send_paced(bytes, max_batch_size, delay).await
    }

    /// Paced transfer with the configured defaults.
    pub async fn send_paced_default(&self, bytes: &[u8]) -> Result<BatchState, TransferError> {
        let config = self.manager.config();
        debug!(
            "Paced transfer with defaults ({} bytes, {:?})",
            config.default_batch_size, config.default_packet_delay
        );
        self.engine
            .send_paced(bytes, config.default_batch_size, config.default_packet_delay)
            .await
    }

    /// Acknowledged long-write transfer.
    pub async fn send_batch(
        &self,
        bytes: &[u8],
        max_batch_size: usize,
        ack_delay: Duration,
    ) -> Result<BatchState, TransferError> {
        self.engine.send_batch(bytes, max_batch_size, ack_delay).await
    }

    /// Acknowledged long-write transfer with the configured defaults.
    pub async fn send_batch_default(&self, bytes: &[u8]) -> Result<BatchState, TransferError> {
        let config = self.manager.config();
        self.engine
            .send_batch(bytes, config.default_batch_size, config.default_packet_delay)
            .await
    }

    /// Values notified by the peer on the rx characteristic.
    pub fn read(&self) -> broadcast::Receiver<Vec<u8>> {
        self.manager.notifications()
    }

    pub fn observe_connection_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.manager.observe_connection_state()
    }

    pub fn observe_batch_state(&self) -> broadcast::Receiver<BatchState> {
        self.engine.observe_batch_state()
    }

    pub fn observe_batch_progress(&self) -> broadcast::Receiver<BatchProgress> {
        self.engine.observe_batch_progress()
    }
}
