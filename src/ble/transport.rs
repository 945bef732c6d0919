//! Abstract BLE transport.
//!
//! The client never talks to a radio directly. Everything it needs from the
//! link (scanning, connecting, MTU negotiation, service discovery, writes,
//! long writes and notifications) goes through [`BleTransport`]. A
//! platform stack implements it for real hardware; [`MockTransport`] is a
//! deterministic implementation for tests.
//!
//! # Streams
//!
//! - Scan reports arrive on an `mpsc` channel. Dropping the receiver stops
//!   the scan.
//! - Connection state changes are multicast on a `broadcast` channel.
//! - Notifications arrive on an `mpsc` channel that closes when the session
//!   is released or lost.
//!
//! [`MockTransport`]: super::MockTransport

use super::types::{
    CharacteristicHandle, ConnectionState, MtuSize, PeerAddress, ScanResult, ServiceHandle,
};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Errors reported by a transport operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The operation is not supported by this stack or peer.
    #[error("operation not supported")]
    Unsupported,

    /// The link went away while the operation was pending.
    #[error("link disconnected")]
    Disconnected,

    #[error("device not found: {0}")]
    DeviceNotFound(PeerAddress),

    #[error("operation timed out")]
    Timeout,

    /// GATT-level failure with the stack's status description.
    #[error("GATT error: {0}")]
    Gatt(String),
}

/// Pacing hook for a flow-controlled long write.
///
/// The transport calls [`on_ack`](AckStrategy::on_ack) once per chunk, after
/// the peer acknowledged it and before the next chunk is sent. The next
/// chunk is held back until the returned future resolves.
#[async_trait]
pub trait AckStrategy: Send {
    /// Chunk `index` (0-based) was acknowledged. Returning an error aborts
    /// the long write with that error.
    async fn on_ack(&mut self, index: usize, chunk: &[u8]) -> Result<(), TransportError>;
}

/// Asynchronous GATT client transport.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Handle of an established link.
    type Session: Clone + Send + Sync + 'static;

    /// Start scanning for advertising devices.
    fn scan(&self) -> mpsc::Receiver<ScanResult>;

    /// Subscribe to link state changes for `peer`.
    fn connection_state_changes(&self, peer: &PeerAddress) -> broadcast::Receiver<ConnectionState>;

    /// Establish a link to `peer`.
    async fn establish_connection(&self, peer: &PeerAddress) -> Result<Self::Session, TransportError>;

    /// Request an ATT MTU; resolves to the negotiated value.
    async fn negotiate_mtu(
        &self,
        session: &Self::Session,
        requested: u16,
    ) -> Result<MtuSize, TransportError>;

    /// Enumerate the peer's services.
    async fn discover_services(
        &self,
        session: &Self::Session,
    ) -> Result<Vec<ServiceHandle>, TransportError>;

    /// Write a single value; resolves to the bytes actually written.
    async fn write_characteristic(
        &self,
        session: &Self::Session,
        characteristic: &CharacteristicHandle,
        bytes: &[u8],
    ) -> Result<Vec<u8>, TransportError>;

    /// Write `bytes` in chunks of at most `max_chunk`, pacing each chunk
    /// through `ack`. Resolves once the whole sequence has been delivered.
    async fn long_write(
        &self,
        session: &Self::Session,
        characteristic: &CharacteristicHandle,
        bytes: &[u8],
        max_chunk: usize,
        ack: &mut dyn AckStrategy,
    ) -> Result<(), TransportError>;

    /// Enable notifications on `characteristic`.
    async fn subscribe_notifications(
        &self,
        session: &Self::Session,
        characteristic: &CharacteristicHandle,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    /// Tear the link down and free the session. Releasing a session that is
    /// already gone is a no-op.
    async fn release(&self, session: &Self::Session);
}
