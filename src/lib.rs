//! Client-side BLE link library.
//!
//! Manages a single logical connection to a remote GATT peripheral over an
//! MTU-limited, asynchronous transport, and delivers bulk payloads to it in
//! chunked batches. The radio itself is abstracted behind [`BleTransport`],
//! so everything here can be tested on the host against [`MockTransport`].
//!
//! # Components
//!
//! - [`ble`] - transport boundary, value types and packet partitioning
//! - [`connection`] - connection lifecycle and handle ownership
//! - [`transfer`] - paced and ack-driven batch transfers
//! - [`client`] - the [`BleClient`] facade callers use

pub mod ble;
pub mod client;
pub mod config;
pub mod connection;
pub mod transfer;

// Re-export commonly used items
pub use ble::{
    AckStrategy, BleTransport, CharacteristicHandle, ConnectionState, MockTransport, MtuSize,
    PeerAddress, ScanResult, ServiceHandle, TransportError,
};
pub use client::BleClient;
pub use config::{ConfigError, LinkConfig};
pub use connection::{ConnectionError, ConnectionManager};
pub use transfer::{BatchProgress, BatchState, TransferEngine, TransferError, WriteError};
