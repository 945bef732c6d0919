//! BLE transport boundary.
//!
//! This module contains the abstract transport the client drives, the value
//! types that cross it, and packet partitioning for MTU-limited writes.
//! A deterministic in-memory transport is provided for host testing.

mod mock;
mod packet;
mod transport;
mod types;

pub use mock::{MockSession, MockTransport};
pub use packet::{effective_chunk_size, progress_percent, Packet, PacketError, Packetizer};
pub use transport::{AckStrategy, BleTransport, TransportError};
pub use types::{
    CharacteristicHandle, ConnectionState, MtuSize, PeerAddress, ScanResult, ServiceHandle,
    ATT_WRITE_OVERHEAD, DEFAULT_ATT_MTU, MAX_ATT_MTU,
};
