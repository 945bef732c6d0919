//! Value types shared by the transport and the client.

use std::fmt;
use uuid::Uuid;

/// ATT MTU every link starts with before negotiation.
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Largest ATT MTU the protocol allows.
pub const MAX_ATT_MTU: u16 = 517;

/// Opcode plus attribute handle carried by every ATT write.
pub const ATT_WRITE_OVERHEAD: u16 = 3;

/// Transport-level identifier of the remote device (usually a MAC address).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Create a peer address from its transport representation.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Get the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for PeerAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Link state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Check whether `next` is a legal successor of this state.
    ///
    /// The lifecycle is Disconnected -> Connecting -> Connected ->
    /// Disconnecting -> Disconnected, and any state may drop straight to
    /// Disconnected when the link is lost.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Disconnecting)
                | (Connecting | Connected | Disconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Negotiated ATT MTU of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MtuSize(u16);

impl MtuSize {
    /// Create an MTU, clamped to the range the protocol allows.
    pub fn new(mtu: u16) -> Self {
        Self(mtu.clamp(DEFAULT_ATT_MTU, MAX_ATT_MTU))
    }

    /// Get the raw ATT MTU.
    pub fn get(self) -> u16 {
        self.0
    }

    /// Largest value a single characteristic write can carry on this link.
    pub fn max_write_payload(self) -> usize {
        usize::from(self.0 - ATT_WRITE_OVERHEAD)
    }
}

impl Default for MtuSize {
    fn default() -> Self {
        Self(DEFAULT_ATT_MTU)
    }
}

impl fmt::Display for MtuSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A characteristic exposed by the peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    uuid: Uuid,
    handle: u16,
}

impl CharacteristicHandle {
    /// Create a handle for the attribute `handle` with the given UUID.
    pub fn new(uuid: Uuid, handle: u16) -> Self {
        Self { uuid, handle }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Transport-assigned attribute handle.
    pub fn handle(&self) -> u16 {
        self.handle
    }
}

/// A discovered service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    uuid: Uuid,
    characteristics: Vec<CharacteristicHandle>,
}

impl ServiceHandle {
    pub fn new(uuid: Uuid, characteristics: Vec<CharacteristicHandle>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Look up a characteristic of this service by UUID.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicHandle> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// One advertisement report from a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Address of the advertising device.
    pub address: PeerAddress,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
    }

    #[test]
    fn test_abrupt_loss_allowed_from_any_live_state() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnected));
    }

    #[test]
    fn test_illegal_transitions() {
        use ConnectionState::*;
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Disconnected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Disconnecting.can_transition_to(Connected));
    }

    #[test]
    fn test_mtu_write_payload() {
        assert_eq!(MtuSize::default().max_write_payload(), 20);
        assert_eq!(MtuSize::new(512).max_write_payload(), 509);
        assert_eq!(MtuSize::new(247).max_write_payload(), 244);
    }

    #[test]
    fn test_mtu_clamped() {
        assert_eq!(MtuSize::new(0).get(), DEFAULT_ATT_MTU);
        assert_eq!(MtuSize::new(9000).get(), MAX_ATT_MTU);
    }

    #[test]
    fn test_service_characteristic_lookup() {
        let tx = Uuid::from_u128(2);
        let rx = Uuid::from_u128(3);
        let service = ServiceHandle::new(
            Uuid::from_u128(1),
            vec![CharacteristicHandle::new(tx, 0x10), CharacteristicHandle::new(rx, 0x12)],
        );

        assert_eq!(service.characteristic(rx).map(|c| c.handle()), Some(0x12));
        assert!(service.characteristic(Uuid::from_u128(4)).is_none());
        assert_eq!(service.characteristic(tx).map(|c| c.handle()), Some(0x10));
    }

    #[test]
    fn test_display() {
        assert_eq!(PeerAddress::from("AA:BB:CC:DD:EE:FF").to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(ConnectionState::Disconnecting.to_string(), "disconnecting");
        assert_eq!(MtuSize::new(185).to_string(), "185");
    }
}
