//! Link configuration data structures.
//!
//! # Example
//!
//! ```
//! use ble_link::LinkConfig;
//! use uuid::Uuid;
//!
//! let config = LinkConfig::new(
//!     Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E),
//!     Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E),
//!     Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E),
//! )
//! .unwrap();
//! assert_eq!(config.requested_mtu, 512);
//! ```

use crate::ble::{DEFAULT_ATT_MTU, MAX_ATT_MTU};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Smallest batch size a caller may request.
pub const MIN_BATCH_SIZE: usize = 1;

/// Largest batch size a caller may request (maximum attribute value length).
pub const MAX_BATCH_SIZE: usize = 512;

/// MTU requested right after the link comes up.
pub const DEFAULT_REQUESTED_MTU: u16 = 512;

/// Batch size used by the `*_default` send helpers.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Pacing delay used by the `*_default` send helpers.
pub const DEFAULT_PACKET_DELAY: Duration = Duration::from_millis(50);

/// GATT layout and transfer defaults for one peripheral type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Service that hosts both characteristics.
    pub service_uuid: Uuid,
    /// Characteristic commands and payloads are written to.
    pub tx_char_uuid: Uuid,
    /// Characteristic the peripheral notifies on.
    pub rx_char_uuid: Uuid,
    /// ATT MTU requested after connecting (23-517).
    pub requested_mtu: u16,
    /// Batch size for `send_paced_default` / `send_batch_default`.
    pub default_batch_size: usize,
    /// Pacing delay for `send_paced_default` / `send_batch_default`.
    pub default_packet_delay: Duration,
}

impl LinkConfig {
    /// Create a configuration with default transfer settings.
    ///
    /// The tx and rx characteristics may be the same attribute; some UART
    /// bridges expose a single write+notify characteristic.
    pub fn new(service_uuid: Uuid, tx_char_uuid: Uuid, rx_char_uuid: Uuid) -> Result<Self, ConfigError> {
        let config = Self {
            service_uuid,
            tx_char_uuid,
            rx_char_uuid,
            requested_mtu: DEFAULT_REQUESTED_MTU,
            default_batch_size: DEFAULT_BATCH_SIZE,
            default_packet_delay: DEFAULT_PACKET_DELAY,
        };
        config.validate()?;
        Ok(config)
    }

    /// Override the MTU requested after connecting.
    pub fn with_requested_mtu(mut self, mtu: u16) -> Result<Self, ConfigError> {
        self.requested_mtu = mtu;
        self.validate()?;
        Ok(self)
    }

    /// Override the defaults used by the `*_default` send helpers.
    pub fn with_transfer_defaults(
        mut self,
        batch_size: usize,
        packet_delay: Duration,
    ) -> Result<Self, ConfigError> {
        self.default_batch_size = batch_size;
        self.default_packet_delay = packet_delay;
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_uuid.is_nil() || self.tx_char_uuid.is_nil() || self.rx_char_uuid.is_nil() {
            return Err(ConfigError::NilUuid);
        }
        if self.service_uuid == self.tx_char_uuid || self.service_uuid == self.rx_char_uuid {
            return Err(ConfigError::ServiceCharacteristicClash(self.service_uuid));
        }
        if !(DEFAULT_ATT_MTU..=MAX_ATT_MTU).contains(&self.requested_mtu) {
            return Err(ConfigError::MtuOutOfRange {
                mtu: self.requested_mtu,
                min: DEFAULT_ATT_MTU,
                max: MAX_ATT_MTU,
            });
        }
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.default_batch_size) {
            return Err(ConfigError::BatchSizeOutOfRange {
                size: self.default_batch_size,
                min: MIN_BATCH_SIZE,
                max: MAX_BATCH_SIZE,
            });
        }
        Ok(())
    }
}

/// Errors reported when a [`LinkConfig`] is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("service and characteristic UUIDs must not be nil")]
    NilUuid,

    #[error("characteristic UUID {0} is the same as the service UUID")]
    ServiceCharacteristicClash(Uuid),

    #[error("requested MTU {mtu} out of range ({min}-{max})")]
    MtuOutOfRange { mtu: u16, min: u16, max: u16 },

    #[error("default batch size {size} out of range ({min}-{max})")]
    BatchSizeOutOfRange { size: usize, min: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
    const TX: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
    const RX: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

    #[test]
    fn test_new_uses_defaults() {
        let config = LinkConfig::new(SERVICE, TX, RX).unwrap();
        assert_eq!(config.requested_mtu, 512);
        assert_eq!(config.default_batch_size, 20);
        assert_eq!(config.default_packet_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_shared_tx_rx_characteristic_allowed() {
        assert!(LinkConfig::new(SERVICE, TX, TX).is_ok());
    }

    #[test]
    fn test_nil_uuid_rejected() {
        assert_eq!(
            LinkConfig::new(Uuid::nil(), TX, RX),
            Err(ConfigError::NilUuid)
        );
        assert_eq!(
            LinkConfig::new(SERVICE, Uuid::nil(), RX),
            Err(ConfigError::NilUuid)
        );
    }

    #[test]
    fn test_service_clash_rejected() {
        assert_eq!(
            LinkConfig::new(SERVICE, SERVICE, RX),
            Err(ConfigError::ServiceCharacteristicClash(SERVICE))
        );
    }

    #[test]
    fn test_requested_mtu_bounds() {
        let config = LinkConfig::new(SERVICE, TX, RX).unwrap();
        assert!(config.clone().with_requested_mtu(23).is_ok());
        assert!(config.clone().with_requested_mtu(517).is_ok());
        assert!(matches!(
            config.clone().with_requested_mtu(22),
            Err(ConfigError::MtuOutOfRange { mtu: 22, .. })
        ));
        assert!(matches!(
            config.with_requested_mtu(518),
            Err(ConfigError::MtuOutOfRange { mtu: 518, .. })
        ));
    }

    #[test]
    fn test_transfer_defaults_bounds() {
        let config = LinkConfig::new(SERVICE, TX, RX).unwrap();
        let tuned = config
            .clone()
            .with_transfer_defaults(244, Duration::from_millis(10))
            .unwrap();
        assert_eq!(tuned.default_batch_size, 244);
        assert_eq!(tuned.default_packet_delay, Duration::from_millis(10));

        assert!(matches!(
            config.clone().with_transfer_defaults(0, Duration::ZERO),
            Err(ConfigError::BatchSizeOutOfRange { size: 0, .. })
        ));
        assert!(matches!(
            config.with_transfer_defaults(513, Duration::ZERO),
            Err(ConfigError::BatchSizeOutOfRange { size: 513, .. })
        ));
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::MtuOutOfRange {
            mtu: 600,
            min: 23,
            max: 517,
        };
        assert_eq!(err.to_string(), "requested MTU 600 out of range (23-517)");
    }
}
