//! Link configuration.
//!
//! The GATT layout of the target peripheral (service and characteristic
//! UUIDs) and the transfer defaults are supplied once when the client is
//! built and stay fixed for its lifetime.
//!
//! # Components
//!
//! - [`link`] - [`LinkConfig`] and its validation

mod link;

pub use link::{
    ConfigError, LinkConfig, DEFAULT_BATCH_SIZE, DEFAULT_PACKET_DELAY, DEFAULT_REQUESTED_MTU,
    MAX_BATCH_SIZE, MIN_BATCH_SIZE,
};
