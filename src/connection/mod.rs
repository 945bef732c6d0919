//! Connection lifecycle management.
//!
//! The [`ConnectionManager`] owns one connection attempt at a time and the
//! service and characteristic handles derived from it. It is the only
//! component that mutates link state; transfers read snapshots of it.

mod manager;

pub use manager::{ConnectedLink, ConnectionError, ConnectionManager, EVENT_CHANNEL_CAPACITY};
