//! Payload delivery over an established connection.

mod batch;
mod engine;

pub use batch::{BatchProgress, BatchState};
pub use engine::{TransferEngine, TransferError, WriteError};
