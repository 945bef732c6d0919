//! Bulk and single writes over an established connection.
//!
//! Two delivery strategies are offered:
//!
//! - **Paced** ([`send_paced`](TransferEngine::send_paced)): the payload is
//!   split into packets which are written one at a time with a fixed delay
//!   between writes.
//! - **Acknowledged** ([`send_batch`](TransferEngine::send_batch)): the
//!   payload is handed to the transport's long write, which calls back after
//!   every acknowledged chunk; the callback waits out the ack delay and
//!   reports progress.
//!
//! Only one transfer runs at a time. Every write to the tx characteristic
//! (single writes, every paced packet, and a whole long write) goes through
//! one write gate so writes never interleave on the air.
//!
//! A transfer is bound to the link it started on. The engine registers a
//! teardown hook with the [`ConnectionManager`], so closing or losing the
//! link emits `TransferFailed` before the session is released. The transfer
//! itself stops at its next suspension point.

use super::batch::{BatchProgress, BatchState};
use crate::ble::{
    effective_chunk_size, progress_percent, AckStrategy, BleTransport, Packetizer, TransportError,
};
use crate::config::{MAX_BATCH_SIZE, MIN_BATCH_SIZE};
use crate::connection::{ConnectedLink, ConnectionManager, EVENT_CHANNEL_CAPACITY};
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Why a transfer was rejected or stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("not connected")]
    NotConnected,

    #[error("a transfer is already in progress")]
    AlreadyInProgress,

    #[error("batch size {size} outside [{min}, {max}]")]
    InvalidBatchSize { size: usize, min: usize, max: usize },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("transfer cancelled")]
    Cancelled,
}

/// Why a single write failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("write cancelled")]
    Cancelled,
}

struct ActiveTransfer {
    id: u64,
    cancel: CancellationToken,
}

/// The active transfer and the streams it reports on. Shared with the
/// connection teardown hook.
struct TransferSlot {
    active: Mutex<Option<ActiveTransfer>>,
    state_tx: broadcast::Sender<BatchState>,
    progress_tx: broadcast::Sender<BatchProgress>,
}

impl TransferSlot {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveTransfer>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Transfer slot mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn abort(&self) -> bool {
        let mut active = self.lock();
        match active.take() {
            Some(transfer) => {
                warn!("Aborting transfer {}", transfer.id);
                transfer.cancel.cancel();
                let _ = self.state_tx.send(BatchState::TransferFailed);
                true
            }
            None => false,
        }
    }
}

/// Everything a running transfer needs, captured once when it starts.
struct Ticket<S> {
    id: u64,
    link: ConnectedLink<S>,
    packetizer: Packetizer,
    cancel: CancellationToken,
}

/// Runs transfers on the connection owned by a [`ConnectionManager`].
pub struct TransferEngine<T: BleTransport> {
    manager: Arc<ConnectionManager<T>>,
    write_gate: tokio::sync::Mutex<()>,
    slot: Arc<TransferSlot>,
    next_id: AtomicU64,
}

impl<T: BleTransport> TransferEngine<T> {
    pub fn new(manager: Arc<ConnectionManager<T>>) -> Self {
        let (state_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (progress_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let slot = Arc::new(TransferSlot {
            active: Mutex::new(None),
            state_tx,
            progress_tx,
        });

        let hook_slot = Arc::downgrade(&slot);
        manager.on_teardown(move || {
            if let Some(slot) = hook_slot.upgrade() {
                if slot.abort() {
                    info!("Active transfer failed by connection teardown");
                }
            }
        });

        Self {
            manager,
            write_gate: tokio::sync::Mutex::new(()),
            slot,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn observe_batch_state(&self) -> broadcast::Receiver<BatchState> {
        self.slot.state_tx.subscribe()
    }

    pub fn observe_batch_progress(&self) -> broadcast::Receiver<BatchProgress> {
        self.slot.progress_tx.subscribe()
    }

    pub fn is_transferring(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Write `bytes` to the tx characteristic in one operation.
    ///
    /// Resolves to the number of bytes the transport reports as written.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, WriteError> {
        let link = self.manager.connected().ok_or(WriteError::NotConnected)?;
        let cancel = link.cancel_token().clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WriteError::Cancelled),
            result = self.write_gated(&link, bytes) => result.map(|written| written.len()).map_err(WriteError::from),
        }
    }

    /// Send `bytes` as packets of at most `max_batch_size`, sleeping `delay`
    /// between packets.
    ///
    /// Rejections (bad batch size, no connection, transfer already running)
    /// return an error and emit nothing. Otherwise the transfer's terminal
    /// state is returned after it has been emitted.
    pub async fn send_paced(
        &self,
        bytes: &[u8],
        max_batch_size: usize,
        delay: Duration,
    ) -> Result<BatchState, TransferError> {
        let ticket = self.begin(max_batch_size)?;
        debug!(
            "Paced transfer of {} bytes in packets of {} ({:?} apart)",
            bytes.len(),
            ticket.packetizer.chunk_size(),
            delay
        );

        let outcome = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => Err(TransferError::Cancelled),
            result = self.write_packets(&ticket, bytes, delay) => result.map_err(TransferError::from),
        };
        Ok(self.finish(&ticket, outcome))
    }

    /// Send `bytes` through the transport's long write, waiting `ack_delay`
    /// after every acknowledged chunk.
    ///
    /// Rejections and the returned state follow [`send_paced`](Self::send_paced).
    pub async fn send_batch(
        &self,
        bytes: &[u8],
        max_batch_size: usize,
        ack_delay: Duration,
    ) -> Result<BatchState, TransferError> {
        let ticket = self.begin(max_batch_size)?;
        let chunk_size = ticket.packetizer.chunk_size();
        debug!(
            "Long write of {} bytes in chunks of {} (ack delay {:?})",
            bytes.len(),
            chunk_size,
            ack_delay
        );

        let mut ack = PacedAck {
            engine: self,
            transfer: ticket.id,
            page: 0,
            pages: ticket.packetizer.packet_count(bytes.len()),
            delay: ack_delay,
        };
        let outcome = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => Err(TransferError::Cancelled),
            result = async {
                if bytes.is_empty() {
                    return Ok(());
                }
                let _gate = self.write_gate.lock().await;
                self.manager
                    .transport()
                    .long_write(ticket.link.session(), ticket.link.tx(), bytes, chunk_size, &mut ack)
                    .await
            } => result.map_err(TransferError::from),
        };
        Ok(self.finish(&ticket, outcome))
    }

    /// Fail the active transfer, if any, and stop it.
    ///
    /// `TransferFailed` is emitted before this returns. Returns whether a
    /// transfer was active.
    pub fn abort_active(&self) -> bool {
        self.slot.abort()
    }

    /// Validate a transfer request and claim the transfer slot.
    fn begin(&self, requested: usize) -> Result<Ticket<T::Session>, TransferError> {
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&requested) {
            return Err(TransferError::InvalidBatchSize {
                size: requested,
                min: MIN_BATCH_SIZE,
                max: MAX_BATCH_SIZE,
            });
        }
        let link = self.manager.connected().ok_or(TransferError::NotConnected)?;

        let chunk_size = effective_chunk_size(requested, link.mtu());
        if chunk_size < requested {
            info!(
                "Requested batch size {} exceeds MTU {} payload, using {}",
                requested,
                link.mtu(),
                chunk_size
            );
        }
        let packetizer = Packetizer::try_new(chunk_size).map_err(|_| TransferError::InvalidBatchSize {
            size: chunk_size,
            min: MIN_BATCH_SIZE,
            max: MAX_BATCH_SIZE,
        })?;

        let mut active = self.slot.lock();
        if active.is_some() {
            return Err(TransferError::AlreadyInProgress);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = link.cancel_token().child_token();
        *active = Some(ActiveTransfer {
            id,
            cancel: cancel.clone(),
        });

        let _ = self.slot.state_tx.send(BatchState::TransferStarted);
        let _ = self.slot.progress_tx.send(BatchProgress::new(0));

        Ok(Ticket {
            id,
            link,
            packetizer,
            cancel,
        })
    }

    async fn write_packets(
        &self,
        ticket: &Ticket<T::Session>,
        bytes: &[u8],
        delay: Duration,
    ) -> Result<(), TransportError> {
        let pages = ticket.packetizer.packet_count(bytes.len());
        for packet in ticket.packetizer.packets(bytes) {
            if packet.index > 0 {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = self.write_gated(&ticket.link, packet.bytes).await {
                warn!("Packet {}/{} failed: {}", packet.index + 1, pages, e);
                return Err(e);
            }
            self.emit_progress(ticket.id, packet.index + 1, pages);
        }
        Ok(())
    }

    async fn write_gated(
        &self,
        link: &ConnectedLink<T::Session>,
        bytes: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let _gate = self.write_gate.lock().await;
        let written = self
            .manager
            .transport()
            .write_characteristic(link.session(), link.tx(), bytes)
            .await?;
        trace!("sent : {}", hex::encode(&written));
        Ok(written)
    }

    fn emit_progress(&self, transfer: u64, page: usize, pages: usize) {
        let active = self.slot.lock();
        if active.as_ref().map(|a| a.id) != Some(transfer) {
            return;
        }
        let progress = BatchProgress::new(progress_percent(page, pages));
        if progress.is_complete() {
            debug!("Transfer {} delivered all {} packets", transfer, pages);
        } else {
            trace!("Transfer {} progress {}", transfer, progress);
        }
        let _ = self.slot.progress_tx.send(progress);
    }

    /// Release the slot and emit the terminal state, unless the transfer
    /// was already aborted (which emitted its own `TransferFailed`).
    fn finish(&self, ticket: &Ticket<T::Session>, outcome: Result<(), TransferError>) -> BatchState {
        let mut active = self.slot.lock();
        let owned = active.as_ref().map(|a| a.id) == Some(ticket.id);
        if owned {
            *active = None;
        }

        let state = match outcome {
            Ok(()) if owned => {
                info!("Transfer {} complete", ticket.id);
                BatchState::TransferEnded
            }
            Ok(()) => BatchState::TransferFailed,
            Err(e) => {
                warn!("Transfer {} failed: {}", ticket.id, e);
                BatchState::TransferFailed
            }
        };
        if owned {
            let _ = self.slot.state_tx.send(state);
        }
        state
    }
}

/// Ack callback for [`TransferEngine::send_batch`].
struct PacedAck<'a, T: BleTransport> {
    engine: &'a TransferEngine<T>,
    transfer: u64,
    page: usize,
    pages: usize,
    delay: Duration,
}

#[async_trait]
impl<'a, T: BleTransport> AckStrategy for PacedAck<'a, T> {
    async fn on_ack(&mut self, _index: usize, chunk: &[u8]) -> Result<(), TransportError> {
        trace!("sent : {}", hex::encode(chunk));
        tokio::time::sleep(self.delay).await;
        self.page += 1;
        self.engine.emit_progress(self.transfer, self.page, self.pages);
        Ok(())
    }
}
