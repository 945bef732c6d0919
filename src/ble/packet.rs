//! Payload partitioning for MTU-limited writes.
//!
//! A batch transfer splits the caller's payload into ordered packets no
//! larger than the effective chunk size. Packets carry no header: the
//! payload is opaque and concatenating the packets in order yields it back
//! exactly.
//!
//! # Example
//!
//! ```
//! use ble_link::ble::{effective_chunk_size, MtuSize, Packetizer};
//!
//! // Caller asks for 100-byte batches on a link negotiated at MTU 512
//! let chunk = effective_chunk_size(100, MtuSize::new(512));
//! let packetizer = Packetizer::try_new(chunk).unwrap();
//!
//! let payload = vec![0u8; 1000];
//! assert_eq!(packetizer.packet_count(payload.len()), 10);
//! assert!(packetizer.packets(&payload).all(|p| p.bytes.len() == 100));
//! ```

use super::types::MtuSize;
use thiserror::Error;

/// Errors raised when setting up partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("chunk size must be at least 1 byte")]
    ChunkSizeZero,
}

/// Chunk size actually used for a transfer.
///
/// The requested batch size is capped by what a single write can carry on
/// the negotiated MTU.
pub fn effective_chunk_size(requested: usize, mtu: MtuSize) -> usize {
    requested.min(mtu.max_write_payload())
}

/// Percentage of a transfer completed after `page` of `pages` packets.
///
/// Rounds to the nearest percent and never exceeds 100. 100 is reserved for
/// the final page, so long transfers report at most 99 until every packet is
/// through. An empty transfer reports 0.
pub fn progress_percent(page: usize, pages: usize) -> u8 {
    if pages == 0 {
        return 0;
    }
    if page >= pages {
        return 100;
    }
    let percent = (page as f64 / pages as f64 * 100.0).round();
    percent.clamp(0.0, 99.0) as u8
}

/// One contiguous slice of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    /// Position of this packet in the transfer (0-based).
    pub index: usize,
    /// The bytes to write.
    pub bytes: &'a [u8],
}

/// Splits payloads into packets of a fixed maximum size.
#[derive(Debug, Clone, Copy)]
pub struct Packetizer {
    chunk_size: usize,
}

impl Packetizer {
    /// Create a packetizer for the given chunk size.
    pub fn try_new(chunk_size: usize) -> Result<Self, PacketError> {
        if chunk_size == 0 {
            return Err(PacketError::ChunkSizeZero);
        }
        Ok(Self { chunk_size })
    }

    /// Get the maximum packet size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of packets a payload of `len` bytes splits into.
    pub fn packet_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Iterate over the packets of `payload` in order.
    pub fn packets<'a>(&self, payload: &'a [u8]) -> impl Iterator<Item = Packet<'a>> + 'a {
        payload
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, bytes)| Packet { index, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_chunk_size_respects_both_bounds() {
        // Requested size fits
        assert_eq!(effective_chunk_size(100, MtuSize::new(512)), 100);
        // MTU forces a smaller size
        assert_eq!(effective_chunk_size(512, MtuSize::new(185)), 182);
        assert_eq!(effective_chunk_size(244, MtuSize::default()), 20);

        for requested in [1, 20, 100, 244, 509, 512] {
            for mtu in [23, 64, 185, 247, 512, 517] {
                let mtu = MtuSize::new(mtu);
                let chunk = effective_chunk_size(requested, mtu);
                assert!(chunk <= requested);
                assert!(chunk <= mtu.max_write_payload());
            }
        }
    }

    #[test]
    fn test_packetizer_zero_chunk_rejected() {
        assert_eq!(Packetizer::try_new(0).unwrap_err(), PacketError::ChunkSizeZero);
        assert!(Packetizer::try_new(1).is_ok());
    }

    #[test]
    fn test_partition_covers_payload_exactly() {
        let payload: Vec<u8> = (0..=255).cycle().take(1337).collect();

        for chunk in [1, 7, 20, 100, 244, 1337, 2000] {
            let packetizer = Packetizer::try_new(chunk).unwrap();
            let packets: Vec<_> = packetizer.packets(&payload).collect();

            assert_eq!(packets.len(), payload.len().div_ceil(chunk));
            assert_eq!(packets.len(), packetizer.packet_count(payload.len()));
            assert!(packets.iter().all(|p| !p.bytes.is_empty() && p.bytes.len() <= chunk));
            assert!(packets.iter().enumerate().all(|(i, p)| p.index == i));

            let joined: Vec<u8> = packets.iter().flat_map(|p| p.bytes.iter().copied()).collect();
            assert_eq!(joined, payload);
        }
    }

    #[test]
    fn test_partition_last_packet_is_remainder() {
        let packetizer = Packetizer::try_new(20).unwrap();
        let payload = vec![0xAA; 45];
        let sizes: Vec<usize> = packetizer.packets(&payload).map(|p| p.bytes.len()).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
    }

    #[test]
    fn test_empty_payload_has_no_packets() {
        let packetizer = Packetizer::try_new(20).unwrap();
        assert_eq!(packetizer.packet_count(0), 0);
        assert_eq!(packetizer.packets(&[]).count(), 0);
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 10), 0);
        assert_eq!(progress_percent(1, 10), 10);
        assert_eq!(progress_percent(10, 10), 100);
        // 1/3 and 2/3 round to nearest
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
        // Never overshoots
        assert_eq!(progress_percent(11, 10), 100);
        assert_eq!(progress_percent(0, 0), 0);
    }

    #[test]
    fn test_progress_below_100_until_last_page() {
        // 199/200 would round up to 100
        assert_eq!(progress_percent(199, 200), 99);
        assert_eq!(progress_percent(999, 1000), 99);
        assert_eq!(progress_percent(200, 200), 100);
        assert_eq!(progress_percent(995, 1000), 99);
    }

    #[test]
    fn test_progress_monotonic() {
        for pages in 1..=1200 {
            let mut last = 0;
            for page in 0..=pages {
                let percent = progress_percent(page, pages);
                assert!(percent >= last);
                last = percent;
            }
            assert_eq!(last, 100);
            // 100 is only reached on the final page
            assert!(progress_percent(pages - 1, pages) < 100);
        }
    }
}
