use crate::error::{Result, VidlinkError};

use super::{BASE_HEADER_SIZE, Packet};

/// Default datagram budget, header included.
pub const DEFAULT_MTU: usize = 1400;

/// Split one encoded frame into packets, numbering from sequence 0.
///
/// Stateless form of [`Fragmenter::fragment`]. Each chunk carries at most
/// `mtu - 12` payload bytes so that every datagram, header included, fits
/// within `mtu`. Only the last packet has the marker bit set; an empty
/// frame produces no packets.
///
/// ```
/// use vidlink::packet::fragment;
///
/// let packets = fragment(&vec![0u8; 2800], 1400, 3000, 0x1234).unwrap();
/// let sizes: Vec<usize> = packets.iter().map(|p| p.payload().len()).collect();
/// assert_eq!(sizes, vec![1388, 1388, 24]);
/// assert!(packets[2].marker());
/// ```
pub fn fragment(frame: &[u8], mtu: usize, timestamp: u32, ssrc: u32) -> Result<Vec<Packet>> {
    let mut fragmenter = Fragmenter::new(super::DEFAULT_PAYLOAD_TYPE, ssrc, mtu)?;
    Ok(fragmenter.fragment(frame, timestamp))
}

/// Per-sender fragmentation state.
///
/// Owns the sequence counter, which keeps incrementing (and wrapping at
/// 2^16) across frames for the lifetime of the sender, so a receiver can
/// order fragments that straddle frame boundaries.
#[derive(Debug)]
pub struct Fragmenter {
    payload_type: u8,
    ssrc: u32,
    mtu: usize,
    sequence: u16,
}

impl Fragmenter {
    /// Create with explicit payload type and SSRC, starting at sequence 0.
    ///
    /// Fails with [`VidlinkError::InvalidConfig`] if `mtu` leaves no room
    /// for payload after the 12-byte header.
    pub fn new(payload_type: u8, ssrc: u32, mtu: usize) -> Result<Self> {
        if mtu <= BASE_HEADER_SIZE {
            return Err(VidlinkError::InvalidConfig(format!(
                "mtu {mtu} must exceed the {BASE_HEADER_SIZE}-byte header"
            )));
        }
        tracing::debug!(
            payload_type,
            ssrc = format_args!("{:#010X}", ssrc),
            mtu,
            "fragmenter created"
        );
        Ok(Self {
            payload_type,
            ssrc,
            mtu,
            sequence: 0,
        })
    }

    /// Create with a random SSRC.
    pub fn with_random_ssrc(payload_type: u8, mtu: usize) -> Result<Self> {
        Self::new(payload_type, rand::random::<u32>(), mtu)
    }

    /// Continue numbering from `sequence` instead of 0.
    pub fn starting_at(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Sequence number the next packet will carry.
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    /// Payload bytes per packet: `mtu - 12`.
    pub fn max_payload(&self) -> usize {
        self.mtu - BASE_HEADER_SIZE
    }

    /// Split `frame` into packets stamped with `timestamp`.
    pub fn fragment(&mut self, frame: &[u8], timestamp: u32) -> Vec<Packet> {
        let max_payload = self.max_payload();
        let count = frame.len().div_ceil(max_payload);
        let mut packets = Vec::with_capacity(count);

        for (i, chunk) in frame.chunks(max_payload).enumerate() {
            let marker = i + 1 == count;
            packets.push(Packet::new(
                self.payload_type,
                self.sequence,
                timestamp,
                self.ssrc,
                chunk.to_vec(),
                marker,
            ));
            self.sequence = self.sequence.wrapping_add(1);
        }

        tracing::trace!(
            timestamp,
            frame_bytes = frame.len(),
            packets = packets.len(),
            next_seq = self.sequence,
            "frame fragmented"
        );

        packets
    }
}
