//! Wire-level packets and the codec that moves them on and off the wire.
//!
//! ## Packet layout
//!
//! Each datagram carries one packet: a 12-byte fixed header, an optional
//! CSRC list, the payload, and an optional one-byte padding trailer.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  CSRC list (CC entries, optional)             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! - **Sequence number**: 16-bit, wrapping. Orders fragments of a frame.
//! - **Timestamp**: one value per source frame, shared by all its fragments.
//! - **Marker bit**: set on the final fragment of a frame.
//!
//! [`codec`] converts between [`Packet`] and bytes; [`fragment`] splits an
//! encoded frame into packets.

pub mod codec;
pub mod fragment;

pub use codec::{decode, encode};
pub use fragment::{Fragmenter, fragment};

/// Size of the fixed header, without CSRC entries.
pub const BASE_HEADER_SIZE: usize = 12;

/// Only protocol version ever written.
pub const VERSION: u8 = 2;

/// Dynamic payload type used when none is configured.
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

/// The CSRC count is a 4-bit field.
pub const MAX_CSRC: usize = 15;

/// One wire packet.
///
/// Immutable once built: the builder methods consume `self` and are meant to
/// be chained right after [`Packet::new`]. Ownership moves from the intake
/// queue to the assembler's per-timestamp group and is dropped after
/// reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    version: u8,
    padding: bool,
    extension: bool,
    marker: bool,
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    csrc: Vec<u32>,
    payload: Vec<u8>,
}

impl Packet {
    /// Build a version-2 packet with no CSRCs, padding or extension.
    ///
    /// `payload_type` is truncated to its 7-bit wire width.
    pub fn new(
        payload_type: u8,
        sequence_number: u16,
        timestamp: u32,
        ssrc: u32,
        payload: Vec<u8>,
        marker: bool,
    ) -> Self {
        Self {
            version: VERSION,
            padding: false,
            extension: false,
            marker,
            payload_type: payload_type & 0x7f,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            payload,
        }
    }

    /// Attach contributing sources. Entries beyond [`MAX_CSRC`] are dropped.
    pub fn with_csrc(mut self, mut csrc: Vec<u32>) -> Self {
        csrc.truncate(MAX_CSRC);
        self.csrc = csrc;
        self
    }

    /// Append a padding trailer when encoded.
    pub fn with_padding(mut self, padding: bool) -> Self {
        self.padding = padding;
        self
    }

    /// Set the extension flag. No extension header is carried.
    pub fn with_extension(mut self, extension: bool) -> Self {
        self.extension = extension;
        self
    }

    pub(crate) fn with_version(mut self, version: u8) -> Self {
        self.version = version & 0x03;
        self
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn padding(&self) -> bool {
        self.padding
    }

    pub fn extension(&self) -> bool {
        self.extension
    }

    /// Whether this is the last fragment of its frame.
    pub fn marker(&self) -> bool {
        self.marker
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn csrc(&self) -> &[u32] {
        &self.csrc
    }

    pub fn csrc_count(&self) -> u8 {
        self.csrc.len() as u8
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// `12 + 4 * csrc_count`.
    pub fn header_size(&self) -> usize {
        BASE_HEADER_SIZE + 4 * self.csrc.len()
    }

    /// Total encoded size, padding trailer included.
    pub fn encoded_len(&self) -> usize {
        self.header_size() + self.payload.len() + usize::from(self.padding)
    }

    /// Shorthand for [`encode`].
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    /// Shorthand for [`decode`].
    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        decode(bytes)
    }
}
