use crate::error::{MalformedKind, Result, VidlinkError};

use super::{BASE_HEADER_SIZE, Packet};

/// Serialize a packet into one datagram.
///
/// All multi-byte fields are written big-endian. When the padding flag is
/// set a single trailer byte is appended whose value (1) counts itself, so
/// [`decode`] strips exactly that byte.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let first_byte: u8 = (packet.version() << 6)
        | ((packet.padding() as u8) << 5)
        | ((packet.extension() as u8) << 4)
        | packet.csrc_count();
    let second_byte: u8 = ((packet.marker() as u8) << 7) | packet.payload_type();

    let mut buf = Vec::with_capacity(packet.encoded_len());
    buf.push(first_byte);
    buf.push(second_byte);
    buf.extend_from_slice(&packet.sequence_number().to_be_bytes());
    buf.extend_from_slice(&packet.timestamp().to_be_bytes());
    buf.extend_from_slice(&packet.ssrc().to_be_bytes());
    for csrc in packet.csrc() {
        buf.extend_from_slice(&csrc.to_be_bytes());
    }
    buf.extend_from_slice(packet.payload());
    if packet.padding() {
        buf.push(1);
    }
    buf
}

/// Parse one datagram into a packet.
///
/// Fails with [`VidlinkError::MalformedPacket`] when the buffer is shorter
/// than the base header, when the CSRC list runs past the end, or when the
/// padding trailer is zero or claims more bytes than remain after the
/// header.
pub fn decode(bytes: &[u8]) -> Result<Packet> {
    if bytes.len() < BASE_HEADER_SIZE {
        return Err(VidlinkError::malformed(MalformedKind::TooShort {
            len: bytes.len(),
        }));
    }

    let version = bytes[0] >> 6;
    let padding = bytes[0] & 0x20 != 0;
    let extension = bytes[0] & 0x10 != 0;
    let csrc_count = bytes[0] & 0x0f;
    let marker = bytes[1] & 0x80 != 0;
    let payload_type = bytes[1] & 0x7f;
    let sequence_number = u16::from_be_bytes([bytes[2], bytes[3]]);
    let timestamp = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let ssrc = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

    let header_size = BASE_HEADER_SIZE + 4 * csrc_count as usize;
    if bytes.len() < header_size {
        return Err(VidlinkError::malformed(MalformedKind::TruncatedCsrc {
            csrc_count,
            len: bytes.len(),
        }));
    }

    let csrc = bytes[BASE_HEADER_SIZE..header_size]
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let available = bytes.len() - header_size;
    let padding_len = if padding && available > 0 {
        bytes[bytes.len() - 1]
    } else {
        0
    };
    // The trailer counts itself, so a set padding flag needs at least one byte.
    let payload_len = available
        .checked_sub(padding_len as usize)
        .filter(|_| !padding || padding_len > 0)
        .ok_or_else(|| {
            VidlinkError::malformed(MalformedKind::BadPadding {
                padding: padding_len,
                available,
            })
        })?;

    let payload = bytes[header_size..header_size + payload_len].to_vec();

    Ok(Packet::new(payload_type, sequence_number, timestamp, ssrc, payload, marker)
        .with_version(version)
        .with_padding(padding)
        .with_extension(extension)
        .with_csrc(csrc))
}
