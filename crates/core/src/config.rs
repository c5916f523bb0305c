use std::time::Duration;

use crate::error::{Result, VidlinkError};
use crate::packet::fragment::DEFAULT_MTU;
use crate::packet::{BASE_HEADER_SIZE, DEFAULT_PAYLOAD_TYPE};

/// SSRC used when the sender is not given one.
pub const DEFAULT_SSRC: u32 = 0x0001_E240;

/// Socket buffer size large enough to absorb a burst of fragments.
pub const DEFAULT_SOCKET_BUFFER: usize = 64 * 1024;

/// Stream parameters shared by the sending and receiving side.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Datagram budget in bytes, header included.
    pub mtu: usize,
    /// Payload type stamped on outgoing packets (7-bit).
    pub payload_type: u8,
    /// Synchronization source of this sender.
    pub ssrc: u32,
    /// Nominal frame rate. Sets the assembly cadence on the receiver.
    pub fps: u32,
    /// How long a received packet may wait in the intake queue.
    pub packet_ttl: Duration,
    /// Upper bound on queued packets; the oldest is evicted when full.
    pub queue_capacity: usize,
    /// `SO_RCVBUF` applied to the receive socket.
    pub recv_buffer_size: usize,
    /// `SO_SNDBUF` applied to the send socket.
    pub send_buffer_size: usize,
    /// Socket read timeout. Bounds how long the receive loop takes to notice
    /// a shutdown.
    pub receive_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            payload_type: DEFAULT_PAYLOAD_TYPE,
            ssrc: DEFAULT_SSRC,
            fps: 30,
            packet_ttl: Duration::from_millis(100),
            queue_capacity: 1024,
            recv_buffer_size: DEFAULT_SOCKET_BUFFER,
            send_buffer_size: DEFAULT_SOCKET_BUFFER,
            receive_timeout: Duration::from_millis(100),
        }
    }
}

impl StreamConfig {
    /// Reject values that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.mtu <= BASE_HEADER_SIZE {
            return Err(invalid(format!(
                "mtu {} must exceed the {BASE_HEADER_SIZE}-byte header",
                self.mtu
            )));
        }
        if self.mtu > 65_507 {
            return Err(invalid(format!("mtu {} exceeds a UDP datagram", self.mtu)));
        }
        if self.payload_type > 0x7f {
            return Err(invalid(format!(
                "payload type {} does not fit in 7 bits",
                self.payload_type
            )));
        }
        if self.fps == 0 || self.fps > 1000 {
            return Err(invalid(format!("fps {} outside 1..=1000", self.fps)));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue capacity must be non-zero".into()));
        }
        if self.packet_ttl.is_zero() {
            return Err(invalid("packet ttl must be non-zero".into()));
        }
        if self.receive_timeout.is_zero() {
            // A zero read timeout is rejected by the OS.
            return Err(invalid("receive timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// `1000 / fps` milliseconds.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }

    /// Payload bytes per packet: `mtu - 12`.
    pub fn max_payload(&self) -> usize {
        self.mtu.saturating_sub(BASE_HEADER_SIZE)
    }

    /// Timestamp increment per frame on a 90 kHz media clock.
    pub fn timestamp_increment(&self) -> u32 {
        90_000 / self.fps.max(1)
    }
}

fn invalid(msg: String) -> VidlinkError {
    VidlinkError::InvalidConfig(msg)
}
