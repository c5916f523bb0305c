use std::net::{SocketAddr, UdpSocket};

use parking_lot::Mutex;

use crate::config::StreamConfig;
use crate::error::{Result, VidlinkError};
use crate::packet::Fragmenter;

use super::udp::set_send_buffer;

/// Outcome of sending one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Fragments the frame was split into.
    pub packets: usize,
    /// Fragments handed to the socket.
    pub sent: usize,
    /// Fragments the socket refused.
    pub failed: usize,
    /// Datagram bytes written, headers included.
    pub bytes: usize,
}

/// Send side of the transport.
///
/// Fragments each encoded frame and writes every fragment as one datagram to
/// a fixed destination. The socket is attached with [`open`](Self::open) and
/// released with [`close`](Self::close); the sequence counter survives a
/// reopen.
pub struct PacketEgress {
    socket: Mutex<Option<UdpSocket>>,
    fragmenter: Mutex<Fragmenter>,
    destination: SocketAddr,
    send_buffer_size: usize,
}

impl PacketEgress {
    pub fn new(config: &StreamConfig, destination: SocketAddr) -> Result<Self> {
        let fragmenter = Fragmenter::new(config.payload_type, config.ssrc, config.mtu)?;
        Ok(Self {
            socket: Mutex::new(None),
            fragmenter: Mutex::new(fragmenter),
            destination,
            send_buffer_size: config.send_buffer_size,
        })
    }

    /// Attach a pre-created socket.
    pub fn open(&self, socket: UdpSocket) -> Result<()> {
        let mut slot = self.socket.lock();
        if slot.is_some() {
            return Err(VidlinkError::AlreadyOpen);
        }
        set_send_buffer(&socket, self.send_buffer_size);
        tracing::info!(
            local = ?socket.local_addr().ok(),
            destination = %self.destination,
            "egress opened"
        );
        *slot = Some(socket);
        Ok(())
    }

    /// Fragment `frame` and send each fragment.
    ///
    /// A fragment the socket refuses is logged and counted; the rest of the
    /// frame is still sent.
    pub fn send(&self, frame: &[u8], timestamp: u32) -> Result<SendReport> {
        let slot = self.socket.lock();
        let socket = slot.as_ref().ok_or(VidlinkError::NotOpen)?;
        let packets = self.fragmenter.lock().fragment(frame, timestamp);

        let mut report = SendReport {
            packets: packets.len(),
            ..SendReport::default()
        };
        for packet in &packets {
            match socket.send_to(&packet.to_bytes(), self.destination) {
                Ok(n) => {
                    report.sent += 1;
                    report.bytes += n;
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        seq = packet.sequence_number(),
                        timestamp,
                        error = %e,
                        "fragment send failed"
                    );
                }
            }
        }
        Ok(report)
    }

    /// Release the socket. Safe to call repeatedly.
    pub fn close(&self) {
        if self.socket.lock().take().is_some() {
            tracing::info!(destination = %self.destination, "egress closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.socket.lock().is_some()
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn ssrc(&self) -> u32 {
        self.fragmenter.lock().ssrc()
    }

    /// Sequence number the next fragment will carry.
    pub fn next_sequence(&self) -> u16 {
        self.fragmenter.lock().next_sequence()
    }
}

impl Drop for PacketEgress {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::decode;
    use std::time::Duration;

    fn receiver() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        socket
    }

    fn egress_to(rx: &UdpSocket, mtu: usize) -> PacketEgress {
        let config = StreamConfig {
            mtu,
            ..StreamConfig::default()
        };
        PacketEgress::new(&config, rx.local_addr().unwrap()).unwrap()
    }

    #[test]
    fn send_before_open_fails() {
        let rx = receiver();
        let egress = egress_to(&rx, 1400);
        assert!(matches!(egress.send(b"x", 1), Err(VidlinkError::NotOpen)));
    }

    #[test]
    fn open_twice_fails_until_closed() {
        let rx = receiver();
        let egress = egress_to(&rx, 1400);
        egress.open(UdpSocket::bind("127.0.0.1:0").unwrap()).unwrap();
        assert!(matches!(
            egress.open(UdpSocket::bind("127.0.0.1:0").unwrap()),
            Err(VidlinkError::AlreadyOpen)
        ));
        egress.close();
        egress.close();
        assert!(!egress.is_open());
        assert!(matches!(egress.send(b"x", 1), Err(VidlinkError::NotOpen)));
        egress.open(UdpSocket::bind("127.0.0.1:0").unwrap()).unwrap();
        assert!(egress.is_open());
    }

    #[test]
    fn frame_arrives_as_fragments() {
        let rx = receiver();
        let egress = egress_to(&rx, 112);
        egress.open(UdpSocket::bind("127.0.0.1:0").unwrap()).unwrap();

        let frame: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let report = egress.send(&frame, 3000).unwrap();
        assert_eq!(report.packets, 3);
        assert_eq!(report.sent, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.bytes, 250 + 3 * 12);

        let mut buf = [0u8; 2048];
        let mut payload = Vec::new();
        let mut seqs = Vec::new();
        for _ in 0..3 {
            let (n, _) = rx.recv_from(&mut buf).unwrap();
            let packet = decode(&buf[..n]).unwrap();
            assert_eq!(packet.timestamp(), 3000);
            seqs.push(packet.sequence_number());
            payload.extend_from_slice(packet.payload());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(payload.len(), frame.len());
        assert_eq!(egress.next_sequence(), 3);
    }

    #[test]
    fn refused_fragments_are_counted_and_the_frame_still_reports() {
        let config = StreamConfig {
            mtu: 112,
            ..StreamConfig::default()
        };
        // An IPv4 socket cannot reach an IPv6 destination, so every send_to fails.
        let egress = PacketEgress::new(&config, "[::1]:5004".parse().unwrap()).unwrap();
        egress.open(UdpSocket::bind("127.0.0.1:0").unwrap()).unwrap();

        let report = egress.send(&[0u8; 250], 1).unwrap();
        assert_eq!(
            report,
            SendReport {
                packets: 3,
                sent: 0,
                failed: 3,
                bytes: 0,
            }
        );
        assert_eq!(egress.next_sequence(), 3);

        // The counter keeps advancing across failed frames.
        let report = egress.send(&[0u8; 10], 2).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(egress.next_sequence(), 4);
    }
}
