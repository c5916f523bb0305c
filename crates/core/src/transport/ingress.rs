use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::error::{Result, VidlinkError};
use crate::packet::{self, Packet};

use super::intake::IntakeQueue;
use super::udp::{MAX_DATAGRAM, ensure_read_timeout};

/// Pause after an unexpected socket error before receiving again.
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Counters snapshot for a [`PacketIngress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressStats {
    /// Datagrams decoded and queued.
    pub received: u64,
    /// Datagrams that failed to decode.
    pub malformed: u64,
    /// Packets that outlived the TTL before being retrieved.
    pub expired: u64,
    /// Packets pushed out by a full queue.
    pub evicted: u64,
}

/// Receive side of the transport.
///
/// [`start_receiving`](Self::start_receiving) runs the blocking receive loop
/// on the caller's thread; consumers on other threads pull decoded packets
/// with [`retrieve`](Self::retrieve). Shared between the two through an
/// `Arc`.
pub struct PacketIngress {
    queue: IntakeQueue,
    running: AtomicBool,
    closed: AtomicBool,
    mtu: usize,
    receive_timeout: Duration,
    received: AtomicU64,
    malformed: AtomicU64,
}

impl PacketIngress {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            queue: IntakeQueue::new(config.packet_ttl, config.queue_capacity),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            mtu: config.mtu,
            receive_timeout: config.receive_timeout,
            received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Receive datagrams from `socket` until [`close`](Self::close) is
    /// called.
    ///
    /// Blocks the calling thread. Malformed datagrams are logged and
    /// skipped; other socket errors are logged and the loop keeps going.
    /// Returns `Ok(())` once closed, which happens within one read timeout
    /// of the call to `close`.
    pub fn start_receiving(&self, socket: UdpSocket) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VidlinkError::SocketClosed);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(VidlinkError::AlreadyRunning);
        }
        if let Err(e) = ensure_read_timeout(&socket, self.receive_timeout) {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        // A concurrent close() may have landed between the check and the swap.
        if self.closed.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
            return Err(VidlinkError::SocketClosed);
        }

        let local = socket.local_addr().ok();
        tracing::info!(local = ?local, ttl = ?self.queue.ttl(), "receiving packets");

        // Sized for any datagram so a sender with a larger MTU is not truncated.
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while self.running.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buf) {
                Ok((len, peer)) => match packet::decode(&buf[..len]) {
                    Ok(packet) => {
                        if len > self.mtu {
                            tracing::debug!(%peer, len, mtu = self.mtu, "datagram larger than configured mtu");
                        }
                        if self.queue.push(packet).is_err() {
                            break;
                        }
                        self.received.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.malformed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(%peer, len, error = %e, "dropping malformed datagram");
                    }
                },
                Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        tracing::warn!(error = %e, "UDP receive error");
                        thread::sleep(ERROR_BACKOFF);
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::debug!("receive loop exited");
        Ok(())
    }

    /// Block until an unexpired packet is available.
    pub fn retrieve(&self) -> Result<Packet> {
        self.queue.retrieve()
    }

    /// Block for at most `timeout`. `Ok(None)` if nothing arrived in time.
    pub fn retrieve_timeout(&self, timeout: Duration) -> Result<Option<Packet>> {
        self.queue.retrieve_timeout(timeout)
    }

    /// Stop the receive loop and wake every blocked consumer.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("ingress closing");
        }
        self.running.store(false, Ordering::SeqCst);
        self.queue.close();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> IngressStats {
        let (expired, evicted) = self.queue.drop_counts();
        IngressStats {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            expired,
            evicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn config() -> StreamConfig {
        StreamConfig {
            receive_timeout: Duration::from_millis(20),
            packet_ttl: Duration::from_secs(2),
            ..StreamConfig::default()
        }
    }

    fn spawn_loop(ingress: &Arc<PacketIngress>, socket: UdpSocket) -> thread::JoinHandle<Result<()>> {
        let ingress = ingress.clone();
        thread::spawn(move || ingress.start_receiving(socket))
    }

    fn wait_running(ingress: &PacketIngress) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !ingress.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn receives_and_skips_malformed() {
        let ingress = Arc::new(PacketIngress::new(&config()));
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = spawn_loop(&ingress, socket);
        wait_running(&ingress);

        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(&[0u8; 5], addr).unwrap();
        let packet = Packet::new(96, 42, 9000, 7, b"frame".to_vec(), true);
        tx.send_to(&packet.to_bytes(), addr).unwrap();

        let got = ingress.retrieve_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(got, packet);

        ingress.close();
        handle.join().unwrap().unwrap();
        let stats = ingress.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.malformed, 1);
    }

    #[test]
    fn datagrams_above_the_mtu_arrive_whole() {
        let ingress = Arc::new(PacketIngress::new(&config()));
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = spawn_loop(&ingress, socket);
        wait_running(&ingress);

        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();
        let packet = Packet::new(96, 1, 1800, 7, payload, true);
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(&packet.to_bytes(), addr).unwrap();

        let got = ingress.retrieve_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(got.payload().len(), 3000);
        assert_eq!(got, packet);

        ingress.close();
        handle.join().unwrap().unwrap();
        assert_eq!(ingress.stats().malformed, 0);
    }

    #[test]
    fn close_stops_loop_within_timeout() {
        let ingress = Arc::new(PacketIngress::new(&config()));
        let handle = spawn_loop(&ingress, UdpSocket::bind("127.0.0.1:0").unwrap());
        wait_running(&ingress);

        let start = Instant::now();
        ingress.close();
        handle.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!ingress.is_running());
    }

    #[test]
    fn second_loop_is_rejected() {
        let ingress = Arc::new(PacketIngress::new(&config()));
        let handle = spawn_loop(&ingress, UdpSocket::bind("127.0.0.1:0").unwrap());
        wait_running(&ingress);

        let again = ingress.start_receiving(UdpSocket::bind("127.0.0.1:0").unwrap());
        assert!(matches!(again, Err(VidlinkError::AlreadyRunning)));

        ingress.close();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn retrieve_after_close_fails() {
        let ingress = PacketIngress::new(&config());
        ingress.close();
        assert!(matches!(ingress.retrieve(), Err(VidlinkError::SocketClosed)));
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(matches!(
            ingress.start_receiving(socket),
            Err(VidlinkError::SocketClosed)
        ));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let ingress = Arc::new(PacketIngress::new(&config()));
        let consumer = {
            let ingress = ingress.clone();
            thread::spawn(move || ingress.retrieve())
        };
        thread::sleep(Duration::from_millis(20));
        ingress.close();
        assert!(matches!(
            consumer.join().unwrap(),
            Err(VidlinkError::SocketClosed)
        ));
    }
}
