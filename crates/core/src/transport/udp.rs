use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use socket2::SockRef;

use crate::config::StreamConfig;
use crate::error::{Result, VidlinkError};

/// Largest datagram a UDP socket can hand back.
pub const MAX_DATAGRAM: usize = 65_535;

/// Bind a receive socket and apply the configured buffer size and read
/// timeout.
///
/// The read timeout is what lets a receive loop notice a shutdown, so it is
/// always set.
pub fn bind_receiver<A: ToSocketAddrs>(addr: A, config: &StreamConfig) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    set_recv_buffer(&socket, config.recv_buffer_size);
    socket.set_read_timeout(Some(config.receive_timeout))?;
    tracing::debug!(local = %socket.local_addr()?, "receive socket bound");
    Ok(socket)
}

/// Bind a send socket. `0.0.0.0:0` picks an ephemeral port.
pub fn bind_sender<A: ToSocketAddrs>(addr: A) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    tracing::debug!(local = %socket.local_addr()?, "send socket bound");
    Ok(socket)
}

/// Resolve `host:port` to the first address it names.
pub fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| VidlinkError::InvalidConfig(format!("{addr} resolves to no address")))
}

/// Request `SO_RCVBUF`. The kernel may round or clamp it; failure is logged
/// and otherwise ignored.
pub fn set_recv_buffer(socket: &UdpSocket, size: usize) {
    if let Err(e) = SockRef::from(socket).set_recv_buffer_size(size) {
        tracing::warn!(error = %e, size, "failed to set receive buffer size");
    }
}

/// Request `SO_SNDBUF`. Same caveats as [`set_recv_buffer`].
pub fn set_send_buffer(socket: &UdpSocket, size: usize) {
    if let Err(e) = SockRef::from(socket).set_send_buffer_size(size) {
        tracing::warn!(error = %e, size, "failed to set send buffer size");
    }
}

/// Ensure `socket` has a finite read timeout, falling back to `fallback`.
pub(crate) fn ensure_read_timeout(socket: &UdpSocket, fallback: Duration) -> Result<()> {
    if socket.read_timeout()?.is_none() {
        socket.set_read_timeout(Some(fallback))?;
    }
    Ok(())
}
