//! Datagram socket seam.
//!
//! The endpoint only needs `send_to` and a `recv_from` that returns
//! periodically so the receive loop can notice shutdown. `std::net::UdpSocket`
//! with a read timeout satisfies both; tests wrap it to drop or reorder
//! datagrams.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// How long a blocking receive waits before the loop re-checks liveness.
pub const RECV_TIMEOUT_MS: u64 = 100;

pub trait DatagramSocket: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Must return (`WouldBlock` or `TimedOut` is fine) within a bounded time.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Bind a UDP socket with the receive timeout the endpoint expects.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_read_timeout(Some(Duration::from_millis(RECV_TIMEOUT_MS)))?;
    Ok(socket)
}

/// Errors the receive loop treats as "nothing arrived".
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
