//! Thin UDP socket layer.
//!
//! All engine sockets are non-blocking `mio` sockets driven by one poll per
//! engine; "receive with timeout" is the poll timeout plus a read that
//! reports *no datagram* distinctly from data.

use std::io;
use std::net::SocketAddr;

use mio::net::UdpSocket;

use crate::error::RelayError;

/// Outcome classification for a socket I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    /// Retry on the next loop tick; nothing is torn down.
    Transient,
    /// Propagate to the supervisor loop.
    Fatal,
}

/// Bind a non-blocking UDP socket, mapping failure to a startup-fatal error.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, RelayError> {
    UdpSocket::bind(addr).map_err(|source| RelayError::Bind { addr, source })
}

/// Receive one datagram if available.
///
/// Returns `Ok(None)` when the socket has nothing to read (the poll-timeout
/// tick), `Ok(Some(..))` for a datagram, and `Err` for real faults.
pub fn try_recv_from(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<Option<(usize, SocketAddr)>> {
    match socket.recv_from(buf) {
        Ok((len, from)) => Ok(Some((len, from))),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// Classify a socket error from a running engine.
///
/// UDP sends can surface `ConnectionRefused` from a prior ICMP port
/// unreachable; the destination may simply not be up yet, so it is retried
/// like any other transient fault.
pub fn classify(e: &io::Error) -> IoClass {
    match e.kind() {
        io::ErrorKind::WouldBlock
        | io::ErrorKind::Interrupted
        | io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset => IoClass::Transient,
        _ => IoClass::Fatal,
    }
}
