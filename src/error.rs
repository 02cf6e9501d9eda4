//! Error types for the relay engine.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the relay engine.
///
/// Only `Config` and `Bind` terminate the process; everything else is
/// absorbed where it occurs. The engine prefers dropping a datagram over
/// aborting a running session.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid CLI flags or settings-file values. Fatal before startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A socket could not be bound. Fatal during startup.
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// An I/O fault on an already-running socket.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Process exit code for startup failures. Clean shutdown exits 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::Config(_) => 2,
            RelayError::Bind { .. } => 3,
            RelayError::Io(_) => 1,
        }
    }
}
