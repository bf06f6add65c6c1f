//! Peer wire protocol: handshake, message framing, and the per-connection
//! session state machine.
use thiserror::Error;

pub mod handshake;
pub mod message;
pub mod session;

/// Errors that end a peer session. None of these cross the session
/// boundary except [`PeerError::Store`], which the coordinator treats as
/// fatal to the whole process because backing-file integrity is gone.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    BadHandshake(String),

    #[error("handshake failed: info hash mismatch")]
    InfoHashMismatch,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("backing file error: {0}")]
    Store(std::io::Error),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
