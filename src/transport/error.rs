use std::{io, net::SocketAddr};

use thiserror::Error;

use super::identity::MalformedIdentity;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed connection identity: {0}")]
    MalformedIdentity(#[from] MalformedIdentity),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),

    #[error("timed out waiting for handshake message")]
    HandshakeTimeout,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("communication stack mismatch: {0}")]
    StackMismatch(String),

    #[error("maximum of {max} connected clients exceeded")]
    MaxConnectionsExceeded { max: usize },

    #[error("reconnection rejected: {0}")]
    ReconnectionRejected(String),

    #[error("server is busy: {0}")]
    ConnectionBusy(String),

    #[error("received unexpected message while {0}")]
    UnexpectedMessage(&'static str),

    #[error("contract violation: {0}")]
    ContractViolation(&'static str),

    #[error("no candidate addresses to connect to")]
    NoAddresses,

    #[error("transport is closed")]
    TransportClosed,

    #[error("transport is not connected")]
    NotConnected,

    #[error("pending message queue is full ({0} messages)")]
    QueueFull(usize),

    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),

    #[error("could not encode message")]
    CouldNotEncodeMessage,

    #[error("could not decode message")]
    CouldNotDecodeMessage,

    #[error("frame length {0} exceeds the allowed maximum")]
    MessageLengthOverflowed(u32),
}

impl Error {
    /// Transient errors are worth retrying against the next candidate
    /// address or in the next reconnect round.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectTimeout(_)
                | Error::HandshakeTimeout
                | Error::ConnectionClosed
                | Error::ConnectionBusy(_)
        )
    }

    /// Terminal errors stop every further attempt of the current operation,
    /// whatever address would come next.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::StackMismatch(_)
                | Error::ReconnectionRejected(_)
                | Error::ContractViolation(_)
                | Error::TransportClosed
        )
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::HandshakeTimeout
    }
}
