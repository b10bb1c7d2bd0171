//! Connection Signals and Errors
//!
//! Everything a connection reports to its owner. Signals are a closed enum
//! so handlers can match exhaustively.

use thiserror::Error;

use crate::protocol::{CodecError, Value};

/// Connection-level errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Application tried to send a reserved control event.
    #[error("event name is reserved: {0}")]
    ReservedEventName(String),

    /// Application tried to send an event with an empty name.
    #[error("event name is empty")]
    EmptyEventName,

    /// Handshake response mismatch or invalid handshake frame.
    #[error("handshake aborted: {0}")]
    HandshakeAborted(String),

    /// No handshake reply within the window.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Peer stopped proving liveness.
    #[error("ping timed out")]
    PingTimeout,

    /// No close acknowledgement within the window.
    #[error("close timed out")]
    CloseTimeout,

    /// Operation requires an open connection.
    #[error("connection is not open")]
    NotConnected,

    /// Transport closed before the handshake completed.
    #[error("connection reset before handshake completed")]
    ConnectionReset,

    /// Transport negotiated the wrong subprotocol.
    #[error("invalid negotiated subprotocol: {0:?}")]
    InvalidSubprotocol(Option<String>),

    /// Peer sent a binary frame.
    #[error("unexpected binary frame")]
    UnexpectedBinaryFrame,

    /// Peer sent a frame that is not valid in the current state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Peer sent a frame that failed to decode.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Signals surfaced to the owner of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Handshake completed; carries the connection id.
    Connected {
        /// Connection identifier.
        cid: String,
    },
    /// Application event received.
    Message {
        /// Event name.
        event: String,
        /// Payload values.
        data: Vec<Value>,
    },
    /// Local close requested; waiting for acknowledgement.
    Closing,
    /// Connection closed.
    Closed {
        /// Whether the close was due to an error.
        error: bool,
        /// Close reason.
        reason: String,
    },
    /// Protocol violation or transport failure.
    Error(ConnectionError),
    /// Heartbeat window elapsed.
    PingTimeout,
    /// Handshake window elapsed.
    HandshakeTimeout,
    /// Close acknowledgement window elapsed.
    CloseTimeout,
}
