//! # CWDTP
//!
//! Connection protocol for real-time game traffic over WebSocket.
//! Browsers give a WebSocket no application-visible handshake or liveness,
//! so both ends build their own on top of text frames.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          CWDTP                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  protocol/       - Wire format (pure)                        │
//! │  ├── value.rs    - Payload values, tagged binary encoding    │
//! │  └── envelope.rs - {event, meta, data} codec, control frames │
//! │                                                              │
//! │  connection/     - Protocol logic (sans-I/O)                 │
//! │  ├── state.rs    - States, roles, close codes, config        │
//! │  ├── handshake.rs- hello / hello-ack challenge               │
//! │  ├── heartbeat.rs- ping / pong liveness                      │
//! │  ├── events.rs   - Signals and errors                        │
//! │  └── machine.rs  - Connection state machine                  │
//! │                                                              │
//! │  network/        - Sockets and tasks                         │
//! │  ├── admission.rs- Path, origin, quota, verify_client        │
//! │  ├── auth.rs     - JWT verify_client hook                    │
//! │  ├── session.rs  - Per-connection driver task                │
//! │  ├── server.rs   - Accept loop and heartbeat sweep           │
//! │  └── client.rs   - Client connector                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection lifecycle
//!
//! The acceptor admits the socket, then both ends run the handshake. Once
//! OPEN, the acceptor pings on a shared sweep and the initiator answers;
//! either end may start the two-phase close. Every abnormal ending closes
//! the transport with its own 4xxx code.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod network;
pub mod protocol;

// Re-export commonly used types
pub use connection::{
    close_code, Connection, ConnectionError, ConnectionState, ProtocolConfig, Role, Signal,
};
pub use network::{
    connect, Accepted, AdmissionConfig, ConnectionHandle, CwdtpServer, ServerConfig,
};
pub use protocol::{BinaryKind, BinaryValue, Envelope, Value};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
