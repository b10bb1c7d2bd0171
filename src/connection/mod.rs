//! Connection Layer
//!
//! The CWDTP state machine and its parts. Everything here is sans-I/O:
//! the network layer feeds frames and timer expiries in and carries the
//! resulting outputs to the WebSocket.

pub mod events;
pub mod handshake;
pub mod heartbeat;
pub mod machine;
pub mod state;

pub use events::{ConnectionError, Signal};
pub use handshake::{derive_key, AcceptorHandshake, HandshakePhase, InitiatorHandshake};
pub use heartbeat::{Heartbeat, SweepOutcome};
pub use machine::{validate_event_name, Connection, Output, Timer, TimerKind};
pub use state::{close_code, ConnectionState, ProtocolConfig, Role, DEFAULT_SALT, SUBPROTOCOL};
