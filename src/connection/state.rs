//! Connection States, Roles and Close Codes

use std::fmt;
use std::time::Duration;

/// Lifecycle state of a connection.
///
/// `Opening` is the only initial state. `Closed`, `TimedOut` and `Error`
/// are terminal: nothing leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Handshake in progress.
    Opening,
    /// Handshake complete, application traffic flowing.
    Open,
    /// Close requested locally, waiting for the acknowledgement.
    Closing,
    /// Closed (gracefully or by terminate).
    Closed,
    /// A handshake, heartbeat or close timer expired.
    TimedOut,
    /// Protocol violation.
    Error,
}

impl ConnectionState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Closed | ConnectionState::TimedOut | ConnectionState::Error
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Opening => "OPENING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::TimedOut => "TIMED_OUT",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Which end of the connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Opens the connection and sends `hello` (the client).
    Initiator,
    /// Accepts the connection and mints the connection id (the server).
    Acceptor,
}

/// WebSocket close codes used by CWDTP.
///
/// Each abnormal cause has its own code so observers can tell causes apart
/// from the transport close alone.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (server shutdown).
    pub const GOING_AWAY: u16 = 1001;

    /// Handshake response did not match, or handshake frame was invalid.
    pub const HANDSHAKE_ABORTED: u16 = 4000;
    /// Transport negotiated a subprotocol other than `cwdtp`.
    pub const INVALID_SUBPROTOCOL: u16 = 4001;
    /// No handshake reply within the window.
    pub const HANDSHAKE_TIMEOUT: u16 = 4002;
    /// No close acknowledgement within the window.
    pub const CLOSE_TIMEOUT: u16 = 4003;
    /// Peer stopped proving liveness.
    pub const PING_TIMEOUT: u16 = 4004;
    /// Any other protocol violation after the handshake.
    pub const PROTOCOL_ERROR: u16 = 4005;

    /// Requested path is not served.
    pub const PATH_MISMATCH: u16 = 4100;
    /// Origin not allowed.
    pub const ORIGIN_REJECTED: u16 = 4101;
    /// Too many connections from this source.
    pub const QUOTA_EXCEEDED: u16 = 4102;
    /// Server connection limit reached.
    pub const SERVER_FULL: u16 = 4103;
    /// `verify_client` denied the request.
    pub const UNAUTHORIZED: u16 = 4104;
    /// `verify_client` failed internally.
    pub const VERIFY_FAILED: u16 = 4105;
}

/// WebSocket subprotocol name negotiated for CWDTP.
pub const SUBPROTOCOL: &str = "cwdtp";

/// Fixed handshake salt. Public: it checks protocol compatibility only.
pub const DEFAULT_SALT: &str = "cwdtp/1:7d1b0c52-5f0e-4c8e-9a43-2f6e1f0b9d17";

/// Protocol timing and handshake parameters.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Time allowed for the handshake to complete.
    pub handshake_timeout: Duration,
    /// Initiator inactivity window between pings.
    pub heartbeat_timeout: Duration,
    /// Time allowed for a close acknowledgement.
    pub close_timeout: Duration,
    /// Salt mixed into the handshake key derivation.
    pub salt: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(30),
            salt: DEFAULT_SALT.to_string(),
        }
    }
}

impl ProtocolConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let secs = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let defaults = Self::default();
        Self {
            handshake_timeout: secs("CWDTP_HANDSHAKE_TIMEOUT_SECS", defaults.handshake_timeout),
            heartbeat_timeout: secs("CWDTP_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout),
            close_timeout: secs("CWDTP_CLOSE_TIMEOUT_SECS", defaults.close_timeout),
            salt: defaults.salt,
        }
    }
}
