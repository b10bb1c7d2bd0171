//! Handshake Engine
//!
//! Challenge/response exchange that runs before any application traffic:
//!
//! ```text
//! initiator                                  acceptor
//!   | -- hello { req_key } ------------------> |   res_key = H(req_key ‖ salt)
//!   | <------------- hello-ack { res_key, cid } |   cid minted here
//!   |   check res_key == H(req_key ‖ salt)      |
//! ```
//!
//! The salt is fixed and public. The derivation only proves both ends speak
//! the same protocol revision; access control belongs to the admission gate.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::events::ConnectionError;
use crate::protocol::{ControlMessage, Frame};

/// Derive the handshake response key: hex SHA-256 of `req_key ‖ salt`.
pub fn derive_key(req_key: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(req_key.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fresh random request key.
pub fn generate_req_key() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Fresh connection identifier.
pub fn generate_cid() -> String {
    Uuid::new_v4().to_string()
}

/// Progress of one side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Not started.
    Idle,
    /// Initiator sent `hello`, waiting for `hello-ack`.
    SentHello,
    /// Acceptor waiting for `hello`.
    WaitingHello,
    /// Completed.
    Acked,
    /// Rejected (mismatch or invalid frame).
    Aborted,
    /// Window expired.
    TimedOut,
}

fn describe(frame: &Frame) -> String {
    match frame {
        Frame::Control(message) => message.kind().to_string(),
        Frame::Application { event, .. } => format!("application event {event:?}"),
    }
}

// =============================================================================
// INITIATOR
// =============================================================================

/// Initiator half of the handshake.
#[derive(Debug, Clone)]
pub struct InitiatorHandshake {
    phase: HandshakePhase,
    req_key: String,
    expected: String,
}

impl InitiatorHandshake {
    /// Create with a random request key.
    pub fn new(salt: &str) -> Self {
        Self::with_req_key(generate_req_key(), salt)
    }

    /// Create with a given request key.
    pub fn with_req_key(req_key: String, salt: &str) -> Self {
        let expected = derive_key(&req_key, salt);
        Self {
            phase: HandshakePhase::Idle,
            req_key,
            expected,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Begin: returns the `hello` to send.
    pub fn start(&mut self) -> ControlMessage {
        self.phase = HandshakePhase::SentHello;
        ControlMessage::Hello {
            req_key: self.req_key.clone(),
        }
    }

    /// Process a frame received while waiting. Returns the adopted cid.
    pub fn receive(&mut self, frame: &Frame) -> Result<String, ConnectionError> {
        if self.phase != HandshakePhase::SentHello {
            return Err(self.abort(format!("unexpected {} before hello was sent", describe(frame))));
        }

        match frame {
            Frame::Control(ControlMessage::HelloAck { res_key, cid }) => {
                if *res_key != self.expected {
                    return Err(self.abort("response key mismatch".into()));
                }
                if cid.is_empty() {
                    return Err(self.abort("missing connection id".into()));
                }
                self.phase = HandshakePhase::Acked;
                Ok(cid.clone())
            }
            other => Err(self.abort(format!("expected hello-ack, got {}", describe(other)))),
        }
    }

    /// Window expired with no reply.
    pub fn expire(&mut self) {
        self.phase = HandshakePhase::TimedOut;
    }

    fn abort(&mut self, reason: String) -> ConnectionError {
        self.phase = HandshakePhase::Aborted;
        ConnectionError::HandshakeAborted(reason)
    }
}

// =============================================================================
// ACCEPTOR
// =============================================================================

/// Acceptor half of the handshake. Starts waiting immediately.
#[derive(Debug, Clone)]
pub struct AcceptorHandshake {
    phase: HandshakePhase,
}

impl Default for AcceptorHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceptorHandshake {
    /// Create, already waiting for `hello`.
    pub fn new() -> Self {
        Self {
            phase: HandshakePhase::WaitingHello,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Process a frame. On `hello`, returns the `hello-ack` to send.
    pub fn receive(
        &mut self,
        frame: &Frame,
        salt: &str,
    ) -> Result<ControlMessage, ConnectionError> {
        if self.phase != HandshakePhase::WaitingHello {
            self.phase = HandshakePhase::Aborted;
            return Err(ConnectionError::HandshakeAborted(format!(
                "unexpected {} after handshake",
                describe(frame)
            )));
        }

        match frame {
            Frame::Control(ControlMessage::Hello { req_key }) if !req_key.is_empty() => {
                self.phase = HandshakePhase::Acked;
                Ok(ControlMessage::HelloAck {
                    res_key: derive_key(req_key, salt),
                    cid: generate_cid(),
                })
            }
            other => {
                self.phase = HandshakePhase::Aborted;
                Err(ConnectionError::HandshakeAborted(format!(
                    "expected hello, got {}",
                    describe(other)
                )))
            }
        }
    }

    /// Window expired with no `hello`.
    pub fn expire(&mut self) {
        self.phase = HandshakePhase::TimedOut;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::state::DEFAULT_SALT;

    #[test]
    fn test_derive_key_deterministic() {
        let a = derive_key("abc", DEFAULT_SALT);
        let b = derive_key("abc", DEFAULT_SALT);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, derive_key("abd", DEFAULT_SALT));
        assert_ne!(a, derive_key("abc", "other-salt"));
    }

    #[test]
    fn test_handshake_success() {
        let mut initiator = InitiatorHandshake::new(DEFAULT_SALT);
        let mut acceptor = AcceptorHandshake::new();

        let hello = initiator.start();
        assert_eq!(initiator.phase(), HandshakePhase::SentHello);

        let ack = acceptor.receive(&Frame::Control(hello), DEFAULT_SALT).unwrap();
        assert_eq!(acceptor.phase(), HandshakePhase::Acked);

        let ControlMessage::HelloAck { cid: minted, .. } = ack.clone() else {
            panic!("acceptor must answer with hello-ack");
        };
        let adopted = initiator.receive(&Frame::Control(ack)).unwrap();
        assert_eq!(adopted, minted);
        assert_eq!(initiator.phase(), HandshakePhase::Acked);
    }

    #[test]
    fn test_salt_mismatch_aborts() {
        let mut initiator = InitiatorHandshake::new(DEFAULT_SALT);
        let mut acceptor = AcceptorHandshake::new();

        let hello = initiator.start();
        let ack = acceptor.receive(&Frame::Control(hello), "incompatible").unwrap();

        let result = initiator.receive(&Frame::Control(ack));
        assert!(matches!(result, Err(ConnectionError::HandshakeAborted(_))));
        assert_eq!(initiator.phase(), HandshakePhase::Aborted);
    }

    #[test]
    fn test_empty_cid_aborts() {
        let mut initiator = InitiatorHandshake::with_req_key("k".into(), DEFAULT_SALT);
        initiator.start();
        let ack = ControlMessage::HelloAck {
            res_key: derive_key("k", DEFAULT_SALT),
            cid: String::new(),
        };
        assert!(initiator.receive(&Frame::Control(ack)).is_err());
    }

    #[test]
    fn test_wrong_frames_abort() {
        let mut initiator = InitiatorHandshake::new(DEFAULT_SALT);
        initiator.start();
        let ping = Frame::Control(ControlMessage::Ping);
        assert!(initiator.receive(&ping).is_err());

        let mut acceptor = AcceptorHandshake::new();
        let app = Frame::Application {
            event: "move".into(),
            data: vec![],
        };
        assert!(acceptor.receive(&app, DEFAULT_SALT).is_err());
        assert_eq!(acceptor.phase(), HandshakePhase::Aborted);
    }

    #[test]
    fn test_second_hello_aborts() {
        let mut acceptor = AcceptorHandshake::new();
        let hello = Frame::Control(ControlMessage::Hello { req_key: "a".into() });
        acceptor.receive(&hello, DEFAULT_SALT).unwrap();
        assert!(acceptor.receive(&hello, DEFAULT_SALT).is_err());
    }

    #[test]
    fn test_cids_unique() {
        assert_ne!(generate_cid(), generate_cid());
        assert_ne!(generate_req_key(), generate_req_key());
    }
}
