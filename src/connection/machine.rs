//! Connection State Machine
//!
//! Owns one connection's lifecycle:
//!
//! ```text
//!            hello / hello-ack
//! OPENING ─────────────────────▶ OPEN ──disconnect()──▶ CLOSING
//!    │                             │                       │
//!    │ timeout / violation         │ close from peer       │ close-ack / timeout
//!    ▼                             ▼                       ▼
//! TIMED_OUT | ERROR             CLOSED            CLOSED | TIMED_OUT
//! ```
//!
//! The machine performs no I/O. Inputs are received frames, commands and
//! timer expiries, each stamped with `now`; outputs (frames to transmit,
//! transport close requests, signals) queue up for the driver to drain.
//!
//! A connection holds at most one timer: handshake, heartbeat or close.
//! Every transition overwrites or clears the slot, so a timer armed by a
//! state never outlives it.

use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::events::{ConnectionError, Signal};
use super::handshake::{AcceptorHandshake, InitiatorHandshake};
use super::heartbeat::{Heartbeat, SweepOutcome};
use super::state::{close_code, ConnectionState, ProtocolConfig, Role};
use crate::protocol::{
    is_reserved_event, ControlMessage, Envelope, Frame, FrameError, Meta, Value,
};

/// Which phase armed the connection's timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Handshake window.
    Handshake,
    /// Initiator inactivity window.
    Heartbeat,
    /// Close acknowledgement window.
    Close,
}

/// The connection's single live timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    /// Phase that armed it.
    pub kind: TimerKind,
    /// When it fires.
    pub deadline: Instant,
}

/// Work produced by the machine for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Send a text frame.
    Transmit(String),
    /// Close the transport with this code and reason.
    CloseTransport {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Report to the connection owner.
    Signal(Signal),
}

#[derive(Debug, Clone)]
enum HandshakeSide {
    Initiator(InitiatorHandshake),
    Acceptor(AcceptorHandshake),
}

/// Parameters of a locally requested close.
#[derive(Debug, Clone)]
struct CloseRequest {
    code: u16,
    reason: String,
    error: bool,
}

/// Check an application event name before it may be sent.
pub fn validate_event_name(event: &str) -> Result<(), ConnectionError> {
    if event.is_empty() {
        return Err(ConnectionError::EmptyEventName);
    }
    if is_reserved_event(event) {
        return Err(ConnectionError::ReservedEventName(event.to_string()));
    }
    Ok(())
}

/// One CWDTP connection.
#[derive(Debug)]
pub struct Connection {
    role: Role,
    state: ConnectionState,
    id: Option<String>,
    config: ProtocolConfig,
    handshake: HandshakeSide,
    heartbeat: Heartbeat,
    timer: Option<Timer>,
    close_request: Option<CloseRequest>,
    outputs: VecDeque<Output>,
}

impl Connection {
    /// Create the initiating side and send `hello`.
    pub fn initiator(config: ProtocolConfig, now: Instant) -> Self {
        let handshake = InitiatorHandshake::new(&config.salt);
        let mut conn = Self::new(Role::Initiator, config, HandshakeSide::Initiator(handshake), now);
        if let HandshakeSide::Initiator(handshake) = &mut conn.handshake {
            let hello = handshake.start();
            conn.transmit(&hello);
        }
        conn
    }

    /// Create the accepting side, waiting for `hello`.
    pub fn acceptor(config: ProtocolConfig, now: Instant) -> Self {
        Self::new(
            Role::Acceptor,
            config,
            HandshakeSide::Acceptor(AcceptorHandshake::new()),
            now,
        )
    }

    fn new(role: Role, config: ProtocolConfig, handshake: HandshakeSide, now: Instant) -> Self {
        let heartbeat = Heartbeat::new(role, config.heartbeat_timeout);
        let timer = Some(Timer {
            kind: TimerKind::Handshake,
            deadline: now + config.handshake_timeout,
        });
        Self {
            role,
            state: ConnectionState::Opening,
            id: None,
            config,
            handshake,
            heartbeat,
            timer,
            close_request: None,
            outputs: VecDeque::new(),
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// This end's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Connection id, once the handshake completed.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The live timer, if any.
    pub fn timer(&self) -> Option<Timer> {
        self.timer
    }

    /// When the live timer fires, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.map(|t| t.deadline)
    }

    /// Whether the connection reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Take the next queued output.
    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    /// Take every queued output.
    pub fn drain_outputs(&mut self) -> Vec<Output> {
        self.outputs.drain(..).collect()
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Send an application event.
    pub fn send(&mut self, event: &str, data: Vec<Value>) -> Result<(), ConnectionError> {
        validate_event_name(event)?;
        if self.state != ConnectionState::Open {
            return Err(ConnectionError::NotConnected);
        }
        let text = Envelope::new(event, Meta::new(), data).encode()?;
        self.outputs.push_back(Output::Transmit(text));
        Ok(())
    }

    /// Begin the two-phase close: send `close` and wait for `close-ack`.
    pub fn disconnect(
        &mut self,
        code: u16,
        reason: impl Into<String>,
        error: bool,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Open {
            return Err(ConnectionError::NotConnected);
        }
        let reason = reason.into();
        self.transmit(&ControlMessage::Close {
            error,
            reason: reason.clone(),
        });
        self.close_request = Some(CloseRequest { code, reason, error });
        self.timer = Some(Timer {
            kind: TimerKind::Close,
            deadline: now + self.config.close_timeout,
        });
        self.state = ConnectionState::Closing;
        self.signal(Signal::Closing);
        Ok(())
    }

    /// Close the transport immediately, without a close handshake.
    pub fn terminate(&mut self, code: u16, reason: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let reason = reason.into();
        self.finish(ConnectionState::Closed, Some((code, reason.clone())));
        self.signal(Signal::Closed {
            error: code != close_code::NORMAL,
            reason,
        });
    }

    /// The transport negotiated the wrong subprotocol.
    pub fn reject_subprotocol(&mut self, negotiated: Option<String>) {
        self.fail(
            close_code::INVALID_SUBPROTOCOL,
            ConnectionError::InvalidSubprotocol(negotiated),
        );
    }

    // =========================================================================
    // HEARTBEAT PRIMITIVES (acceptor)
    // =========================================================================

    /// Record that the peer proved liveness.
    pub fn mark_alive(&mut self) {
        self.heartbeat.mark_alive();
    }

    /// Whether the peer answered since the last ping.
    pub fn is_alive(&self) -> bool {
        self.heartbeat.is_alive()
    }

    /// Send a `ping` and clear the alive flag.
    pub fn send_ping(&mut self) -> Result<(), ConnectionError> {
        if self.role != Role::Acceptor || self.state != ConnectionState::Open {
            return Err(ConnectionError::NotConnected);
        }
        let ping = self.heartbeat.send_ping();
        self.transmit(&ping);
        Ok(())
    }

    /// One step of the shared heartbeat sweep. Open acceptors only.
    pub fn heartbeat_sweep(&mut self) {
        if self.role != Role::Acceptor || self.state != ConnectionState::Open {
            return;
        }
        match self.heartbeat.sweep() {
            SweepOutcome::Ping(ping) => self.transmit(&ping),
            SweepOutcome::Dead => {
                warn!(cid = ?self.id, "peer missed heartbeat");
                self.time_out(
                    close_code::PING_TIMEOUT,
                    ConnectionError::PingTimeout,
                    Signal::PingTimeout,
                );
            }
        }
    }

    // =========================================================================
    // INPUTS
    // =========================================================================

    /// A text frame arrived.
    pub fn handle_text(&mut self, text: &str, now: Instant) {
        if self.is_terminal() {
            return;
        }
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(cid = ?self.id, error = %e, "rejecting undecodable frame");
                self.violation(e);
                return;
            }
        };

        match self.state {
            ConnectionState::Opening => self.handle_handshake_frame(frame, now),
            ConnectionState::Open | ConnectionState::Closing => self.handle_open_frame(frame, now),
            _ => {}
        }
    }

    /// A binary frame arrived. CWDTP only speaks text.
    pub fn handle_binary(&mut self) {
        if self.is_terminal() {
            return;
        }
        let code = self.violation_code();
        self.fail(code, ConnectionError::UnexpectedBinaryFrame);
    }

    /// The transport closed underneath the connection.
    pub fn handle_transport_closed(&mut self, code: Option<u16>, reason: &str) {
        match self.state {
            ConnectionState::Opening => {
                self.finish(ConnectionState::Error, None);
                self.signal(Signal::Error(ConnectionError::ConnectionReset));
            }
            ConnectionState::Open | ConnectionState::Closing => {
                let reason = match code {
                    Some(code) if reason.is_empty() => format!("transport closed ({code})"),
                    Some(code) => format!("transport closed ({code}): {reason}"),
                    None => "transport closed".to_string(),
                };
                self.finish(ConnectionState::Closed, None);
                self.signal(Signal::Closed { error: true, reason });
            }
            _ => {}
        }
    }

    /// The transport failed.
    pub fn handle_transport_error(&mut self, error: String) {
        if self.is_terminal() {
            return;
        }
        self.finish(ConnectionState::Error, None);
        self.signal(Signal::Error(ConnectionError::Transport(error)));
    }

    /// Fire the timer if its deadline has passed.
    pub fn handle_timeout(&mut self, now: Instant) {
        let Some(timer) = self.timer else {
            return;
        };
        if now < timer.deadline || self.is_terminal() {
            return;
        }

        match timer.kind {
            TimerKind::Handshake => {
                match &mut self.handshake {
                    HandshakeSide::Initiator(h) => h.expire(),
                    HandshakeSide::Acceptor(h) => h.expire(),
                }
                warn!(role = ?self.role, "handshake timed out");
                self.time_out(
                    close_code::HANDSHAKE_TIMEOUT,
                    ConnectionError::HandshakeTimeout,
                    Signal::HandshakeTimeout,
                );
            }
            TimerKind::Heartbeat => {
                warn!(cid = ?self.id, "no ping within heartbeat window");
                self.time_out(
                    close_code::PING_TIMEOUT,
                    ConnectionError::PingTimeout,
                    Signal::PingTimeout,
                );
            }
            TimerKind::Close => {
                warn!(cid = ?self.id, "close was never acknowledged");
                self.time_out(
                    close_code::CLOSE_TIMEOUT,
                    ConnectionError::CloseTimeout,
                    Signal::CloseTimeout,
                );
            }
        }
    }

    // =========================================================================
    // FRAME HANDLING
    // =========================================================================

    fn handle_handshake_frame(&mut self, frame: Frame, now: Instant) {
        let result = match &mut self.handshake {
            HandshakeSide::Initiator(h) => h.receive(&frame).map(|cid| (cid, None)),
            HandshakeSide::Acceptor(h) => h.receive(&frame, &self.config.salt).map(|ack| {
                let cid = match &ack {
                    ControlMessage::HelloAck { cid, .. } => cid.clone(),
                    _ => String::new(),
                };
                (cid, Some(ack))
            }),
        };

        match result {
            Ok((cid, reply)) => {
                if let Some(ack) = reply {
                    self.transmit(&ack);
                }
                self.open(cid, now);
            }
            Err(e) => {
                warn!(role = ?self.role, error = %e, "handshake aborted");
                self.fail(close_code::HANDSHAKE_ABORTED, e);
            }
        }
    }

    fn open(&mut self, cid: String, now: Instant) {
        debug!(role = ?self.role, cid = %cid, "connection open");
        self.id = Some(cid.clone());
        self.state = ConnectionState::Open;
        self.timer = self.heartbeat.start(now).map(|deadline| Timer {
            kind: TimerKind::Heartbeat,
            deadline,
        });
        self.signal(Signal::Connected { cid });
    }

    fn handle_open_frame(&mut self, frame: Frame, now: Instant) {
        let message = match frame {
            Frame::Application { event, data } => {
                self.signal(Signal::Message { event, data });
                return;
            }
            Frame::Control(message) => message,
        };

        match (self.role, message) {
            (Role::Initiator, ControlMessage::Ping) => {
                let (pong, deadline) = self.heartbeat.on_ping(now);
                self.transmit(&pong);
                if self.state == ConnectionState::Open {
                    self.timer = Some(Timer {
                        kind: TimerKind::Heartbeat,
                        deadline,
                    });
                }
            }
            (Role::Acceptor, ControlMessage::Pong) => self.heartbeat.mark_alive(),
            (_, ControlMessage::Close { error, reason }) => {
                self.transmit(&ControlMessage::CloseAck);
                self.finish(
                    ConnectionState::Closed,
                    Some((close_code::NORMAL, reason.clone())),
                );
                self.signal(Signal::Closed { error, reason });
            }
            (_, ControlMessage::CloseAck) if self.state == ConnectionState::Closing => {
                let request = self.close_request.take().unwrap_or(CloseRequest {
                    code: close_code::NORMAL,
                    reason: String::new(),
                    error: false,
                });
                self.finish(
                    ConnectionState::Closed,
                    Some((request.code, request.reason.clone())),
                );
                self.signal(Signal::Closed {
                    error: request.error,
                    reason: request.reason,
                });
            }
            (role, other) => {
                let reason = format!("unexpected {} for {role:?} in {}", other.kind(), self.state);
                self.fail(close_code::PROTOCOL_ERROR, ConnectionError::ProtocolViolation(reason));
            }
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn violation_code(&self) -> u16 {
        if self.state == ConnectionState::Opening {
            close_code::HANDSHAKE_ABORTED
        } else {
            close_code::PROTOCOL_ERROR
        }
    }

    fn violation(&mut self, error: FrameError) {
        let code = self.violation_code();
        let cause = match (self.state, error) {
            (ConnectionState::Opening, e) => ConnectionError::HandshakeAborted(e.to_string()),
            (_, FrameError::Codec(e)) => ConnectionError::Codec(e),
            (_, e @ FrameError::ReservedCollision(_)) => {
                ConnectionError::ProtocolViolation(e.to_string())
            }
        };
        self.fail(code, cause);
    }

    fn fail(&mut self, code: u16, cause: ConnectionError) {
        if self.is_terminal() {
            return;
        }
        self.finish(ConnectionState::Error, Some((code, cause.to_string())));
        self.signal(Signal::Error(cause));
    }

    /// Expire into `TimedOut`. The cause's text becomes the close reason.
    fn time_out(&mut self, code: u16, cause: ConnectionError, signal: Signal) {
        self.finish(ConnectionState::TimedOut, Some((code, cause.to_string())));
        self.signal(signal);
    }

    /// Enter a terminal state: cancel the timer and optionally close the transport.
    fn finish(&mut self, state: ConnectionState, close: Option<(u16, String)>) {
        self.timer = None;
        self.close_request = None;
        self.state = state;
        if let Some((code, reason)) = close {
            self.outputs.push_back(Output::CloseTransport { code, reason });
        }
    }

    fn transmit(&mut self, message: &ControlMessage) {
        self.outputs.push_back(Output::Transmit(encode_control(message)));
    }

    fn signal(&mut self, signal: Signal) {
        self.outputs.push_back(Output::Signal(signal));
    }
}

fn encode_control(message: &ControlMessage) -> String {
    // Control envelopes hold only strings and an empty data array.
    message
        .encode()
        .unwrap_or_else(|_| format!(r#"{{"event":"{}","meta":{{}},"data":[]}}"#, message.kind()))
}
