//! Heartbeat Monitor
//!
//! The two ends play fixed, complementary parts:
//!
//! - **Acceptor** probes. A shared sweep calls [`Heartbeat::sweep`] on every
//!   open connection: a connection that answered the previous `ping` is
//!   pinged again, one that did not is reported dead.
//! - **Initiator** answers. Every `ping` is answered with `pong` at once and
//!   pushes the inactivity deadline out by one window. If the deadline
//!   passes the initiator gives up on its own.
//!
//! The deadline itself lives in the connection's timer slot; this type only
//! computes it.

use std::time::Duration;

use tokio::time::Instant;

use super::state::Role;
use crate::protocol::ControlMessage;

/// Result of one acceptor sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Peer answered since the last sweep; send this ping.
    Ping(ControlMessage),
    /// Peer never answered the last ping.
    Dead,
}

/// Per-connection liveness state.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    role: Role,
    window: Duration,
    alive: bool,
}

impl Heartbeat {
    /// Create for a role; `window` is the initiator inactivity window.
    pub fn new(role: Role, window: Duration) -> Self {
        Self {
            role,
            window,
            alive: false,
        }
    }

    /// Called on entering OPEN. Returns the initiator's first deadline.
    pub fn start(&mut self, now: Instant) -> Option<Instant> {
        match self.role {
            Role::Initiator => Some(now + self.window),
            Role::Acceptor => {
                self.mark_alive();
                None
            }
        }
    }

    /// Initiator: a `ping` arrived. Returns the reply and the new deadline.
    pub fn on_ping(&self, now: Instant) -> (ControlMessage, Instant) {
        (ControlMessage::Pong, now + self.window)
    }

    /// Acceptor: the peer proved liveness.
    pub fn mark_alive(&mut self) {
        self.alive = true;
    }

    /// Acceptor: whether the peer answered since the last sweep.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Acceptor: clear the flag and produce a `ping`.
    pub fn send_ping(&mut self) -> ControlMessage {
        self.alive = false;
        ControlMessage::Ping
    }

    /// Acceptor: one sweep step.
    pub fn sweep(&mut self) -> SweepOutcome {
        if self.is_alive() {
            SweepOutcome::Ping(self.send_ping())
        } else {
            SweepOutcome::Dead
        }
    }

    /// The inactivity window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_deadline() {
        let now = Instant::now();
        let mut heartbeat = Heartbeat::new(Role::Initiator, Duration::from_secs(30));
        assert_eq!(heartbeat.start(now), Some(now + Duration::from_secs(30)));

        let later = now + Duration::from_secs(10);
        let (reply, deadline) = heartbeat.on_ping(later);
        assert_eq!(reply, ControlMessage::Pong);
        assert_eq!(deadline, later + Duration::from_secs(30));
    }

    #[test]
    fn test_acceptor_sweep_cycle() {
        let mut heartbeat = Heartbeat::new(Role::Acceptor, Duration::from_secs(30));
        assert!(!heartbeat.is_alive());
        assert_eq!(heartbeat.start(Instant::now()), None);
        assert!(heartbeat.is_alive());

        assert_eq!(heartbeat.sweep(), SweepOutcome::Ping(ControlMessage::Ping));
        assert!(!heartbeat.is_alive());

        heartbeat.mark_alive();
        assert_eq!(heartbeat.sweep(), SweepOutcome::Ping(ControlMessage::Ping));

        // no pong since the last ping
        assert_eq!(heartbeat.sweep(), SweepOutcome::Dead);
    }
}
