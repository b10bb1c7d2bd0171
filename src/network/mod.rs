//! Network Layer
//!
//! Everything that touches sockets: the admission gate, the per-connection
//! driver task, the server accept loop and the client connector.
//! The protocol logic itself lives in `connection/`.

pub mod admission;
pub mod auth;
pub mod client;
pub mod server;
pub mod session;

pub use admission::{
    AdmissionConfig, AdmissionError, AdmissionGate, AdmissionPermit, ConnectionRequest, Verdict,
    VerifyClient,
};
pub use auth::{token_verifier, AuthConfig, AuthError, TokenClaims};
pub use client::{connect, ClientError};
pub use server::{Accepted, AcceptedReceiver, CwdtpServer, ServerConfig, ServerError};
pub use session::{spawn_connection, ConnectionHandle, SignalReceiver};
