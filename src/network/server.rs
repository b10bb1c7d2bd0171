//! CWDTP Server
//!
//! Async WebSocket server for the accepting side.
//! Runs admission, hands accepted connections to the application and
//! drives the shared heartbeat sweep.

use futures_util::future::join_all;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::{close_code, Connection, ProtocolConfig, SUBPROTOCOL};
use crate::network::admission::{AdmissionConfig, AdmissionGate, ConnectionRequest};
use crate::network::session::{
    close_reason, spawn_admitted, spawn_connection, ConnectionHandle, SignalReceiver,
};

/// Accepted connections waiting for the application.
const ACCEPT_BUFFER: usize = 64;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Period of the acceptor heartbeat sweep. Must be shorter than
    /// `protocol.heartbeat_timeout` or healthy initiators time out between
    /// pings.
    pub heartbeat_interval: Duration,
    /// Timeouts and salt for every connection.
    pub protocol: ProtocolConfig,
    /// Admission rules.
    pub admission: AdmissionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let protocol = ProtocolConfig::default();
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            heartbeat_interval: protocol.heartbeat_timeout / 2,
            protocol,
            admission: AdmissionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let protocol = ProtocolConfig::from_env();
        let fallback = protocol.heartbeat_timeout / 2;
        let heartbeat_interval = match std::env::var("CWDTP_HEARTBEAT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
        {
            Some(period) if sweep_period_fits(period, &protocol) => period,
            Some(period) => {
                warn!(
                    "Heartbeat interval {:?} must be below the {:?} window, using {:?}",
                    period, protocol.heartbeat_timeout, fallback
                );
                fallback
            }
            None => fallback,
        };
        let bind_addr = std::env::var("CWDTP_BIND_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Self::default().bind_addr);

        Self {
            bind_addr,
            heartbeat_interval,
            protocol,
            admission: AdmissionConfig::from_env(),
        }
    }

    /// Check that the sweep can keep initiators alive.
    pub fn validate(&self) -> Result<(), ServerError> {
        if sweep_period_fits(self.heartbeat_interval, &self.protocol) {
            Ok(())
        } else {
            Err(ServerError::InvalidConfig(format!(
                "heartbeat interval {:?} must be non-zero and below the {:?} window",
                self.heartbeat_interval, self.protocol.heartbeat_timeout
            )))
        }
    }
}

fn sweep_period_fits(period: Duration, protocol: &ProtocolConfig) -> bool {
    !period.is_zero() && period < protocol.heartbeat_timeout
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind or query the listener.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Configuration that cannot work.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// A connection that passed admission, handed to the application.
#[derive(Debug)]
pub struct Accepted {
    /// Handle to send on and close the connection.
    pub handle: ConnectionHandle,
    /// The connection's signals, starting with `Connected`.
    pub signals: SignalReceiver,
    /// What the client sent during the upgrade.
    pub request: ConnectionRequest,
}

/// Receives accepted connections.
pub type AcceptedReceiver = mpsc::Receiver<Accepted>;

type Registry = Arc<RwLock<BTreeMap<SocketAddr, ConnectionHandle>>>;

/// The CWDTP server.
pub struct CwdtpServer {
    /// Server configuration.
    config: ServerConfig,
    /// Bound listener.
    listener: TcpListener,
    /// Admission gate shared by every accept.
    gate: Arc<AdmissionGate>,
    /// Live connections by peer address.
    connections: Registry,
    /// Accepted connection queue.
    accepted_tx: mpsc::Sender<Accepted>,
    /// Shutdown signal.
    shutdown_tx: watch::Sender<bool>,
}

impl CwdtpServer {
    /// Bind the listener. Accepted connections arrive on the returned receiver
    /// once [`run`](Self::run) is going.
    pub async fn bind(config: ServerConfig) -> Result<(Self, AcceptedReceiver), ServerError> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_BUFFER);
        let (shutdown_tx, _) = watch::channel(false);

        let server = Self {
            gate: Arc::new(AdmissionGate::new(config.admission.clone())),
            config,
            listener,
            connections: Arc::new(RwLock::new(BTreeMap::new())),
            accepted_tx,
            shutdown_tx,
        };
        Ok((server, accepted_rx))
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until [`shutdown`](Self::shutdown).
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ServerError> {
        info!("CWDTP server listening on {}", self.local_addr()?);

        let heartbeat_connections = self.connections.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_handle = tokio::spawn(async move {
            Self::run_heartbeat_loop(heartbeat_connections, heartbeat_interval).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while !*shutdown_rx.borrow_and_update() {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received");
                }
            }
        }

        heartbeat_handle.abort();

        let live: Vec<ConnectionHandle> =
            self.connections.read().await.values().cloned().collect();
        info!("Closing {} connections", live.len());
        let grace = self.config.protocol.close_timeout;
        join_all(live.iter().map(|handle| async move {
            let reason = "server shutting down";
            let disconnect = handle.disconnect(close_code::GOING_AWAY, reason, false);
            if !matches!(timeout(grace, disconnect).await, Ok(Ok(()))) {
                handle.terminate(close_code::GOING_AWAY, reason).await;
            }
        }))
        .await;

        Ok(())
    }

    /// Upgrade, admit and start one connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let connections = self.connections.clone();
        let gate = self.gate.clone();
        let protocol = self.config.protocol.clone();
        let accepted_tx = self.accepted_tx.clone();

        tokio::spawn(async move {
            let mut captured = None;
            let callback = |request: &Request, mut response: Response| {
                let request = ConnectionRequest::from_http(request, addr);
                if request.offers_subprotocol(SUBPROTOCOL) {
                    response
                        .headers_mut()
                        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
                }
                captured = Some(request);
                Ok::<_, ErrorResponse>(response)
            };

            // the gate only counts upgraded sockets, so bound the upgrade
            let upgrade = timeout(protocol.handshake_timeout, accept_hdr_async(stream, callback));
            let ws = match upgrade.await {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    warn!("WebSocket upgrade failed for {}: {}", addr, e);
                    return;
                }
                Err(_) => {
                    warn!("WebSocket upgrade timed out for {}", addr);
                    return;
                }
            };
            let Some(request) = captured else {
                return;
            };

            if !request.offers_subprotocol(SUBPROTOCOL) {
                warn!("{} did not offer the {} subprotocol", addr, SUBPROTOCOL);
                let mut connection = Connection::acceptor(protocol, Instant::now());
                connection.reject_subprotocol(request.subprotocols.first().cloned());
                // the driver flushes the rejection and exits
                drop(spawn_connection(ws, connection));
                return;
            }

            let permit = match gate.admit(&request).await {
                Ok(permit) => permit,
                Err(e) => {
                    info!("Rejected {} ({}): {}", addr, e.close_code(), e);
                    reject(ws, e.close_code(), &e.to_string()).await;
                    return;
                }
            };

            let connection = Connection::acceptor(protocol, Instant::now());
            let (handle, signals) = spawn_admitted(ws, connection, permit);
            connections.write().await.insert(addr, handle.clone());

            let accepted = Accepted {
                handle: handle.clone(),
                signals,
                request,
            };
            if accepted_tx.send(accepted).await.is_err() {
                warn!("No consumer for accepted connections, dropping {}", addr);
                handle.terminate(close_code::GOING_AWAY, "server not accepting").await;
            }

            handle.closed().await;
            connections.write().await.remove(&addr);
            debug!("Client {} cleaned up", addr);
        });
    }

    /// Shared heartbeat sweep: never waits on any single connection.
    async fn run_heartbeat_loop(connections: Registry, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let connections = connections.read().await;
            for handle in connections.values() {
                handle.heartbeat();
            }
        }
    }

    /// Signal the server to shut down.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Get connected client count.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Live admissions as seen by the gate.
    pub fn admitted_count(&self) -> usize {
        self.gate.active_total()
    }
}

/// Close a raw WebSocket that never became a connection.
async fn reject(mut ws: WebSocketStream<TcpStream>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: close_reason(reason).to_string().into(),
    };
    if ws.close(Some(frame)).await.is_ok() {
        while let Some(Ok(_)) = ws.next().await {}
    }
}
