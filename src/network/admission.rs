//! Admission Gate
//!
//! Decides whether a raw inbound WebSocket may attempt a CWDTP handshake.
//! Runs after the HTTP upgrade and before any `Connection` exists.
//!
//! Checks, in order: path, origin, server-wide cap, per-source cap, then the
//! caller's asynchronous `verify_client` hook. A successful admission hands
//! out an [`AdmissionPermit`]; the per-source count it took is given back
//! exactly once, when the permit drops, whatever path the teardown took.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tracing::debug;

use crate::connection::close_code;

/// What the gate knows about an inbound connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    /// Peer socket address.
    pub source: SocketAddr,
    /// Requested path, without the query.
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    /// Declared `Origin` header.
    pub origin: Option<String>,
    /// Subprotocols offered in `Sec-WebSocket-Protocol`.
    pub subprotocols: Vec<String>,
    /// All request headers.
    pub headers: HeaderMap,
}

impl ConnectionRequest {
    /// Minimal request for a source and path.
    pub fn new(source: SocketAddr, path: impl Into<String>) -> Self {
        Self {
            source,
            path: path.into(),
            query: None,
            origin: None,
            subprotocols: Vec::new(),
            headers: HeaderMap::new(),
        }
    }

    /// Set the origin.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Set the query string.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Capture the metadata of a WebSocket upgrade request.
    pub fn from_http(request: &Request, source: SocketAddr) -> Self {
        let headers = request.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let subprotocols = headers
            .get_all("sec-websocket-protocol")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        Self {
            source,
            path: request.uri().path().to_string(),
            query: request.uri().query().map(str::to_string),
            origin: header("origin"),
            subprotocols,
            headers: headers.clone(),
        }
    }

    /// Look up a query parameter. No percent-decoding.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }

    /// Whether the client offered a subprotocol.
    pub fn offers_subprotocol(&self, protocol: &str) -> bool {
        self.subprotocols.iter().any(|p| p == protocol)
    }
}

/// Outcome of the `verify_client` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Let the connection through.
    Allow,
    /// Refuse, with a reason for the logs.
    Deny(String),
}

/// Asynchronous admission hook. `Err` means the hook itself failed.
pub type VerifyClient =
    Arc<dyn Fn(ConnectionRequest) -> BoxFuture<'static, anyhow::Result<Verdict>> + Send + Sync>;

/// Origin allow predicate; receives `None` when no `Origin` header was sent.
pub type OriginPredicate = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Admission configuration.
#[derive(Clone)]
pub struct AdmissionConfig {
    /// The only path served.
    pub path: String,
    /// Concurrent connections allowed from one source address.
    pub max_connections_per_source: usize,
    /// Concurrent connections allowed in total.
    pub max_connections: usize,
    /// Origin allow predicate.
    pub allow_origin: OriginPredicate,
    /// Optional asynchronous hook.
    pub verify_client: Option<VerifyClient>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            max_connections_per_source: 8,
            max_connections: 1000,
            allow_origin: Arc::new(|_: Option<&str>| true),
            verify_client: None,
        }
    }
}

impl fmt::Debug for AdmissionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionConfig")
            .field("path", &self.path)
            .field("max_connections_per_source", &self.max_connections_per_source)
            .field("max_connections", &self.max_connections)
            .field("verify_client", &self.verify_client.is_some())
            .finish_non_exhaustive()
    }
}

impl AdmissionConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parse = |name: &str, default: usize| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            path: std::env::var("CWDTP_PATH").unwrap_or(defaults.path.clone()),
            max_connections_per_source: parse(
                "CWDTP_MAX_PER_SOURCE",
                defaults.max_connections_per_source,
            ),
            max_connections: parse("CWDTP_MAX_CONNECTIONS", defaults.max_connections),
            ..defaults
        }
    }

    /// Restrict origins with a predicate.
    pub fn with_origin<F>(mut self, allow: F) -> Self
    where
        F: Fn(Option<&str>) -> bool + Send + Sync + 'static,
    {
        self.allow_origin = Arc::new(allow);
        self
    }

    /// Install the `verify_client` hook.
    pub fn with_verify_client<F>(mut self, verify: F) -> Self
    where
        F: Fn(ConnectionRequest) -> BoxFuture<'static, anyhow::Result<Verdict>>
            + Send
            + Sync
            + 'static,
    {
        self.verify_client = Some(Arc::new(verify));
        self
    }
}

/// Why an inbound connection was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// Path is not the configured one.
    #[error("path mismatch: {0}")]
    PathMismatch(String),

    /// Origin predicate refused.
    #[error("origin rejected: {0:?}")]
    OriginRejected(Option<String>),

    /// Per-source cap reached.
    #[error("too many connections from {0}")]
    QuotaExceeded(IpAddr),

    /// Server-wide cap reached.
    #[error("server connection limit reached")]
    ServerFull,

    /// Hook denied the request.
    #[error("verify_client denied: {0}")]
    VerifyClientDenied(String),

    /// Hook failed internally.
    #[error("verify_client failed: {0}")]
    VerifyClientFailed(String),
}

impl AdmissionError {
    /// WebSocket close code for this rejection.
    pub fn close_code(&self) -> u16 {
        match self {
            AdmissionError::PathMismatch(_) => close_code::PATH_MISMATCH,
            AdmissionError::OriginRejected(_) => close_code::ORIGIN_REJECTED,
            AdmissionError::QuotaExceeded(_) => close_code::QUOTA_EXCEEDED,
            AdmissionError::ServerFull => close_code::SERVER_FULL,
            AdmissionError::VerifyClientDenied(_) => close_code::UNAUTHORIZED,
            AdmissionError::VerifyClientFailed(_) => close_code::VERIFY_FAILED,
        }
    }
}

// =============================================================================
// GATE
// =============================================================================

#[derive(Debug, Default)]
struct Counts {
    per_source: BTreeMap<IpAddr, usize>,
    total: usize,
}

fn lock(counts: &Mutex<Counts>) -> MutexGuard<'_, Counts> {
    counts.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Server-side admission gate. Cheap to share behind an `Arc`.
pub struct AdmissionGate {
    config: AdmissionConfig,
    counts: Arc<Mutex<Counts>>,
}

impl AdmissionGate {
    /// Create a gate.
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            counts: Arc::new(Mutex::new(Counts::default())),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Run every check. On success the returned permit holds one slot.
    pub async fn admit(
        &self,
        request: &ConnectionRequest,
    ) -> Result<AdmissionPermit, AdmissionError> {
        if request.path != self.config.path {
            return Err(AdmissionError::PathMismatch(request.path.clone()));
        }
        if !(self.config.allow_origin)(request.origin.as_deref()) {
            return Err(AdmissionError::OriginRejected(request.origin.clone()));
        }

        // Reserve before the hook runs so slow verifications still count.
        let permit = self.reserve(request.source.ip())?;

        if let Some(verify) = &self.config.verify_client {
            match verify(request.clone()).await {
                Ok(Verdict::Allow) => {}
                Ok(Verdict::Deny(reason)) => return Err(AdmissionError::VerifyClientDenied(reason)),
                Err(e) => return Err(AdmissionError::VerifyClientFailed(e.to_string())),
            }
        }

        debug!(source = %request.source, "admitted");
        Ok(permit)
    }

    fn reserve(&self, source: IpAddr) -> Result<AdmissionPermit, AdmissionError> {
        let mut counts = lock(&self.counts);
        if counts.total >= self.config.max_connections {
            return Err(AdmissionError::ServerFull);
        }
        let count = counts.per_source.entry(source).or_insert(0);
        if *count >= self.config.max_connections_per_source {
            return Err(AdmissionError::QuotaExceeded(source));
        }
        *count += 1;
        counts.total += 1;

        Ok(AdmissionPermit {
            source,
            counts: self.counts.clone(),
        })
    }

    /// Live admissions from one source.
    pub fn active_from(&self, source: IpAddr) -> usize {
        lock(&self.counts).per_source.get(&source).copied().unwrap_or(0)
    }

    /// Live admissions in total.
    pub fn active_total(&self) -> usize {
        lock(&self.counts).total
    }
}

/// One admitted connection's slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    source: IpAddr,
    counts: Arc<Mutex<Counts>>,
}

impl AdmissionPermit {
    /// Source address the slot is charged to.
    pub fn source(&self) -> IpAddr {
        self.source
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut counts = lock(&self.counts);
        counts.total = counts.total.saturating_sub(1);
        if let Some(count) = counts.per_source.get_mut(&self.source) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.per_source.remove(&self.source);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn addr(ip: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::from((ip, port))
    }

    fn request(port: u16) -> ConnectionRequest {
        ConnectionRequest::new(addr([10, 0, 0, 1], port), "/")
    }

    #[tokio::test]
    async fn test_path_mismatch() {
        let gate = AdmissionGate::new(AdmissionConfig::default());
        let req = ConnectionRequest::new(addr([10, 0, 0, 1], 1), "/admin");
        let result = gate.admit(&req).await;
        assert!(matches!(result, Err(AdmissionError::PathMismatch(p)) if p == "/admin"));
        assert_eq!(gate.active_total(), 0);
    }

    #[tokio::test]
    async fn test_origin_rejected() {
        let config = AdmissionConfig::default()
            .with_origin(|origin| origin == Some("https://play.example.com"));
        let gate = AdmissionGate::new(config);

        let good = request(1).with_origin("https://play.example.com");
        assert!(gate.admit(&good).await.is_ok());

        let bad = request(2).with_origin("https://evil.example.com");
        assert!(matches!(gate.admit(&bad).await, Err(AdmissionError::OriginRejected(_))));

        let missing = request(3);
        assert!(matches!(gate.admit(&missing).await, Err(AdmissionError::OriginRejected(None))));
    }

    #[tokio::test]
    async fn test_quota_and_release() {
        let config = AdmissionConfig {
            max_connections_per_source: 3,
            ..Default::default()
        };
        let gate = AdmissionGate::new(config);
        let ip = IpAddr::from([10, 0, 0, 1]);

        let mut permits = Vec::new();
        for port in 0..3 {
            permits.push(gate.admit(&request(port)).await.unwrap());
        }
        assert_eq!(gate.active_from(ip), 3);

        let result = gate.admit(&request(99)).await;
        assert_eq!(result.unwrap_err(), AdmissionError::QuotaExceeded(ip));
        assert_eq!(gate.active_from(ip), 3);

        // other sources are unaffected
        let other = ConnectionRequest::new(addr([10, 0, 0, 2], 1), "/");
        let _other_permit = gate.admit(&other).await.unwrap();

        drop(permits.pop());
        assert_eq!(gate.active_from(ip), 2);
        permits.push(gate.admit(&request(100)).await.unwrap());
        assert_eq!(gate.active_from(ip), 3);

        permits.clear();
        assert_eq!(gate.active_from(ip), 0);
        assert_eq!(gate.active_total(), 1);
    }

    #[tokio::test]
    async fn test_server_full() {
        let config = AdmissionConfig {
            max_connections: 1,
            ..Default::default()
        };
        let gate = AdmissionGate::new(config);
        let _first = gate.admit(&request(1)).await.unwrap();
        let second = ConnectionRequest::new(addr([10, 9, 9, 9], 1), "/");
        assert_eq!(gate.admit(&second).await.unwrap_err(), AdmissionError::ServerFull);
    }

    #[tokio::test]
    async fn test_verify_client_deny_releases_slot() {
        let config = AdmissionConfig {
            max_connections_per_source: 1,
            ..Default::default()
        }
        .with_verify_client(|req| {
            async move {
                match req.query_param("token") {
                    Some("letmein") => Ok(Verdict::Allow),
                    _ => Ok(Verdict::Deny("bad token".into())),
                }
            }
            .boxed()
        });
        let gate = AdmissionGate::new(config);

        let denied = gate.admit(&request(1).with_query("token=nope")).await;
        assert_eq!(
            denied.unwrap_err(),
            AdmissionError::VerifyClientDenied("bad token".into())
        );
        assert_eq!(gate.active_total(), 0);

        let permit = gate.admit(&request(2).with_query("room=1&token=letmein")).await;
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn test_verify_client_failure() {
        let config = AdmissionConfig::default().with_verify_client(|_| {
            async { Err(anyhow::anyhow!("token store unreachable")) }.boxed()
        });
        let gate = AdmissionGate::new(config);
        let result = gate.admit(&request(1)).await;
        let err = result.unwrap_err();
        assert!(matches!(err, AdmissionError::VerifyClientFailed(_)));
        assert_eq!(err.close_code(), close_code::VERIFY_FAILED);
        assert_eq!(gate.active_total(), 0);
    }

    #[test]
    fn test_query_param() {
        let req = request(1).with_query("a=1&token=abc&flag");
        assert_eq!(req.query_param("token"), Some("abc"));
        assert_eq!(req.query_param("flag"), Some(""));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn test_from_http_request() {
        let http = Request::builder()
            .uri("/play?token=t")
            .header("origin", "https://play.example.com")
            .header("sec-websocket-protocol", "chat, cwdtp")
            .body(())
            .unwrap();
        let req = ConnectionRequest::from_http(&http, addr([127, 0, 0, 1], 5000));
        assert_eq!(req.path, "/play");
        assert_eq!(req.query_param("token"), Some("t"));
        assert_eq!(req.origin.as_deref(), Some("https://play.example.com"));
        assert!(req.offers_subprotocol("cwdtp"));
        assert!(!req.offers_subprotocol("wamp"));
    }
}
