//! Client Connector
//!
//! Opens a WebSocket to a CWDTP server and runs the initiating side.

use thiserror::Error;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, warn};

use crate::connection::{close_code, Connection, ProtocolConfig, SUBPROTOCOL};
use crate::network::session::{spawn_connection, ConnectionHandle, SignalReceiver};

/// Client connection errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// WebSocket connect or upgrade failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Server did not agree on the `cwdtp` subprotocol.
    #[error("invalid negotiated subprotocol: {0:?}")]
    InvalidSubprotocol(Option<String>),
}

/// Connect to `request` (a URL or a prepared request) and start the handshake.
///
/// Resolves once the WebSocket is up; the `Connected` signal follows when the
/// CWDTP handshake completes.
pub async fn connect<R>(
    request: R,
    config: ProtocolConfig,
) -> Result<(ConnectionHandle, SignalReceiver), ClientError>
where
    R: IntoClientRequest + Unpin,
{
    let mut request = request.into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    debug!(uri = %request.uri(), "connecting");

    let (mut ws, response) = connect_async(request).await?;

    let negotiated = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if negotiated.as_deref() != Some(SUBPROTOCOL) {
        warn!(?negotiated, "server did not negotiate cwdtp");
        let frame = CloseFrame {
            code: CloseCode::from(close_code::INVALID_SUBPROTOCOL),
            reason: "invalid subprotocol".into(),
        };
        let _ = ws.close(Some(frame)).await;
        return Err(ClientError::InvalidSubprotocol(negotiated));
    }

    let connection = Connection::initiator(config, Instant::now());
    Ok(spawn_connection(ws, connection))
}
