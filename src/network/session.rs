//! Connection Driver
//!
//! Runs one [`Connection`] over a WebSocket. Each connection gets its own
//! task that owns the state machine and selects over the next frame, the
//! next command from a [`ConnectionHandle`] and the connection's single
//! timer. Outbound frames go through a bounded queue to a separate writer
//! task, so a peer that stops reading never stalls the timer. Signals go out
//! over an unbounded channel so a slow consumer never holds up heartbeats.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::connection::{
    validate_event_name, Connection, ConnectionError, ConnectionState, Output, Signal,
};
use crate::network::admission::AdmissionPermit;
use crate::protocol::Value;

/// Receives a connection's signals.
pub type SignalReceiver = mpsc::UnboundedReceiver<Signal>;

/// Commands buffered per connection.
const COMMAND_BUFFER: usize = 64;

/// Frames queued for the writer. A full queue means the peer stopped reading.
pub const OUTBOUND_BUFFER: usize = 64;

/// WebSocket close reasons are limited to 123 bytes.
pub const MAX_CLOSE_REASON: usize = 123;

/// How long the writer and the peer get to finish the close handshake once
/// the connection is over.
const CLOSE_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Command {
    Send {
        event: String,
        data: Vec<Value>,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Disconnect {
        code: u16,
        reason: String,
        error: bool,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Terminate {
        code: u16,
        reason: String,
    },
    Heartbeat,
}

#[derive(Debug, Clone)]
struct Status {
    id: Option<String>,
    state: ConnectionState,
}

impl Status {
    fn of(connection: &Connection) -> Self {
        Self {
            id: connection.id().map(str::to_string),
            state: connection.state(),
        }
    }
}

/// Cloneable handle to a running connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<Status>,
}

impl ConnectionHandle {
    /// Send an application event. Reserved and empty names are refused
    /// here, before anything reaches the connection task.
    pub async fn send(
        &self,
        event: impl Into<String>,
        data: Vec<Value>,
    ) -> Result<(), ConnectionError> {
        let event = event.into();
        validate_event_name(&event)?;
        let (reply, response) = oneshot::channel();
        self.request(Command::Send { event, data, reply }, response).await
    }

    /// Start the graceful close handshake.
    pub async fn disconnect(
        &self,
        code: u16,
        reason: impl Into<String>,
        error: bool,
    ) -> Result<(), ConnectionError> {
        let (reply, response) = oneshot::channel();
        let command = Command::Disconnect {
            code,
            reason: reason.into(),
            error,
            reply,
        };
        self.request(command, response).await
    }

    /// Close the transport immediately. No-op once the connection finished.
    pub async fn terminate(&self, code: u16, reason: impl Into<String>) {
        let command = Command::Terminate {
            code,
            reason: reason.into(),
        };
        let _ = self.commands.send(command).await;
    }

    /// Run one heartbeat sweep step without waiting. Returns `false` once
    /// the connection task is gone.
    pub fn heartbeat(&self) -> bool {
        match self.commands.try_send(Command::Heartbeat) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(cid = ?self.id(), "command queue full, skipping heartbeat");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Connection id, once the handshake completed.
    pub fn id(&self) -> Option<String> {
        self.status.borrow().id.clone()
    }

    /// Last observed state.
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Whether the connection task has finished.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Wait until the connection task has finished.
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    async fn request(
        &self,
        command: Command,
        response: oneshot::Receiver<Result<(), ConnectionError>>,
    ) -> Result<(), ConnectionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConnectionError::NotConnected)?;
        response.await.unwrap_or(Err(ConnectionError::NotConnected))
    }
}

/// Spawn the task driving `connection` over `ws`.
pub fn spawn_connection<S>(
    ws: WebSocketStream<S>,
    connection: Connection,
) -> (ConnectionHandle, SignalReceiver)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    spawn_driver(ws, connection, None)
}

/// Spawn a driver that holds an admission slot until it exits.
pub(crate) fn spawn_admitted<S>(
    ws: WebSocketStream<S>,
    connection: Connection,
    permit: AdmissionPermit,
) -> (ConnectionHandle, SignalReceiver)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    spawn_driver(ws, connection, Some(permit))
}

fn spawn_driver<S>(
    ws: WebSocketStream<S>,
    connection: Connection,
    permit: Option<AdmissionPermit>,
) -> (ConnectionHandle, SignalReceiver)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(Status::of(&connection));
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

    let (sink, stream) = ws.split();
    let writer = tokio::spawn(write_frames(sink, outbound_rx));

    let driver = Driver {
        stream,
        outbound: outbound_tx,
        writer,
        writing: true,
        connection,
        commands: command_rx,
        signals: signal_tx,
        status: status_tx,
        transport_open: true,
        permit,
    };
    tokio::spawn(driver.run());

    let handle = ConnectionHandle {
        commands: command_tx,
        status: status_rx,
    };
    (handle, signal_rx)
}

/// Truncate a close reason to the WebSocket limit on a char boundary.
pub fn close_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Write queued frames in order. Stops after the close frame.
async fn write_frames<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut frames: mpsc::Receiver<Message>,
) -> Result<(), WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let closing = matches!(frame, Message::Close(_));
        sink.send(frame).await?;
        if closing {
            break;
        }
    }
    Ok(())
}

// =============================================================================
// DRIVER TASK
// =============================================================================

struct Driver<S> {
    stream: SplitStream<WebSocketStream<S>>,
    outbound: mpsc::Sender<Message>,
    writer: JoinHandle<Result<(), WsError>>,
    writing: bool,
    connection: Connection,
    commands: mpsc::Receiver<Command>,
    signals: mpsc::UnboundedSender<Signal>,
    status: watch::Sender<Status>,
    transport_open: bool,
    permit: Option<AdmissionPermit>,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(mut self) {
        // the initiator's hello is already queued
        self.flush();

        while !self.connection.is_terminal() {
            let deadline = self.connection.next_deadline();
            tokio::select! {
                frame = self.stream.next() => self.on_frame(frame),
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => self.connection.terminate(
                        crate::connection::close_code::GOING_AWAY,
                        "all handles dropped",
                    ),
                },
                written = &mut self.writer, if self.writing => self.on_writer_exit(written),
                _ = wait_for(deadline) => self.connection.handle_timeout(Instant::now()),
            }
            self.flush();
        }

        debug!(
            cid = ?self.connection.id(),
            state = %self.connection.state(),
            "connection task finished"
        );
        self.finish().await;
    }

    fn on_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(text))) => {
                #[cfg(feature = "debug-tracing")]
                tracing::trace!(cid = ?self.connection.id(), frame = %text, "frame in");
                self.connection.handle_text(&text, Instant::now());
            }
            Some(Ok(Message::Binary(_))) => self.connection.handle_binary(),
            Some(Ok(Message::Close(frame))) => {
                self.transport_open = false;
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                    None => (None, String::new()),
                };
                self.connection.handle_transport_closed(code, &reason);
            }
            // websocket-level ping/pong is answered by tungstenite
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                self.transport_open = false;
                warn!(cid = ?self.connection.id(), error = %e, "transport error");
                self.connection.handle_transport_error(e.to_string());
            }
            None => {
                self.transport_open = false;
                self.connection.handle_transport_closed(None, "");
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { event, data, reply } => {
                let _ = reply.send(self.connection.send(&event, data));
            }
            Command::Disconnect {
                code,
                reason,
                error,
                reply,
            } => {
                let result = self.connection.disconnect(code, reason, error, Instant::now());
                let _ = reply.send(result);
            }
            Command::Terminate { code, reason } => self.connection.terminate(code, reason),
            Command::Heartbeat => self.connection.heartbeat_sweep(),
        }
    }

    /// The writer only stops early when a send failed.
    fn on_writer_exit(&mut self, written: Result<Result<(), WsError>, JoinError>) {
        self.writing = false;
        self.transport_open = false;
        let error = match written {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        warn!(cid = ?self.connection.id(), error = %error, "write failed");
        self.connection.handle_transport_error(error);
    }

    /// Carry out every queued output without waiting on the transport.
    fn flush(&mut self) {
        while let Some(output) = self.connection.poll_output() {
            match output {
                Output::Transmit(text) => {
                    if !self.transport_open {
                        continue;
                    }
                    #[cfg(feature = "debug-tracing")]
                    tracing::trace!(cid = ?self.connection.id(), frame = %text, "frame out");
                    self.queue(Message::Text(text));
                }
                Output::CloseTransport { code, reason } => {
                    if !self.transport_open {
                        continue;
                    }
                    self.transport_open = false;
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: close_reason(&reason).to_string().into(),
                    };
                    if self.outbound.try_send(Message::Close(Some(frame))).is_err() {
                        debug!(cid = ?self.connection.id(), "close frame not queued");
                    }
                }
                Output::Signal(signal) => {
                    let _ = self.signals.send(signal);
                }
            }
        }
        self.status.send_replace(Status::of(&self.connection));
    }

    fn queue(&mut self, message: Message) {
        let error = match self.outbound.try_send(message) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(_)) => "peer stopped reading",
            Err(mpsc::error::TrySendError::Closed(_)) => "writer gone",
        };
        warn!(cid = ?self.connection.id(), "{}, dropping connection", error);
        self.transport_open = false;
        self.connection.handle_transport_error(error.to_string());
    }

    /// Give the writer and the peer `CLOSE_DRAIN` to finish the close
    /// handshake, then cut the transport. The admission slot goes last.
    async fn finish(self) {
        let Driver {
            mut stream,
            outbound,
            mut writer,
            writing,
            permit,
            ..
        } = self;
        drop(outbound);

        let drained = timeout(CLOSE_DRAIN, async {
            if writing {
                let _ = (&mut writer).await;
            }
            while let Some(Ok(_)) = stream.next().await {}
        })
        .await;
        if drained.is_err() {
            debug!("close handshake unfinished, dropping transport");
            writer.abort();
        }
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{close_code, derive_key, ProtocolConfig};
    use crate::network::admission::{AdmissionConfig, AdmissionGate, ConnectionRequest};
    use crate::protocol::{ControlMessage, Envelope, Frame};
    use std::net::SocketAddr;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role as WsRole;

    type Ws = WebSocketStream<DuplexStream>;

    async fn ws_pair() -> (Ws, Ws) {
        ws_pair_sized(64 * 1024).await
    }

    async fn ws_pair_sized(capacity: usize) -> (Ws, Ws) {
        let (a, b) = tokio::io::duplex(capacity);
        let client = WebSocketStream::from_raw_socket(a, WsRole::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, WsRole::Server, None).await;
        (client, server)
    }

    fn acceptor() -> Connection {
        Connection::acceptor(ProtocolConfig::default(), Instant::now())
    }

    fn initiator() -> Connection {
        Connection::initiator(ProtocolConfig::default(), Instant::now())
    }

    async fn next_signal(signals: &mut SignalReceiver) -> Signal {
        signals.recv().await.expect("signal channel closed")
    }

    async fn next_text(ws: &mut Ws) -> String {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    async fn spawn_pair() -> (
        (ConnectionHandle, SignalReceiver),
        (ConnectionHandle, SignalReceiver),
    ) {
        let (client_ws, server_ws) = ws_pair().await;
        let client = spawn_connection(client_ws, initiator());
        let server = spawn_connection(server_ws, acceptor());
        (client, server)
    }

    /// Say hello to an acceptor by hand and read its ack.
    async fn hello_by_hand(raw: &mut Ws) {
        let hello = ControlMessage::Hello {
            req_key: "k".into(),
        };
        raw.send(Message::Text(hello.encode().unwrap())).await.unwrap();
        let ack = Envelope::decode(&next_text(raw).await).unwrap();
        assert_eq!(ack.event, "cwdtp::hello-ack");
    }

    /// An admitted acceptor whose raw peer finished the handshake and then
    /// stopped reading behind a frame larger than the transport buffer.
    async fn stalled_acceptor() -> (Ws, AdmissionGate, ConnectionHandle, SignalReceiver) {
        let (mut raw, server_ws) = ws_pair_sized(4096).await;
        let gate = AdmissionGate::new(AdmissionConfig::default());
        let source: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        let permit = gate.admit(&ConnectionRequest::new(source, "/")).await.unwrap();
        let (server, mut signals) = spawn_admitted(server_ws, acceptor(), permit);

        hello_by_hand(&mut raw).await;
        assert!(matches!(next_signal(&mut signals).await, Signal::Connected { .. }));

        let blob = Value::from("x".repeat(64 * 1024));
        server.send("blob", vec![blob]).await.unwrap();
        (raw, gate, server, signals)
    }

    /// Answer the initiator's hello by hand. Returns the cid.
    async fn accept_by_hand(raw: &mut Ws) -> String {
        let hello = next_text(raw).await;
        let Ok(Frame::Control(ControlMessage::Hello { req_key })) = Frame::parse(&hello) else {
            panic!("expected hello, got {hello}");
        };
        let ack = ControlMessage::HelloAck {
            res_key: derive_key(&req_key, &ProtocolConfig::default().salt),
            cid: "cid-1".into(),
        };
        raw.send(Message::Text(ack.encode().unwrap())).await.unwrap();
        "cid-1".into()
    }

    #[tokio::test]
    async fn test_handshake_and_messages() {
        let ((client, mut client_signals), (server, mut server_signals)) = spawn_pair().await;

        let Signal::Connected { cid } = next_signal(&mut server_signals).await else {
            panic!("server should connect first");
        };
        assert_eq!(
            next_signal(&mut client_signals).await,
            Signal::Connected { cid: cid.clone() }
        );
        assert_eq!(client.id(), Some(cid));
        assert_eq!(client.state(), ConnectionState::Open);

        client.send("chat", vec![Value::from("gg")]).await.unwrap();
        assert_eq!(
            next_signal(&mut server_signals).await,
            Signal::Message {
                event: "chat".into(),
                data: vec![Value::from("gg")]
            }
        );

        server.send("chat", vec![Value::from(7i64)]).await.unwrap();
        assert!(matches!(
            next_signal(&mut client_signals).await,
            Signal::Message { event, .. } if event == "chat"
        ));
    }

    #[tokio::test]
    async fn test_reserved_name_refused_by_handle() {
        let ((client, _client_signals), _server) = spawn_pair().await;
        assert_eq!(
            client.send("cwdtp::close", vec![]).await,
            Err(ConnectionError::ReservedEventName("cwdtp::close".into()))
        );
        assert_eq!(
            client.send("ping", vec![]).await,
            Err(ConnectionError::ReservedEventName("ping".into()))
        );
    }

    #[tokio::test]
    async fn test_graceful_close() {
        let ((client, mut client_signals), (server, mut server_signals)) = spawn_pair().await;
        next_signal(&mut client_signals).await;
        next_signal(&mut server_signals).await;

        client.disconnect(4321, "match over", true).await.unwrap();

        let expected = Signal::Closed {
            error: true,
            reason: "match over".into(),
        };
        assert_eq!(next_signal(&mut client_signals).await, Signal::Closing);
        assert_eq!(next_signal(&mut client_signals).await, expected);
        assert_eq!(next_signal(&mut server_signals).await, expected);

        client.closed().await;
        server.closed().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(server.state(), ConnectionState::Closed);
        assert_eq!(
            client.send("chat", vec![]).await,
            Err(ConnectionError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptor_handshake_timeout() {
        let (mut raw, server_ws) = ws_pair().await;
        let (_server, mut signals) = spawn_connection(server_ws, acceptor());

        // raw client never says hello
        match raw.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), close_code::HANDSHAKE_TIMEOUT);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(next_signal(&mut signals).await, Signal::HandshakeTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_heartbeat_window() {
        let (client_ws, mut raw) = ws_pair().await;
        let (client, mut signals) = spawn_connection(client_ws, initiator());

        let cid = accept_by_hand(&mut raw).await;
        assert_eq!(next_signal(&mut signals).await, Signal::Connected { cid });

        // a ping just inside the window keeps the connection open
        tokio::time::sleep(Duration::from_secs(29)).await;
        raw.send(Message::Text(ControlMessage::Ping.encode().unwrap()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut raw).await, ControlMessage::Pong.encode().unwrap());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(client.state(), ConnectionState::Open);

        // then silence
        assert_eq!(next_signal(&mut signals).await, Signal::PingTimeout);
        assert_eq!(client.state(), ConnectionState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sweep_detects_silent_peer() {
        let (mut raw, server_ws) = ws_pair().await;
        let (server, mut signals) = spawn_connection(server_ws, acceptor());

        hello_by_hand(&mut raw).await;
        assert!(matches!(next_signal(&mut signals).await, Signal::Connected { .. }));

        assert!(server.heartbeat());
        assert_eq!(next_text(&mut raw).await, ControlMessage::Ping.encode().unwrap());
        // no pong
        assert!(server.heartbeat());
        assert_eq!(next_signal(&mut signals).await, Signal::PingTimeout);

        server.closed().await;
        assert!(!server.heartbeat());
    }

    #[tokio::test]
    async fn test_binary_frame_is_violation() {
        let (client_ws, mut raw) = ws_pair().await;
        let (_client, mut signals) = spawn_connection(client_ws, initiator());
        accept_by_hand(&mut raw).await;
        next_signal(&mut signals).await;

        raw.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(
            next_signal(&mut signals).await,
            Signal::Error(ConnectionError::UnexpectedBinaryFrame)
        );
    }

    #[tokio::test]
    async fn test_dropped_peer_reports_closed() {
        let ((_client, mut client_signals), (server, mut server_signals)) = spawn_pair().await;
        next_signal(&mut client_signals).await;
        next_signal(&mut server_signals).await;

        server.terminate(close_code::GOING_AWAY, "shutting down").await;
        assert_eq!(
            next_signal(&mut server_signals).await,
            Signal::Closed {
                error: true,
                reason: "shutting down".into()
            }
        );
        assert!(matches!(
            next_signal(&mut client_signals).await,
            Signal::Closed { error: true, reason } if reason.contains("1001")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_still_swept() {
        let (_raw, gate, server, mut signals) = stalled_acceptor().await;

        assert!(server.heartbeat());
        assert!(server.heartbeat());
        let signal = timeout(Duration::from_secs(60), next_signal(&mut signals)).await;
        assert_eq!(signal, Ok(Signal::PingTimeout));

        server.closed().await;
        assert_eq!(server.state(), ConnectionState::TimedOut);
        assert_eq!(gate.active_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_close_times_out() {
        let (_raw, gate, server, mut signals) = stalled_acceptor().await;

        let disconnect = server.disconnect(close_code::NORMAL, "bye", false);
        assert_eq!(timeout(Duration::from_secs(1), disconnect).await, Ok(Ok(())));
        assert_eq!(next_signal(&mut signals).await, Signal::Closing);

        let signal = timeout(Duration::from_secs(60), next_signal(&mut signals)).await;
        assert_eq!(signal, Ok(Signal::CloseTimeout));
        server.closed().await;
        assert_eq!(gate.active_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_overflow_drops_connection() {
        let (_raw, gate, server, mut signals) = stalled_acceptor().await;

        for i in 0..(OUTBOUND_BUFFER as i64 + 8) {
            let _ = server.send("tick", vec![Value::from(i)]).await;
        }
        assert_eq!(
            next_signal(&mut signals).await,
            Signal::Error(ConnectionError::Transport("peer stopped reading".into()))
        );
        assert_eq!(
            server.send("tick", vec![]).await,
            Err(ConnectionError::NotConnected)
        );

        server.closed().await;
        assert_eq!(gate.active_total(), 0);
    }

    #[test]
    fn test_close_reason_truncation() {
        assert_eq!(close_reason("short"), "short");
        let long = "é".repeat(100);
        let cut = close_reason(&long);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert!(long.starts_with(cut));
    }
}
