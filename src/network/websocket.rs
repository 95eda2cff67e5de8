//! WebSocket runtime - handshake, reader task and writer task
//!
//! The reader owns the inbound half of the connection, the writer owns the
//! outbound half and drains a single command queue: concurrent writes to
//! one socket are unsafe, reads run independently of writes.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use crate::accumulator;
use crate::config::{enabled, DialOptions, WebSocketOptions};
use crate::constants::{
    CLOSED_BY_CLIENT, CLOSED_BY_ERROR, CLOSED_BY_SERVER, CLOSED_BY_TIMEOUT, CLOSE_NORMAL,
    META_WS_CLOSED_BY,
    META_WS_STEP, META_WS_TYPE, OUTBOUND_QUEUE_CAPACITY,
};
use crate::models::{StreamResponse, WebSocketStep};
use crate::network::idle::{IdleToucher, IdleWatchdog};
use crate::network::sender::{Outbound, OutboundKind, Sender};
use crate::network::steps::run_steps;
use crate::stream::{
    ContextError, Direction, Event, Kind, Opcode, ProtocolMeta, Session, SessionOptions,
    StreamError, WsMeta,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Target of an upgrade request
#[derive(Clone, Debug)]
pub struct WebSocketRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl WebSocketRequest {
    pub fn new(url: impl Into<String>) -> Self {
        WebSocketRequest {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Outcome of the opening handshake
pub enum Connection {
    Upgraded(WebSocket),
    /// The server refused the upgrade; its answer is kept as a plain response
    Rejected(StreamResponse),
}

/// Flags shared by the reader and writer tasks
#[derive(Debug, Default)]
struct CloseFlags {
    /// We sent (or are sending) a close frame
    client_closed: AtomicBool,
}

/// A live WebSocket stream: its session, a sender and the background tasks
pub struct WebSocket {
    session: Session,
    sender: Sender,
    protocol: Option<String>,
    handshake_headers: Vec<(String, String)>,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocket {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// Sub-protocol picked by the server, if any
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Wait for the session to end and render it as a response
    pub async fn finish(mut self) -> StreamResponse {
        self.session.done().await;
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
        accumulator::websocket::render(&self.session, &self.handshake_headers)
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        // a handle dropped mid-stream must not leave the socket running
        if !self.session.is_terminal() {
            self.session.cancel();
        }
    }
}

fn upgrade_request(
    request: &WebSocketRequest,
    options: &WebSocketOptions,
    dial: &DialOptions,
) -> Result<tungstenite::handshake::client::Request, StreamError> {
    let mut upgrade = request
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| StreamError::Handshake(e.to_string()))?;

    let headers = upgrade.headers_mut();
    for (name, value) in dial.headers.iter().chain(&request.headers) {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| StreamError::Handshake(format!("header {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| StreamError::Handshake(format!("header {}: {}", name, e)))?;
        headers.insert(name, value);
    }
    if !options.subprotocols.is_empty() {
        let protocols = options.subprotocols.join(", ");
        let value = HeaderValue::from_str(&protocols)
            .map_err(|e| StreamError::Handshake(format!("subprotocols: {}", e)))?;
        headers.insert("Sec-WebSocket-Protocol", value);
    }
    Ok(upgrade)
}

fn transport_config(options: &WebSocketOptions) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    if options.max_message_bytes > 0 {
        config.max_message_size = Some(options.max_message_bytes);
        config.max_frame_size = Some(options.max_message_bytes);
    }
    config
}

fn header_pairs<'a>(
    headers: impl Iterator<Item = (&'a HeaderName, &'a HeaderValue)>,
) -> Vec<(String, String)> {
    headers
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Perform the opening handshake and, on success, start the runtime.
///
/// The handshake timeout only bounds the connect future; the established
/// socket lives on under the session's own context.
pub async fn connect(
    request: &WebSocketRequest,
    options: &WebSocketOptions,
    dial: &DialOptions,
) -> Result<Connection, StreamError> {
    let upgrade = upgrade_request(request, options, dial)?;
    if options.compression {
        tracing::debug!(url = %request.url, "permessage-deflate not supported, continuing uncompressed");
    }

    let started = Instant::now();
    let handshake = connect_async_with_config(upgrade, Some(transport_config(options)), false);
    let result = match tokio::time::timeout(options.handshake_timeout, handshake).await {
        Ok(result) => result,
        Err(_) => return Err(StreamError::Timeout("handshake")),
    };

    match result {
        Ok((stream, response)) => {
            let protocol = response
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let handshake_headers = header_pairs(response.headers().iter());
            tracing::info!(url = %request.url, protocol = ?protocol, "WebSocket connected");
            Ok(Connection::Upgraded(start(
                stream,
                options,
                protocol,
                handshake_headers,
            )))
        }
        Err(tungstenite::Error::Http(response)) => {
            let status = response.status();
            tracing::info!(url = %request.url, status = status.as_u16(), "WebSocket upgrade rejected");
            let body = response
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).into_owned())
                .unwrap_or_default();
            Ok(Connection::Rejected(StreamResponse {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                headers: header_pairs(response.headers().iter()),
                body,
                duration: started.elapsed(),
            }))
        }
        Err(e) => Err(StreamError::Handshake(e.to_string())),
    }
}

fn start(
    stream: WsStream,
    options: &WebSocketOptions,
    protocol: Option<String>,
    handshake_headers: Vec<(String, String)>,
) -> WebSocket {
    let session = Session::new(
        Kind::WebSocket,
        SessionOptions {
            history_capacity: options.history_capacity,
            total_timeout: enabled(options.total_timeout),
        },
    );
    session.mark_open();

    let (sink, source) = stream.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let flags = Arc::new(CloseFlags::default());
    let watchdog = enabled(options.idle_timeout)
        .map(|idle| IdleWatchdog::spawn(idle, session.context().clone()));
    let toucher = watchdog.as_ref().map(IdleWatchdog::toucher);

    let mut tasks = vec![
        tokio::spawn(read_loop(
            source,
            session.clone(),
            toucher.clone(),
            flags.clone(),
        )),
        tokio::spawn(write_loop(
            sink,
            rx,
            session.clone(),
            toucher,
            flags,
            options.close_grace,
        )),
    ];
    if let Some(watchdog) = watchdog {
        tasks.push(tokio::spawn(guard_idle(watchdog, session.clone())));
    }

    WebSocket {
        sender: Sender::new(session.clone(), tx, options.write_timeout),
        session,
        protocol,
        handshake_headers,
        tasks,
    }
}

fn frame_event(direction: Direction, opcode: Opcode, payload: Bytes, step: Option<&str>) -> Event {
    let mut event = Event::new(Kind::WebSocket, direction, payload)
        .with_metadata(META_WS_TYPE, opcode.as_str())
        .with_meta(ProtocolMeta::WebSocket(WsMeta::new(opcode)));
    if let Some(step) = step {
        event = event.with_metadata(META_WS_STEP, step);
    }
    event
}

/// Informational close note: who ended the stream and with what frame
fn close_note(closed_by: &str, code: Option<u16>, reason: &str) -> Event {
    Event::new(Kind::WebSocket, Direction::Info, Bytes::new())
        .with_metadata(META_WS_TYPE, Opcode::Close.as_str())
        .with_metadata(META_WS_CLOSED_BY, closed_by)
        .with_meta(ProtocolMeta::WebSocket(WsMeta {
            opcode: Opcode::Close,
            close_code: code,
            close_reason: reason.to_string(),
        }))
}

async fn guard_idle(watchdog: IdleWatchdog, session: Session) {
    tokio::select! {
        _ = session.done() => {}
        _ = watchdog.expired() => {
            tracing::info!(session = %session.id(), "WebSocket idle timeout");
            session.publish(close_note(CLOSED_BY_TIMEOUT, None, "idle timeout"));
            session.close(None);
        }
    }
}

async fn read_loop(
    mut source: SplitStream<WsStream>,
    session: Session,
    idle: Option<IdleToucher>,
    flags: Arc<CloseFlags>,
) {
    let ctx = session.context().clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = session.done() => return,
            reason = ctx.done() => {
                if session.is_terminal() {
                    return;
                }
                match reason {
                    ContextError::Canceled => {
                        session.publish(close_note(CLOSED_BY_CLIENT, None, "canceled"));
                    }
                    ContextError::DeadlineExceeded => {
                        tracing::info!(session = %session.id(), "WebSocket total timeout");
                        session.publish(close_note(CLOSED_BY_TIMEOUT, None, "total timeout"));
                    }
                }
                session.close(None);
                return;
            }
            next = source.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
            | None => {
                session.close(None);
                return;
            }
            Some(Err(e)) => {
                tracing::warn!(session = %session.id(), error = %e, "WebSocket read failed");
                session.close(Some(StreamError::Read(e.to_string())));
                return;
            }
        };

        if let Some(idle) = &idle {
            idle.touch();
        }

        let (opcode, payload) = match message {
            Message::Text(text) => (Opcode::Text, Bytes::from(text)),
            Message::Binary(data) => (Opcode::Binary, Bytes::from(data)),
            Message::Ping(data) => (Opcode::Ping, Bytes::from(data)),
            Message::Pong(data) => (Opcode::Pong, Bytes::from(data)),
            Message::Close(frame) => {
                if !flags.client_closed.load(Ordering::Acquire) {
                    session.mark_closing();
                    let (code, reason) = match &frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    tracing::info!(session = %session.id(), code = ?code, "WebSocket closed by server");
                    session.publish(close_note(CLOSED_BY_SERVER, code, &reason));
                }
                session.close(None);
                return;
            }
            Message::Frame(_) => continue,
        };
        tracing::debug!(session = %session.id(), opcode = opcode.as_str(), size = payload.len(), "WebSocket frame received");
        session.publish(frame_event(Direction::Receive, opcode, payload, None));
    }
}

fn to_message(kind: &OutboundKind) -> Message {
    match kind {
        OutboundKind::Message {
            opcode: Opcode::Text,
            payload,
        } => Message::Text(String::from_utf8_lossy(payload).into_owned()),
        OutboundKind::Message { payload, .. } => Message::Binary(payload.to_vec()),
        OutboundKind::Ping(payload) => Message::Ping(payload.to_vec()),
        OutboundKind::Pong(payload) => Message::Pong(payload.to_vec()),
        OutboundKind::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(*code),
            reason: Cow::Owned(reason.clone()),
        })),
    }
}

fn sent_event(command: &Outbound) -> Event {
    let step = command.step.as_deref();
    match &command.kind {
        OutboundKind::Message { opcode, payload } => {
            frame_event(Direction::Send, *opcode, payload.clone(), step)
        }
        OutboundKind::Ping(payload) => frame_event(Direction::Send, Opcode::Ping, payload.clone(), step),
        OutboundKind::Pong(payload) => frame_event(Direction::Send, Opcode::Pong, payload.clone(), step),
        OutboundKind::Close { code, reason } => {
            let mut event = frame_event(
                Direction::Send,
                Opcode::Close,
                Bytes::from(reason.clone()),
                step,
            );
            event.meta = ProtocolMeta::WebSocket(WsMeta {
                opcode: Opcode::Close,
                close_code: Some(*code),
                close_reason: reason.clone(),
            });
            event
        }
    }
}

/// End the session after a failed write. The error note replaces any client
/// close note published ahead of the write.
fn write_failed(session: &Session, err: StreamError) {
    session.publish(close_note(CLOSED_BY_ERROR, None, &err.to_string()));
    session.close(Some(err));
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    session: Session,
    idle: Option<IdleToucher>,
    flags: Arc<CloseFlags>,
    close_grace: Duration,
) {
    loop {
        let command = tokio::select! {
            biased;
            command = rx.recv() => command,
            _ = session.done() => None,
        };
        let Some(mut command) = command else {
            break;
        };
        if session.is_terminal() {
            command.report(Err(StreamError::SessionClosed));
            break;
        }

        // Published before the write so an echo can never precede its send.
        let is_close = matches!(command.kind, OutboundKind::Close { .. });
        session.publish(sent_event(&command));
        if let OutboundKind::Close { code, reason } = &command.kind {
            flags.client_closed.store(true, Ordering::Release);
            session.publish(close_note(CLOSED_BY_CLIENT, Some(*code), reason));
        }

        match sink.send(to_message(&command.kind)).await {
            Ok(()) => {
                if let Some(idle) = &idle {
                    idle.touch();
                }
                command.report(Ok(()));
            }
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "WebSocket write failed");
                let err = StreamError::Write(e.to_string());
                command.report(Err(err.clone()));
                write_failed(&session, err);
                break;
            }
        }

        if is_close {
            // the reader closes the session once the peer answers
            if tokio::time::timeout(close_grace, session.done()).await.is_err() {
                tracing::debug!(session = %session.id(), "No close reply from server");
                session.close(None);
            }
            break;
        }
    }

    rx.close();
    while let Ok(mut command) = rx.try_recv() {
        command.report(Err(StreamError::SessionClosed));
    }
    // flushes a queued close reply or sends our own close frame
    let _ = tokio::time::timeout(close_grace, sink.close()).await;
}

/// Connect, run `steps`, close unless the script did, and wait for the end.
///
/// A refused upgrade comes back as an ordinary response. A failing step
/// cancels the session and its error is returned.
pub async fn execute_websocket(
    request: &WebSocketRequest,
    steps: &[WebSocketStep],
    options: &WebSocketOptions,
    dial: &DialOptions,
) -> Result<StreamResponse, StreamError> {
    let ws = match connect(request, options, dial).await? {
        Connection::Upgraded(ws) => ws,
        Connection::Rejected(response) => return Ok(response),
    };

    let outcome = run_steps(ws.sender(), steps, options, dial).await?;
    if !outcome.explicit_close && !ws.session().is_terminal() {
        if let Err(e) = ws.sender().close(CLOSE_NORMAL, "").await {
            tracing::debug!(session = %ws.session().id(), error = %e, "Default close failed");
            ws.session().cancel();
        }
    }
    Ok(ws.finish().await)
}
