//! Local servers for runtime tests.

use std::borrow::Cow;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr.to_string())
}

/// Echoes text and binary frames; pings are answered by the library.
pub async fn spawn_echo_server() -> String {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                // keep reading after a close frame so the reply gets flushed
                while let Some(Ok(msg)) = ws.next().await {
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    format!("ws://{}", addr)
}

/// Sends a close frame right after the handshake
pub async fn spawn_closing_server(code: u16, reason: &'static str) -> String {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: Cow::Borrowed(reason),
                };
                let _ = ws.send(Message::Close(Some(frame))).await;
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });
    format!("ws://{}", addr)
}

/// Accepts the upgrade and then never says anything
pub async fn spawn_silent_server() -> String {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });
    format!("ws://{}", addr)
}

async fn read_request_head(stream: &mut TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
}

/// Refuses every upgrade with 403 and a short body
pub async fn spawn_rejecting_server() -> String {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            read_request_head(&mut stream).await;
            let _ = stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\nConnection: close\r\n\r\ndenied")
                .await;
            let _ = stream.shutdown().await;
        }
    });
    format!("ws://{}", addr)
}

/// Plain HTTP responder writing `status` and `body`, then either closing or
/// holding the connection open for `hold`.
pub async fn spawn_http_server(status: &'static str, content_type: &'static str, body: &'static str, hold: Option<Duration>) -> String {
    serve_http(status, content_type, body, None, hold).await
}

/// Event stream that waits `delay` before sending its response head
pub async fn spawn_slow_sse_server(delay: Duration, body: &'static str, hold: Option<Duration>) -> String {
    serve_http("200 OK", "text/event-stream", body, Some(delay), hold).await
}

async fn serve_http(
    status: &'static str,
    content_type: &'static str,
    body: &'static str,
    delay: Option<Duration>,
    hold: Option<Duration>,
) -> String {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_request_head(&mut stream).await;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Type: {}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
                    status, content_type
                );
                if stream.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                let _ = stream.write_all(body.as_bytes()).await;
                let _ = stream.flush().await;
                if let Some(hold) = hold {
                    tokio::time::sleep(hold).await;
                }
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://{}", addr)
}
