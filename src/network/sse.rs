//! Server-Sent Events runtime
//!
//! One reader task drains the response body through [`SseDecoder`] and
//! stops at whichever budget runs out first: bytes, events, idle time or
//! the session deadline.

use std::fmt::Display;
use std::time::Instant;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::task::JoinHandle;

use crate::accumulator;
use crate::config::{enabled, DialOptions, SseOptions};
use crate::constants::{
    META_SSE_BYTES, META_SSE_EVENTS, META_SSE_REASON, REASON_CANCELED, REASON_EOF, REASON_IDLE,
    REASON_MAX_BYTES, REASON_MAX_EVENTS, REASON_TOTAL,
};
use crate::models::StreamResponse;
use crate::network::client::{
    build_sse_request, create_client, describe_send_error, rejection_response, SseRequest,
};
use crate::network::idle::IdleWatchdog;
use crate::network::sse_parser::{DecodedLine, SseDecoder};
use crate::stream::{
    ContextError, Direction, Event, Kind, ProtocolMeta, Session, SessionOptions, StreamError,
};

/// Outcome of opening an event stream
pub enum SseConnection {
    Streaming(SseStream),
    /// Non-2xx answer, kept as a plain response
    Rejected(StreamResponse),
}

/// A live event stream and its reader task
pub struct SseStream {
    session: Session,
    status: u16,
    headers: Vec<(String, String)>,
    task: Option<JoinHandle<()>>,
}

impl SseStream {
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Wait for the reader to stop and render the transcript
    pub async fn finish(mut self) -> StreamResponse {
        self.session.done().await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        accumulator::sse::render(&self.session, self.status, &self.headers)
    }
}

impl Drop for SseStream {
    fn drop(&mut self) {
        if !self.session.is_terminal() {
            self.session.cancel();
        }
    }
}

/// Send the request and start reading if the server answered 2xx.
///
/// The total timeout is one deadline, taken before the request is sent. The
/// wait for response headers and the body read share it.
pub async fn open(
    client: &reqwest::Client,
    request: &SseRequest,
    options: &SseOptions,
    dial: &DialOptions,
) -> Result<SseConnection, StreamError> {
    let started = Instant::now();
    let deadline = enabled(options.total_timeout).map(|total| tokio::time::Instant::now() + total);
    let send = build_sse_request(client, request, dial)?.send();
    let result = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, send)
            .await
            .map_err(|_| StreamError::Timeout("response headers"))?,
        None => send.await,
    };
    let response = result.map_err(|e| describe_send_error(&e))?;

    let status = response.status();
    if !status.is_success() {
        tracing::info!(url = %request.url, status = status.as_u16(), "SSE request rejected");
        return Ok(SseConnection::Rejected(
            rejection_response(response, started).await,
        ));
    }

    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let session = Session::new(
        Kind::Sse,
        SessionOptions {
            history_capacity: options.history_capacity,
            total_timeout: deadline.map(|d| d.saturating_duration_since(tokio::time::Instant::now())),
        },
    );
    session.mark_open();
    tracing::info!(session = %session.id(), url = %request.url, "SSE stream opened");

    let task = tokio::spawn(read_loop(
        response.bytes_stream(),
        session.clone(),
        options.clone(),
    ));
    Ok(SseConnection::Streaming(SseStream {
        session,
        status: status.as_u16(),
        headers,
        task: Some(task),
    }))
}

/// Byte and event budgets, counted per physical line
struct Budget {
    bytes: u64,
    events: u64,
    max_bytes: u64,
    max_events: u64,
}

impl Budget {
    fn new(options: &SseOptions) -> Self {
        Budget {
            bytes: 0,
            events: 0,
            max_bytes: options.max_bytes,
            max_events: options.max_events,
        }
    }

    /// Count bytes still waiting for a line terminator. They were read off
    /// the body, so a newline-less stream still runs out of budget.
    fn check_pending(&mut self, pending: usize) -> Option<&'static str> {
        let total = self.bytes + pending as u64;
        if self.max_bytes > 0 && total >= self.max_bytes {
            self.bytes = total;
            return Some(REASON_MAX_BYTES);
        }
        None
    }

    /// Account for one line, publishing the event it completed.
    /// Returns the reason when a limit has been reached.
    fn apply(&mut self, session: &Session, line: DecodedLine) -> Option<&'static str> {
        self.bytes += line.consumed as u64;
        if let Some(message) = line.message {
            self.events += 1;
            let meta = ProtocolMeta::Sse(message.meta());
            tracing::debug!(session = %session.id(), event = %message.event, size = message.data.len(), "SSE event received");
            session.publish(Event::new(Kind::Sse, Direction::Receive, message.data).with_meta(meta));
        }
        if self.max_bytes > 0 && self.bytes >= self.max_bytes {
            return Some(REASON_MAX_BYTES);
        }
        if self.max_events > 0 && self.events >= self.max_events {
            return Some(REASON_MAX_EVENTS);
        }
        None
    }
}

async fn idle_expired(watchdog: &Option<IdleWatchdog>) {
    match watchdog {
        Some(watchdog) => watchdog.expired().await,
        None => std::future::pending().await,
    }
}

async fn read_loop<S, E>(body: S, session: Session, options: SseOptions)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    tokio::pin!(body);
    let ctx = session.context().clone();
    let watchdog = enabled(options.idle_timeout).map(|idle| IdleWatchdog::spawn(idle, ctx.clone()));
    let mut decoder = SseDecoder::new();
    let mut budget = Budget::new(&options);

    let (reason, err): (String, Option<StreamError>) = 'read: loop {
        let next = tokio::select! {
            biased;
            reason = ctx.done() => Err(match reason {
                ContextError::Canceled => REASON_CANCELED,
                ContextError::DeadlineExceeded => REASON_TOTAL,
            }),
            _ = idle_expired(&watchdog) => Err(REASON_IDLE),
            chunk = body.next() => Ok(chunk),
        };
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(reason) => break (reason.to_string(), None),
        };

        match chunk {
            Some(Ok(chunk)) => {
                if let Some(watchdog) = &watchdog {
                    watchdog.touch();
                }
                decoder.push(&chunk);
                while let Some(line) = decoder.next_line() {
                    if let Some(reason) = budget.apply(&session, line) {
                        break 'read (reason.to_string(), None);
                    }
                }
                if let Some(reason) = budget.check_pending(decoder.pending_len()) {
                    break (reason.to_string(), None);
                }
            }
            Some(Err(e)) => {
                let message = e.to_string();
                tracing::warn!(session = %session.id(), error = %message, "SSE read failed");
                break (message.clone(), Some(StreamError::Read(message)));
            }
            None => {
                if let Some(reason) = decoder.finish().and_then(|line| budget.apply(&session, line)) {
                    break (reason.to_string(), None);
                }
                break (REASON_EOF.to_string(), None);
            }
        }
    };

    tracing::info!(
        session = %session.id(),
        reason = %reason,
        bytes = budget.bytes,
        events = budget.events,
        "SSE stream ended"
    );
    session.publish(
        Event::new(Kind::Sse, Direction::Info, Bytes::new())
            .with_metadata(META_SSE_REASON, reason)
            .with_metadata(META_SSE_BYTES, budget.bytes.to_string())
            .with_metadata(META_SSE_EVENTS, budget.events.to_string()),
    );
    session.close(err);
}

/// Open the stream, read it to its end and render the result.
///
/// Non-2xx answers come back as ordinary responses.
pub async fn execute_sse(
    request: &SseRequest,
    options: &SseOptions,
    dial: &DialOptions,
) -> Result<StreamResponse, StreamError> {
    let client = create_client(dial);
    match open(&client, request, options, dial).await? {
        SseConnection::Streaming(stream) => Ok(stream.finish().await),
        SseConnection::Rejected(response) => Ok(response),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::sse::accumulate;
    use crate::constants::HEADER_STREAM_TYPE;
    use crate::network::test_support::{spawn_http_server, spawn_slow_sse_server};
    use crate::stream::State;
    use std::time::Duration;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        futures_util::stream::iter(
            parts
                .iter()
                .map(|part| Ok(Bytes::from_static(part.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    fn session_for(options: &SseOptions) -> Session {
        let session = Session::new(
            Kind::Sse,
            SessionOptions {
                history_capacity: options.history_capacity,
                total_timeout: enabled(options.total_timeout),
            },
        );
        session.mark_open();
        session
    }

    #[tokio::test]
    async fn test_byte_budget_stops_after_first_event() {
        let options = SseOptions {
            max_bytes: "data: one\n\n".len() as u64,
            ..Default::default()
        };
        let session = session_for(&options);
        read_loop(chunks(&["data: one\n\n", "data: two\n\n"]), session.clone(), options).await;

        let summary = accumulate(&session.events_snapshot(), &session.stats_snapshot()).summary;
        assert_eq!(summary.event_count, 1);
        assert_eq!(summary.reason, REASON_MAX_BYTES);
        assert_eq!(summary.byte_count, 11);
        assert_eq!(session.state(), (State::Closed, None));
    }

    #[tokio::test]
    async fn test_byte_budget_counts_unterminated_line() {
        let options = SseOptions {
            max_bytes: 10,
            ..Default::default()
        };
        let session = session_for(&options);
        let body = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(vec![b'a'; 100_000]))])
            .chain(futures_util::stream::pending());
        tokio::time::timeout(Duration::from_secs(1), read_loop(body, session.clone(), options))
            .await
            .unwrap();

        let summary = accumulate(&session.events_snapshot(), &session.stats_snapshot()).summary;
        assert_eq!(summary.reason, REASON_MAX_BYTES);
        assert_eq!(summary.event_count, 0);
        assert_eq!(summary.byte_count, 100_000);
        assert_eq!(session.state(), (State::Closed, None));
    }

    #[tokio::test]
    async fn test_event_budget() {
        let options = SseOptions {
            max_events: 2,
            ..Default::default()
        };
        let session = session_for(&options);
        read_loop(
            chunks(&["data: a\n\ndata: b\n\ndata: c\n\n"]),
            session.clone(),
            options,
        )
        .await;

        let summary = accumulate(&session.events_snapshot(), &session.stats_snapshot()).summary;
        assert_eq!(summary.event_count, 2);
        assert_eq!(summary.reason, REASON_MAX_EVENTS);
    }

    #[tokio::test]
    async fn test_eof_flushes_trailing_event() {
        let options = SseOptions::default();
        let session = session_for(&options);
        read_loop(chunks(&["data: a\n\n", "event: tail\ndata: b"]), session.clone(), options).await;

        let transcript = accumulate(&session.events_snapshot(), &session.stats_snapshot());
        assert_eq!(transcript.summary.reason, REASON_EOF);
        assert_eq!(transcript.events.len(), 2);
        assert_eq!(transcript.events[1].event, "tail");
        assert_eq!(transcript.events[1].data, "b");
    }

    #[tokio::test]
    async fn test_read_error_fails_session() {
        let options = SseOptions::default();
        let session = session_for(&options);
        let body = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"data: a\n\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer")),
        ]);
        read_loop(body, session.clone(), options).await;

        let (state, err) = session.state();
        assert_eq!(state, State::Failed);
        assert_eq!(err, Some(StreamError::Read("reset by peer".to_string())));
        let summary = accumulate(&session.events_snapshot(), &session.stats_snapshot()).summary;
        assert_eq!(summary.reason, "reset by peer");
        assert_eq!(summary.event_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_reports_context_canceled() {
        let options = SseOptions::default();
        let session = session_for(&options);
        let body = futures_util::stream::pending::<Result<Bytes, std::io::Error>>();
        let task = tokio::spawn(read_loop(body, session.clone(), options));
        session.cancel();
        task.await.unwrap();

        let summary = accumulate(&session.events_snapshot(), &session.stats_snapshot()).summary;
        assert_eq!(summary.reason, REASON_CANCELED);
        assert_eq!(session.state().0, State::Closed);
    }

    #[tokio::test]
    async fn test_idle_timeout_beats_total_timeout() {
        let url = spawn_http_server(
            "200 OK",
            "text/event-stream",
            "data: first\n\n",
            Some(Duration::from_secs(2)),
        )
        .await;
        let options = SseOptions {
            idle_timeout: Duration::from_millis(25),
            total_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let client = create_client(&DialOptions::default());
        let stream = match open(&client, &SseRequest::get(url), &options, &DialOptions::default())
            .await
            .unwrap()
        {
            SseConnection::Streaming(stream) => stream,
            SseConnection::Rejected(resp) => panic!("unexpected rejection: {}", resp.status),
        };

        let started = Instant::now();
        tokio::time::timeout(Duration::from_millis(400), stream.session().done())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(400));

        let response = stream.finish().await;
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["summary"]["reason"], REASON_IDLE);
        assert_eq!(body["summary"]["eventCount"], 1);
        assert_eq!(body["events"][0]["data"], "first");
        assert_eq!(response.header(HEADER_STREAM_TYPE), Some("sse"));
    }

    #[tokio::test]
    async fn test_total_timeout_reason() {
        let url = spawn_http_server(
            "200 OK",
            "text/event-stream",
            ": hello\n\n",
            Some(Duration::from_secs(2)),
        )
        .await;
        let options = SseOptions {
            total_timeout: Duration::from_millis(60),
            ..Default::default()
        };
        let response = execute_sse(&SseRequest::get(url), &options, &DialOptions::default())
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["summary"]["reason"], REASON_TOTAL);
        assert_eq!(body["events"][0]["comment"], "hello");
    }

    #[tokio::test]
    async fn test_total_timeout_includes_header_wait() {
        let url = spawn_slow_sse_server(
            Duration::from_millis(300),
            "data: late\n\n",
            Some(Duration::from_secs(2)),
        )
        .await;
        let options = SseOptions {
            total_timeout: Duration::from_millis(400),
            ..Default::default()
        };

        let started = Instant::now();
        let response = execute_sse(&SseRequest::get(url), &options, &DialOptions::default())
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(650), "took {:?}", elapsed);

        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["summary"]["reason"], REASON_TOTAL);
        assert_eq!(body["summary"]["eventCount"], 1);
    }

    #[tokio::test]
    async fn test_header_wait_past_total_timeout() {
        let url = spawn_slow_sse_server(Duration::from_millis(300), "data: x\n\n", None).await;
        let options = SseOptions {
            total_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let err = execute_sse(&SseRequest::get(url), &options, &DialOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, StreamError::Timeout("response headers"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_plain_response() {
        let url = spawn_http_server("404 Not Found", "text/plain", "nope", None).await;
        let response = execute_sse(
            &SseRequest::get(url),
            &SseOptions::default(),
            &DialOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body, "nope");
        assert!(response.header(HEADER_STREAM_TYPE).is_none());
    }

    #[tokio::test]
    async fn test_eof_over_http() {
        let url = spawn_http_server(
            "200 OK",
            "text/event-stream",
            "id: 1\nevent: greet\ndata: hi\n\nretry: 3000\ndata: bye\n\n",
            None,
        )
        .await;
        let response = execute_sse(
            &SseRequest::get(url),
            &SseOptions::default(),
            &DialOptions::default(),
        )
        .await
        .unwrap();

        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["summary"]["reason"], REASON_EOF);
        assert_eq!(body["summary"]["eventCount"], 2);
        assert_eq!(body["events"][0]["id"], "1");
        assert_eq!(body["events"][0]["event"], "greet");
        assert_eq!(body["events"][1]["index"], 1);
        assert_eq!(body["events"][1]["retry"], 3000);
        assert_eq!(response.status, 200);
    }
}
