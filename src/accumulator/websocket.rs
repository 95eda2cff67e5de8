//! WebSocket transcript
//!
//! Sent and received frames become records; close notes only feed the summary.

use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{human_duration, nanos};
use crate::constants::{CLOSED_BY_CLIENT, CLOSED_BY_ERROR, META_WS_CLOSED_BY, META_WS_STEP, META_WS_TYPE};
use crate::models::StreamResponse;
use crate::stream::{Direction, Event, Kind, Opcode, Session, State, Stats};

/// One frame as shown to the user
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct WsEventRecord {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub step: String,
    pub direction: &'static str,
    #[serde(rename = "type")]
    pub frame_type: String,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WsSummary {
    pub sent_count: usize,
    pub received_count: usize,
    #[serde(with = "nanos")]
    pub duration: Duration,
    pub closed_by: String,
    pub close_code: u16,
    pub close_reason: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct WsTranscript {
    pub events: Vec<WsEventRecord>,
    pub summary: WsSummary,
}

fn opcode_of(event: &Event) -> Opcode {
    if let Some(meta) = event.websocket() {
        return meta.opcode;
    }
    match event.metadata(META_WS_TYPE) {
        Some("binary") => Opcode::Binary,
        Some("ping") => Opcode::Ping,
        Some("pong") => Opcode::Pong,
        Some("close") => Opcode::Close,
        _ => Opcode::Text,
    }
}

fn record(event: &Event) -> WsEventRecord {
    let opcode = opcode_of(event);
    let (text, base64) = if opcode.is_textual() {
        (Some(event.text()), None)
    } else {
        (
            None,
            Some(base64::engine::general_purpose::STANDARD.encode(&event.payload)),
        )
    };
    let (code, reason) = match event.websocket() {
        Some(meta) if meta.opcode == Opcode::Close => (meta.close_code, meta.close_reason.clone()),
        _ => (None, String::new()),
    };
    WsEventRecord {
        step: event.metadata(META_WS_STEP).unwrap_or_default().to_string(),
        direction: event.direction.as_str(),
        frame_type: opcode.as_str().to_string(),
        size: event.payload.len(),
        text,
        base64,
        timestamp: event.timestamp,
        code,
        reason,
    }
}

/// Replay a WebSocket session history
pub fn accumulate(events: &[Event], stats: &Stats, state: State) -> WsTranscript {
    let mut summary = WsSummary {
        sent_count: 0,
        received_count: 0,
        duration: stats.duration(),
        closed_by: String::new(),
        close_code: 0,
        close_reason: String::new(),
    };
    let mut records = Vec::with_capacity(events.len());

    for event in events {
        match event.direction {
            Direction::Send => summary.sent_count += 1,
            Direction::Receive => summary.received_count += 1,
            Direction::Info => {
                if let Some(closed_by) = event.metadata(META_WS_CLOSED_BY) {
                    summary.closed_by = closed_by.to_string();
                    if let Some(meta) = event.websocket() {
                        if let Some(code) = meta.close_code {
                            summary.close_code = code;
                        }
                        if !meta.close_reason.is_empty() {
                            summary.close_reason = meta.close_reason.clone();
                        }
                    }
                }
                continue;
            }
        }
        records.push(record(event));
    }

    if summary.closed_by.is_empty() {
        summary.closed_by = if state == State::Failed {
            CLOSED_BY_ERROR
        } else {
            CLOSED_BY_CLIENT
        }
        .to_string();
    }

    WsTranscript {
        events: records,
        summary,
    }
}

/// Render a finished session as a `101 Switching Protocols` response
pub fn render(session: &Session, handshake_headers: &[(String, String)]) -> StreamResponse {
    let stats = session.stats_snapshot();
    let transcript = accumulate(&session.events_snapshot(), &stats, session.state().0);
    let summary = &transcript.summary;
    let line = format!(
        "sent={} received={} closedBy={} code={} duration={}",
        summary.sent_count,
        summary.received_count,
        summary.closed_by,
        summary.close_code,
        human_duration(summary.duration)
    );
    super::render(
        Kind::WebSocket,
        101,
        handshake_headers,
        &transcript,
        line,
        stats.duration(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CLOSED_BY_SERVER, CLOSED_BY_TIMEOUT, HEADER_STREAM_SUMMARY};
    use crate::stream::{ProtocolMeta, SessionOptions, StreamError, WsMeta};
    use bytes::Bytes;

    fn frame(direction: Direction, opcode: Opcode, payload: &'static [u8]) -> Event {
        Event::new(Kind::WebSocket, direction, Bytes::from_static(payload))
            .with_metadata(META_WS_TYPE, opcode.as_str())
            .with_meta(ProtocolMeta::WebSocket(WsMeta::new(opcode)))
    }

    fn note(closed_by: &str, code: Option<u16>, reason: &str) -> Event {
        Event::new(Kind::WebSocket, Direction::Info, Bytes::new())
            .with_metadata(META_WS_CLOSED_BY, closed_by)
            .with_meta(ProtocolMeta::WebSocket(WsMeta {
                opcode: Opcode::Close,
                close_code: code,
                close_reason: reason.to_string(),
            }))
    }

    fn stats() -> Stats {
        Session::new(Kind::WebSocket, SessionOptions::default()).stats_snapshot()
    }

    #[test]
    fn test_text_and_binary_payloads() {
        let events = vec![
            frame(Direction::Send, Opcode::Text, b"hi").with_metadata(META_WS_STEP, "1:send_text"),
            frame(Direction::Receive, Opcode::Binary, b"\x00\xff"),
        ];
        let transcript = accumulate(&events, &stats(), State::Closed);

        assert_eq!(transcript.events[0].step, "1:send_text");
        assert_eq!(transcript.events[0].text.as_deref(), Some("hi"));
        assert_eq!(transcript.events[1].base64.as_deref(), Some("AP8="));
        assert_eq!(transcript.events[1].size, 2);
        assert_eq!(transcript.summary.sent_count, 1);
        assert_eq!(transcript.summary.received_count, 1);
    }

    #[test]
    fn test_closed_by_defaults() {
        let closed = accumulate(&[], &stats(), State::Closed);
        assert_eq!(closed.summary.closed_by, CLOSED_BY_CLIENT);
        assert_eq!(closed.summary.close_code, 0);

        let failed = accumulate(&[], &stats(), State::Failed);
        assert_eq!(failed.summary.closed_by, CLOSED_BY_ERROR);
    }

    #[test]
    fn test_notes_overwrite_per_field() {
        let events = vec![
            note(CLOSED_BY_SERVER, Some(4000), "going away"),
            note(CLOSED_BY_TIMEOUT, None, ""),
        ];
        let summary = accumulate(&events, &stats(), State::Failed).summary;
        assert_eq!(summary.closed_by, CLOSED_BY_TIMEOUT);
        assert_eq!(summary.close_code, 4000);
        assert_eq!(summary.close_reason, "going away");
    }

    #[test]
    fn test_error_note_after_client_close() {
        let events = vec![
            frame(Direction::Send, Opcode::Close, b""),
            note(CLOSED_BY_CLIENT, Some(1000), "bye"),
            note(CLOSED_BY_ERROR, None, "write failed: broken pipe"),
        ];
        let summary = accumulate(&events, &stats(), State::Failed).summary;
        assert_eq!(summary.closed_by, CLOSED_BY_ERROR);
        assert_eq!(summary.close_code, 1000);
        assert_eq!(summary.close_reason, "write failed: broken pipe");
    }

    #[test]
    fn test_json_shape() {
        let events = vec![frame(Direction::Send, Opcode::Ping, b"p")];
        let transcript = accumulate(&events, &stats(), State::Closed);
        let json = serde_json::to_value(&transcript).unwrap();

        let event = &json["events"][0];
        assert_eq!(event["type"], "ping");
        assert_eq!(event["direction"], "send");
        assert_eq!(event["base64"], "cA==");
        assert!(event.get("text").is_none());
        assert!(event.get("step").is_none());
        assert!(json["summary"]["duration"].is_u64());
        assert_eq!(json["summary"]["closedBy"], "client");
    }

    #[test]
    fn test_render_failed_session() {
        let session = Session::new(Kind::WebSocket, SessionOptions::default());
        session.mark_open();
        session.publish(frame(Direction::Send, Opcode::Text, b"x"));
        session.close(Some(StreamError::Write("broken pipe".into())));

        let resp = render(&session, &[]);
        assert_eq!(resp.status, 101);
        assert_eq!(resp.status_text, "Switching Protocols");
        let line = resp.header(HEADER_STREAM_SUMMARY).unwrap();
        assert!(line.starts_with("sent=1 received=0 closedBy=error"));
    }
}
