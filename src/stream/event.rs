//! Stream events - one record per frame, line or bookkeeping note

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-wide sequence counter shared by every session.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Hand out the next global sequence number (starts at 1).
pub(crate) fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1
}

/// Protocol that produced an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Sse,
    WebSocket,
    /// Reserved for streaming gRPC calls
    Grpc,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Sse => "sse",
            Kind::WebSocket => "websocket",
            Kind::Grpc => "grpc",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way the event travelled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
    /// Bookkeeping written by the runtime itself (close notes, budgets)
    #[serde(rename = "info")]
    Info,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "receive",
            Direction::Info => "info",
        }
    }
}

/// WebSocket frame type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl Opcode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::Text => "text",
            Opcode::Binary => "binary",
            Opcode::Ping => "ping",
            Opcode::Pong => "pong",
            Opcode::Close => "close",
        }
    }

    /// Whether the payload is meant to be read as UTF-8 text
    pub fn is_textual(&self) -> bool {
        matches!(self, Opcode::Text | Opcode::Close)
    }
}

/// Fields of one dispatched SSE event
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseMeta {
    pub event: String,
    pub id: String,
    pub comment: String,
    pub retry_ms: Option<u64>,
}

/// Fields of one WebSocket frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsMeta {
    pub opcode: Opcode,
    pub close_code: Option<u16>,
    pub close_reason: String,
}

impl WsMeta {
    pub fn new(opcode: Opcode) -> Self {
        WsMeta {
            opcode,
            close_code: None,
            close_reason: String::new(),
        }
    }
}

/// Protocol-specific part of an event
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ProtocolMeta {
    #[default]
    None,
    Sse(SseMeta),
    WebSocket(WsMeta),
}

/// One occurrence on a stream.
///
/// `sequence` and `timestamp` are filled by [`Session::publish`] when left
/// unset; after that the event is only ever cloned.
///
/// [`Session::publish`]: crate::stream::Session::publish
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: Kind,
    pub direction: Direction,
    pub timestamp: Option<DateTime<Utc>>,
    /// 0 until published
    pub sequence: u64,
    pub metadata: HashMap<String, String>,
    pub payload: Bytes,
    pub meta: ProtocolMeta,
}

impl Event {
    pub fn new(kind: Kind, direction: Direction, payload: impl Into<Bytes>) -> Self {
        Event {
            kind,
            direction,
            timestamp: None,
            sequence: 0,
            metadata: HashMap::new(),
            payload: payload.into(),
            meta: ProtocolMeta::None,
        }
    }

    /// Builder-style metadata insert
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_meta(mut self, meta: ProtocolMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn sse(&self) -> Option<&SseMeta> {
        match &self.meta {
            ProtocolMeta::Sse(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn websocket(&self) -> Option<&WsMeta> {
        match &self.meta {
            ProtocolMeta::WebSocket(meta) => Some(meta),
            _ => None,
        }
    }

    /// Payload decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
