use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::CLOSE_NORMAL;

/// One scripted WebSocket action
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebSocketStep {
    SendText {
        value: String,
    },
    /// Sent as a compact text frame after validation
    SendJson {
        value: String,
    },
    /// Decoded and sent as a binary frame
    SendBase64 {
        value: String,
    },
    /// File contents sent as a binary frame
    SendFile {
        path: String,
    },
    Ping {
        #[serde(default)]
        value: String,
    },
    Pong {
        #[serde(default)]
        value: String,
    },
    Wait {
        duration_ms: u64,
    },
    Close {
        #[serde(default = "default_close_code")]
        code: u16,
        #[serde(default)]
        reason: String,
    },
}

fn default_close_code() -> u16 {
    CLOSE_NORMAL
}

impl WebSocketStep {
    pub fn name(&self) -> &'static str {
        match self {
            WebSocketStep::SendText { .. } => "send_text",
            WebSocketStep::SendJson { .. } => "send_json",
            WebSocketStep::SendBase64 { .. } => "send_base64",
            WebSocketStep::SendFile { .. } => "send_file",
            WebSocketStep::Ping { .. } => "ping",
            WebSocketStep::Pong { .. } => "pong",
            WebSocketStep::Wait { .. } => "wait",
            WebSocketStep::Close { .. } => "close",
        }
    }

    /// Steps followed by a short receive window so an echo can arrive
    pub fn awaits_reply(&self) -> bool {
        matches!(
            self,
            WebSocketStep::SendText { .. }
                | WebSocketStep::SendJson { .. }
                | WebSocketStep::SendBase64 { .. }
                | WebSocketStep::SendFile { .. }
                | WebSocketStep::Ping { .. }
        )
    }
}

/// Generic response object a finished stream (or a rejected upgrade) is surfaced as
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub duration: Duration,
}

impl StreamResponse {
    /// First header value matching `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 101
    }

    /// Body pretty-printed when it is JSON, verbatim otherwise
    pub fn pretty_body(&self) -> String {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&self.body) {
            serde_json::to_string_pretty(&json).unwrap_or_else(|_| self.body.clone())
        } else {
            self.body.clone()
        }
    }
}
