//! Application constants
//!
//! Centralized location for magic strings and configuration defaults.

use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "resterm-stream";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Directory under `$HOME` holding the settings file
pub const CONFIG_DIR: &str = ".resterm";

/// Settings file name inside [`CONFIG_DIR`]
pub const SETTINGS_FILE: &str = "streams.yaml";

/// Log file written by the binary
pub const LOG_FILE: &str = "resterm-stream.log";

// Response headers surfaced with a finished stream
pub const HEADER_STREAM_TYPE: &str = "X-Resterm-Stream-Type";
pub const HEADER_STREAM_SUMMARY: &str = "X-Resterm-Stream-Summary";

// Event metadata keys
pub const META_WS_STEP: &str = "ws.step";
pub const META_WS_TYPE: &str = "ws.type";
pub const META_WS_CLOSED_BY: &str = "ws.closed_by";
pub const META_SSE_REASON: &str = "sse.reason";
pub const META_SSE_BYTES: &str = "sse.bytes";
pub const META_SSE_EVENTS: &str = "sse.events";

// SSE termination reasons
pub const REASON_EOF: &str = "eof";
pub const REASON_MAX_BYTES: &str = "limit:max_bytes";
pub const REASON_MAX_EVENTS: &str = "limit:max_events";
pub const REASON_IDLE: &str = "timeout:idle";
pub const REASON_TOTAL: &str = "timeout:total";
pub const REASON_CANCELED: &str = "context_canceled";

// WebSocket closed-by classification
pub const CLOSED_BY_CLIENT: &str = "client";
pub const CLOSED_BY_SERVER: &str = "server";
pub const CLOSED_BY_TIMEOUT: &str = "timeout";
pub const CLOSED_BY_ERROR: &str = "error";

/// Normal closure status code
pub const CLOSE_NORMAL: u16 = 1000;

/// Control frame payloads (ping, pong, close reason) are limited by RFC 6455
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Events retained per session for late subscribers
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// Default queue size for a new subscription
pub const DEFAULT_LISTENER_CAPACITY: usize = 256;

/// Outbound command queue depth for the websocket writer
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Receive window after a scripted send when no idle timeout is set
pub const DEFAULT_RECEIVE_WINDOW: Duration = Duration::from_millis(250);
pub const MAX_RECEIVE_WINDOW: Duration = Duration::from_secs(1);
