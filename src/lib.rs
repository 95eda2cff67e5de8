//! # resterm-stream
//!
//! Streaming session engine for a terminal HTTP client: WebSocket and
//! Server-Sent Events streams recorded into bounded, multi-subscriber
//! sessions and rendered as JSON transcripts.
//!
//! ## Features
//! - Session state machine with a single authoritative close
//! - Bounded history ring plus per-listener queues with drop policies
//! - WebSocket runtime: reader, writer, awaited sends, scripted steps
//! - SSE runtime: line framer with byte, event, idle and total budgets
//! - Accumulators producing `{"events": [...], "summary": {...}}`
//! - Manager registry with completion hooks
//!
//! ## Architecture
//! Runtime tasks publish into a [`Session`]:
//! - Network Layer (Tokio) - one reader (and a writer for WebSocket)
//! - Stream Layer - history, listeners, state, stats
//! - Accumulator - replays the history once the session is done

pub mod accumulator;
pub mod config;
pub mod constants;
pub mod models;
pub mod network;
pub mod stream;

// Re-export commonly used types
pub use config::{DialOptions, SseOptions, StreamSettings, WebSocketOptions};
pub use models::{StreamResponse, WebSocketStep};
pub use network::{
    execute_sse, execute_websocket, Connection, Sender, SseConnection, SseRequest, SseStream,
    WebSocket, WebSocketRequest,
};
pub use stream::{
    DropPolicy, Event, Kind, Manager, Session, State, StreamError, SubscribeOptions, Subscription,
};
