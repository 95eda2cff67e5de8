//! Network layer - protocol runtimes driving stream sessions
//!
//! WebSocket: handshake, reader/writer tasks, [`Sender`] and scripted steps.
//! SSE: one reader task applying the line framer and termination budgets.

pub mod client;
pub mod idle;
pub mod sender;
pub mod sse;
pub mod sse_parser;
pub mod steps;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{create_client, SseRequest};
pub use idle::{IdleToucher, IdleWatchdog};
pub use sender::Sender;
pub use sse::{execute_sse, SseConnection, SseStream};
pub use sse_parser::{SseDecoder, SseMessage};
pub use steps::{run_steps, StepOutcome};
pub use websocket::{connect, execute_websocket, Connection, WebSocket, WebSocketRequest};
