//! Errors surfaced by sessions, runtimes and the sender facade.

use thiserror::Error;

/// Terminal or per-call failure of a stream.
///
/// Cloneable so a session can hand its terminal error to every caller of
/// [`Session::state`](crate::stream::Session::state).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("session closed")]
    SessionClosed,

    #[error("context canceled")]
    Canceled,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("file {path}: {message}")]
    File { path: String, message: String },

    #[error("step {index} ({kind}) failed: {message}")]
    Step {
        index: usize,
        kind: String,
        message: String,
    },
}

impl StreamError {
    /// Whether the error ends the stream without being a transport defect.
    pub fn is_expected(&self) -> bool {
        matches!(self, StreamError::Canceled | StreamError::SessionClosed)
    }
}
