//! Cancellation scope of a session: a token plus an optional deadline

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::StreamError;

/// Why a [`StreamContext`] is done
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextError {
    Canceled,
    DeadlineExceeded,
}

impl From<ContextError> for StreamError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Canceled => StreamError::Canceled,
            ContextError::DeadlineExceeded => StreamError::Timeout("total deadline"),
        }
    }
}

/// Cheaply cloneable "please stop" signal shared by a session's tasks.
#[derive(Clone, Debug)]
pub struct StreamContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl StreamContext {
    pub fn new(deadline: Option<Instant>) -> Self {
        StreamContext {
            token: CancellationToken::new(),
            deadline,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `Some` once canceled or past the deadline
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve when the context is canceled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }
}
