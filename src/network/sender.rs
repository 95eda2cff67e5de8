//! Sender facade - turns outbound intent into writer commands
//!
//! Every `send_*`, `ping`, `pong` and `close` call funnels into
//! [`Sender::enqueue`]. An awaiting sender blocks the caller (never the
//! writer) until the writer reports back, the write timeout passes, or the
//! session ends.

use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::constants::MAX_CONTROL_PAYLOAD;
use crate::stream::{Opcode, Session, StreamError};

/// What the writer should put on the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundKind {
    Message { opcode: Opcode, payload: Bytes },
    Ping(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

impl OutboundKind {
    pub fn opcode(&self) -> Opcode {
        match self {
            OutboundKind::Message { opcode, .. } => *opcode,
            OutboundKind::Ping(_) => Opcode::Ping,
            OutboundKind::Pong(_) => Opcode::Pong,
            OutboundKind::Close { .. } => Opcode::Close,
        }
    }
}

pub type ResultSlot = oneshot::Sender<Result<(), StreamError>>;

/// One unit of work for the writer task
#[derive(Debug)]
pub struct Outbound {
    pub kind: OutboundKind,
    /// Step label recorded on the published event
    pub step: Option<String>,
    pub result: Option<ResultSlot>,
}

impl Outbound {
    /// Hand the outcome back to a waiting caller, if any
    pub fn report(&mut self, outcome: Result<(), StreamError>) {
        if let Some(slot) = self.result.take() {
            let _ = slot.send(outcome);
        }
    }
}

/// Cut a control frame payload down to the protocol limit
pub(crate) fn cap_control(payload: Bytes) -> Bytes {
    if payload.len() > MAX_CONTROL_PAYLOAD {
        payload.slice(..MAX_CONTROL_PAYLOAD)
    } else {
        payload
    }
}

/// Cut a close reason down to the protocol limit on a char boundary.
/// The two-byte status code shares the 125 bytes.
pub(crate) fn cap_close_reason(reason: &str) -> String {
    let limit = MAX_CONTROL_PAYLOAD - 2;
    if reason.len() <= limit {
        return reason.to_string();
    }
    let mut end = limit;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Caller-facing handle for writing to a WebSocket session
#[derive(Clone, Debug)]
pub struct Sender {
    session: Session,
    tx: mpsc::Sender<Outbound>,
    /// `None` means fire-and-forget
    wait: Option<Duration>,
    step: Option<String>,
}

impl Sender {
    pub(crate) fn new(session: Session, tx: mpsc::Sender<Outbound>, write_timeout: Duration) -> Self {
        Sender {
            session,
            tx,
            wait: Some(write_timeout),
            step: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// A sender whose calls return once the command is queued
    pub fn detached(&self) -> Self {
        Sender {
            wait: None,
            ..self.clone()
        }
    }

    /// A sender that waits up to `timeout` for each write
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Sender {
            wait: Some(timeout),
            ..self.clone()
        }
    }

    /// A sender tagging its events with a step label
    pub fn with_step(&self, step: impl Into<String>) -> Self {
        Sender {
            step: Some(step.into()),
            ..self.clone()
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), StreamError> {
        let payload = Bytes::from(text.into());
        self.enqueue(OutboundKind::Message {
            opcode: Opcode::Text,
            payload,
        })
        .await
    }

    /// Validate `json` and send it compacted as a text frame
    pub async fn send_json(&self, json: &str) -> Result<(), StreamError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| StreamError::InvalidPayload(format!("json: {}", e)))?;
        let compact = serde_json::to_string(&value)
            .map_err(|e| StreamError::InvalidPayload(format!("json: {}", e)))?;
        self.send_text(compact).await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), StreamError> {
        self.enqueue(OutboundKind::Message {
            opcode: Opcode::Binary,
            payload: data.into(),
        })
        .await
    }

    /// Decode standard base64 and send the bytes as a binary frame
    pub async fn send_base64(&self, encoded: &str) -> Result<(), StreamError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| StreamError::InvalidPayload(format!("base64: {}", e)))?;
        self.send_binary(data).await
    }

    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<(), StreamError> {
        self.enqueue(OutboundKind::Ping(cap_control(payload.into()))).await
    }

    pub async fn pong(&self, payload: impl Into<Bytes>) -> Result<(), StreamError> {
        self.enqueue(OutboundKind::Pong(cap_control(payload.into()))).await
    }

    pub async fn close(&self, code: u16, reason: &str) -> Result<(), StreamError> {
        self.enqueue(OutboundKind::Close {
            code,
            reason: cap_close_reason(reason),
        })
        .await
    }

    async fn enqueue(&self, kind: OutboundKind) -> Result<(), StreamError> {
        if self.session.is_terminal() {
            return Err(StreamError::SessionClosed);
        }

        let is_close = matches!(kind, OutboundKind::Close { .. });
        let (slot, result_rx) = match self.wait {
            Some(_) => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        let command = Outbound {
            kind,
            step: self.step.clone(),
            result: slot,
        };

        tokio::select! {
            biased;
            sent = self.tx.send(command) => sent.map_err(|_| StreamError::SessionClosed)?,
            _ = self.session.done() => return Err(StreamError::SessionClosed),
        }

        let (Some(result_rx), Some(timeout)) = (result_rx, self.wait) else {
            return Ok(());
        };

        tokio::select! {
            biased;
            outcome = result_rx => match outcome {
                Ok(outcome) => outcome,
                // writer went away without answering: the session is ending
                Err(_) if is_close => Ok(()),
                Err(_) => Err(StreamError::SessionClosed),
            },
            _ = self.session.done() => {
                if is_close {
                    Ok(())
                } else {
                    Err(StreamError::SessionClosed)
                }
            }
            _ = tokio::time::sleep(timeout) => Err(StreamError::Timeout("write")),
        }
    }
}
