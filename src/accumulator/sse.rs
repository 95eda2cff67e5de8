//! SSE transcript

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{human_duration, nanos};
use crate::constants::{META_SSE_BYTES, META_SSE_EVENTS, META_SSE_REASON, REASON_EOF};
use crate::models::StreamResponse;
use crate::stream::{Direction, Event, Kind, Session, Stats};

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SseEventRecord {
    pub index: usize,
    pub id: String,
    pub event: String,
    pub data: String,
    pub comment: String,
    /// Reconnection hint in ms, 0 when the server sent none
    pub retry: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SseSummary {
    pub event_count: u64,
    pub byte_count: u64,
    #[serde(with = "nanos")]
    pub duration: Duration,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SseTranscript {
    pub events: Vec<SseEventRecord>,
    pub summary: SseSummary,
}

/// Replay an SSE session history.
///
/// Counts start from what the history shows and are replaced by the
/// runtime's final bookkeeping event when present.
pub fn accumulate(events: &[Event], stats: &Stats) -> SseTranscript {
    let mut records = Vec::new();
    let mut summary = SseSummary {
        event_count: 0,
        byte_count: stats.bytes,
        duration: stats.duration(),
        reason: REASON_EOF.to_string(),
    };

    for event in events {
        match event.direction {
            Direction::Receive => {
                let meta = event.sse().cloned().unwrap_or_default();
                records.push(SseEventRecord {
                    index: records.len(),
                    id: meta.id,
                    event: meta.event,
                    data: event.text(),
                    comment: meta.comment,
                    retry: meta.retry_ms.unwrap_or(0),
                    timestamp: event.timestamp,
                });
            }
            Direction::Info => {
                if let Some(reason) = event.metadata(META_SSE_REASON) {
                    summary.reason = reason.to_string();
                }
                if let Some(bytes) = event.metadata(META_SSE_BYTES).and_then(|v| v.parse().ok()) {
                    summary.byte_count = bytes;
                }
                if let Some(count) = event.metadata(META_SSE_EVENTS).and_then(|v| v.parse().ok()) {
                    summary.event_count = count;
                }
            }
            Direction::Send => {}
        }
    }

    if !events.iter().any(|e| e.metadata(META_SSE_EVENTS).is_some()) {
        summary.event_count = records.len() as u64;
    }

    SseTranscript {
        events: records,
        summary,
    }
}

/// Render a finished session with the upstream status and headers
pub fn render(session: &Session, status: u16, headers: &[(String, String)]) -> StreamResponse {
    let stats = session.stats_snapshot();
    let transcript = accumulate(&session.events_snapshot(), &stats);
    let summary = &transcript.summary;
    let line = format!(
        "events={} bytes={} reason={} duration={}",
        summary.event_count,
        summary.byte_count,
        summary.reason,
        human_duration(summary.duration)
    );
    super::render(Kind::Sse, status, headers, &transcript, line, stats.duration())
}
