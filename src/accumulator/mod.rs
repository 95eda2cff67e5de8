//! Accumulators - replay a finished session into a transcript and summary
//!
//! Each protocol turns `events_snapshot()` plus `stats_snapshot()` into a
//! serializable transcript, rendered as the JSON body of a [`StreamResponse`].

pub mod sse;
pub mod websocket;

use std::time::Duration;

use serde::Serialize;

use crate::constants::{HEADER_STREAM_SUMMARY, HEADER_STREAM_TYPE};
use crate::models::StreamResponse;
use crate::stream::Kind;

/// Serialize a [`Duration`] as integer nanoseconds
pub(crate) mod nanos {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_nanos()).unwrap_or(u64::MAX))
    }
}

/// Short human form used in the summary header
pub(crate) fn human_duration(duration: Duration) -> String {
    if duration >= Duration::from_secs(1) {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Build the response for a finished stream.
///
/// Upstream headers are kept except the body-describing ones, which no
/// longer match the rendered JSON.
pub(crate) fn render<T: Serialize>(
    kind: Kind,
    status: u16,
    upstream: &[(String, String)],
    transcript: &T,
    summary_line: String,
    duration: Duration,
) -> StreamResponse {
    let body = serde_json::to_string_pretty(transcript)
        .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e));

    let mut headers: Vec<(String, String)> = upstream
        .iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case("content-type") && !name.eq_ignore_ascii_case("content-length")
        })
        .cloned()
        .collect();
    headers.push(("Content-Type".to_string(), "application/json".to_string()));
    headers.push((HEADER_STREAM_TYPE.to_string(), kind.as_str().to_string()));
    headers.push((HEADER_STREAM_SUMMARY.to_string(), summary_line));

    StreamResponse {
        status,
        status_text: reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or_default()
            .to_string(),
        headers,
        body,
        duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Sample {
        events: Vec<u8>,
        #[serde(with = "nanos")]
        duration: Duration,
    }

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(human_duration(Duration::from_millis(1500)), "1.50s");
    }

    #[test]
    fn test_render_replaces_body_headers() {
        let upstream = vec![
            ("content-type".to_string(), "text/event-stream".to_string()),
            ("x-request-id".to_string(), "abc".to_string()),
        ];
        let sample = Sample {
            events: vec![1],
            duration: Duration::from_micros(3),
        };
        let resp = render(Kind::Sse, 200, &upstream, &sample, "events=1".into(), Duration::ZERO);

        assert_eq!(resp.status_text, "OK");
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert_eq!(resp.header("x-request-id"), Some("abc"));
        assert_eq!(resp.header(HEADER_STREAM_SUMMARY), Some("events=1"));
        let body: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(body["duration"], 3000);
        assert!(resp.body.contains('\n'));
    }
}
