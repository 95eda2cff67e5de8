//! HTTP client wrapper - builds streaming requests and formats rejections

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL};

use crate::config::DialOptions;
use crate::models::StreamResponse;
use crate::stream::StreamError;

/// A Server-Sent Events request
#[derive(Clone, Debug)]
pub struct SseRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl SseRequest {
    pub fn get(url: impl Into<String>) -> Self {
        SseRequest {
            method: reqwest::Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Merge dial-level and request-level headers; request headers win.
fn header_map(dial: &DialOptions, headers: &[(String, String)]) -> Result<HeaderMap, StreamError> {
    let mut map = HeaderMap::new();
    for (name, value) in dial.headers.iter().chain(headers) {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| StreamError::Request(format!("header {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| StreamError::Request(format!("header {}: {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Build a streaming request from the given parameters
pub fn build_sse_request(
    client: &reqwest::Client,
    request: &SseRequest,
    dial: &DialOptions,
) -> Result<reqwest::RequestBuilder, StreamError> {
    let mut headers = header_map(dial, &request.headers)?;
    headers
        .entry(ACCEPT)
        .or_insert(HeaderValue::from_static("text/event-stream"));
    headers
        .entry(CACHE_CONTROL)
        .or_insert(HeaderValue::from_static("no-cache"));

    let mut req_builder = client
        .request(request.method.clone(), &request.url)
        .headers(headers);
    if let Some(body) = &request.body {
        req_builder = req_builder.body(body.clone());
    }
    Ok(req_builder)
}

/// Describe a send failure the way the rest of the client does
pub fn describe_send_error(e: &reqwest::Error) -> StreamError {
    let msg = if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    };
    StreamError::Request(msg)
}

/// Turn a non-streaming answer into an ordinary response
pub async fn rejection_response(resp: reqwest::Response, started: Instant) -> StreamResponse {
    let status = resp.status();
    let headers = resp
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = match resp.text().await {
        Ok(body) => body,
        Err(e) => format!("Error reading body: {}", e),
    };
    StreamResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        body,
        duration: started.elapsed(),
    }
}

/// Create an HTTP client for long-lived streams.
///
/// No overall request timeout: stream lifetime is governed by the session.
pub fn create_client(dial: &DialOptions) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .danger_accept_invalid_certs(dial.insecure)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
