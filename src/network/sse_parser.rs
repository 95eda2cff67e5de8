//! SSE (Server-Sent Events) line framer.
//!
//! Works on raw body bytes and hands back one line at a time together with
//! the number of bytes it consumed, so the runtime can enforce its byte
//! budget on exact line boundaries:
//! - Line splitting (handles both `\n` and `\r\n`)
//! - Field parsing (`data:`, `event:`, `id:`, `retry:`, `:` comments)
//! - Event assembly (multi-line `data:` until blank line)

use crate::stream::SseMeta;

/// An SSE line after field parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    /// A `data:` line with the payload (prefix stripped).
    Data(String),
    /// An `event:` line with the event type.
    Event(String),
    /// An `id:` line with the event ID.
    Id(String),
    /// A `retry:` line with reconnection time (ms).
    Retry(u64),
    /// A comment line (starts with `:`).
    Comment(String),
    /// An empty line (event boundary in SSE).
    Empty,
    /// Unknown field or malformed value, ignored per the SSE grammar.
    Ignored,
}

/// One dispatched event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseMessage {
    pub data: String,
    pub event: String,
    pub id: String,
    pub comment: String,
    pub retry: Option<u64>,
}

impl SseMessage {
    pub fn meta(&self) -> SseMeta {
        SseMeta {
            event: self.event.clone(),
            id: self.id.clone(),
            comment: self.comment.clone(),
            retry_ms: self.retry,
        }
    }
}

pub fn parse_line(line: &str) -> SseLine {
    if line.is_empty() {
        return SseLine::Empty;
    }

    if let Some(comment) = line.strip_prefix(':') {
        let comment = comment.strip_prefix(' ').unwrap_or(comment);
        return SseLine::Comment(comment.to_string());
    }

    // A line without a colon is a field name with an empty value
    let (field, value) = match line.split_once(':') {
        Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
        None => (line, ""),
    };

    match field {
        "data" => SseLine::Data(value.to_string()),
        "event" => SseLine::Event(value.to_string()),
        "id" if !value.contains('\0') => SseLine::Id(value.to_string()),
        "retry" => match value.trim().parse::<u64>() {
            Ok(ms) => SseLine::Retry(ms),
            Err(_) => SseLine::Ignored,
        },
        _ => SseLine::Ignored,
    }
}

#[derive(Default)]
struct EventBuilder {
    data_lines: Vec<String>,
    event: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
    comments: Vec<String>,
}

impl EventBuilder {
    fn push_line(&mut self, line: SseLine) {
        match line {
            SseLine::Data(data) => self.data_lines.push(data),
            SseLine::Event(event) => self.event = Some(event),
            SseLine::Id(id) => self.id = Some(id),
            SseLine::Retry(retry) => self.retry = Some(retry),
            SseLine::Comment(comment) => self.comments.push(comment),
            SseLine::Empty | SseLine::Ignored => {}
        }
    }

    fn has_content(&self) -> bool {
        !self.data_lines.is_empty()
            || self.event.is_some()
            || self.id.is_some()
            || self.retry.is_some()
            || !self.comments.is_empty()
    }

    fn build(&mut self) -> SseMessage {
        let message = SseMessage {
            data: self.data_lines.join("\n"),
            event: self.event.take().unwrap_or_default(),
            id: self.id.take().unwrap_or_default(),
            comment: self.comments.join("\n"),
            retry: self.retry.take(),
        };
        self.data_lines.clear();
        self.comments.clear();
        message
    }
}

/// Result of feeding one physical line through the decoder
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLine {
    /// Bytes of the body this line accounted for, terminator included
    pub consumed: usize,
    /// Set when the line completed an event
    pub message: Option<SseMessage>,
}

/// Incremental decoder: push body chunks, pull lines.
///
/// Lines end with `\r\n`, `\n` or a lone `\r`.
#[derive(Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    builder: EventBuilder,
    /// Last line ended with `\r` at the end of the buffer; a following `\n`
    /// belongs to that terminator
    skip_lf: bool,
    /// Terminator bytes already dropped but not yet reported as consumed
    carried: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Bytes received but not yet handed out as part of a line
    pub fn pending_len(&self) -> usize {
        self.pending.len() + self.carried
    }

    /// Next complete line from the buffered bytes, if any
    pub fn next_line(&mut self) -> Option<DecodedLine> {
        if self.skip_lf && !self.pending.is_empty() {
            self.skip_lf = false;
            if self.pending[0] == b'\n' {
                self.pending.drain(..1);
                self.carried += 1;
            }
        }

        let end = self
            .pending
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r')?;
        let terminator = match (self.pending[end], self.pending.get(end + 1).copied()) {
            (b'\r', Some(b'\n')) => 2,
            (b'\r', None) => {
                self.skip_lf = true;
                1
            }
            _ => 1,
        };
        let mut line: Vec<u8> = self.pending.drain(..end + terminator).collect();
        line.truncate(end);
        let consumed = end + terminator + std::mem::take(&mut self.carried);
        Some(self.apply(&line, consumed))
    }

    /// Flush at end of stream: a trailing unterminated line is processed and
    /// a non-empty event in progress is dispatched.
    pub fn finish(&mut self) -> Option<DecodedLine> {
        let rest = std::mem::take(&mut self.pending);
        let consumed = rest.len() + std::mem::take(&mut self.carried);
        self.skip_lf = false;
        if !rest.is_empty() {
            let line = String::from_utf8_lossy(&rest);
            self.builder.push_line(parse_line(&line));
        }
        let message = self.builder.has_content().then(|| self.builder.build());
        if consumed == 0 && message.is_none() {
            return None;
        }
        Some(DecodedLine { consumed, message })
    }

    fn apply(&mut self, line: &[u8], consumed: usize) -> DecodedLine {
        let line = String::from_utf8_lossy(line);
        let message = match parse_line(&line) {
            SseLine::Empty if self.builder.has_content() => Some(self.builder.build()),
            SseLine::Empty => None,
            other => {
                self.builder.push_line(other);
                None
            }
        };
        DecodedLine { consumed, message }
    }
}
