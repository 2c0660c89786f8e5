//! SSE (Server-Sent Events) byte-stream parsing.
//!
//! Providers stream responses as SSE over HTTP. The parser here buffers
//! partial lines across TCP chunk boundaries, strips `data:` prefixes,
//! recognizes the `[DONE]` sentinel, and guards against streams that repeat
//! the same payload forever.

use std::collections::VecDeque;

use futures::StreamExt;

use crate::error::GatewayError;
use crate::transform::ByteStream;

/// Consecutive identical payloads tolerated before the stream is aborted.
const MAX_IDENTICAL_EVENTS: u32 = 100;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Payload of a `data:` line, prefix stripped.
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
    /// Comment or other line we deliberately ignore.
    Skip,
}

/// Stateful SSE parser.
///
/// Feed it raw text chunks as they arrive; complete events come back in
/// order, partial trailing lines stay buffered until the next chunk.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    last_payload: String,
    repeats: u32,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and collect every event completed by it.
    pub fn feed(&mut self, chunk: &str) -> Result<Vec<SseEvent>, GatewayError> {
        self.buffer.push_str(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(event) = self.parse_line(line.trim_end_matches(['\n', '\r']))? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Flush a trailing unterminated line when the upstream ends.
    pub fn flush(&mut self) -> Result<Option<SseEvent>, GatewayError> {
        let remaining = std::mem::take(&mut self.buffer);
        let line = remaining.trim();
        if line.is_empty() {
            return Ok(None);
        }
        self.parse_line(line)
    }

    fn parse_line(&mut self, line: &str) -> Result<Option<SseEvent>, GatewayError> {
        if line.is_empty() {
            // Event boundary.
            return Ok(None);
        }
        if line.starts_with(':') {
            return Ok(Some(SseEvent::Skip));
        }
        if line.starts_with("event:") {
            return Ok(None);
        }

        if let Some(payload) = line.strip_prefix("data:") {
            let payload = payload.trim_start();
            if payload == "[DONE]" {
                return Ok(Some(SseEvent::Done));
            }
            self.check_repeat(payload)?;
            return Ok(Some(SseEvent::Data(payload.to_string())));
        }

        // Some providers emit bare JSON lines without the data: prefix.
        let trimmed = line.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            self.check_repeat(trimmed)?;
            return Ok(Some(SseEvent::Data(trimmed.to_string())));
        }

        Ok(None)
    }

    fn check_repeat(&mut self, payload: &str) -> Result<(), GatewayError> {
        if payload == self.last_payload {
            self.repeats += 1;
            if self.repeats >= MAX_IDENTICAL_EVENTS {
                return Err(GatewayError::Stream(format!(
                    "aborting stream: {MAX_IDENTICAL_EVENTS} identical consecutive events"
                )));
            }
        } else {
            self.last_payload = payload.to_string();
            self.repeats = 1;
        }
        Ok(())
    }
}

/// Turn a raw SSE byte stream into a lazy stream of `data:` payloads.
///
/// The stream ends at the `[DONE]` sentinel or upstream EOF; dropping it drops
/// the upstream. A parse failure yields one `Err` item and then ends.
pub fn data_events(
    upstream: ByteStream,
) -> impl futures::Stream<Item = Result<String, GatewayError>> + Send {
    struct State {
        upstream: ByteStream,
        parser: SseParser,
        ready: VecDeque<String>,
        finished: bool,
    }

    let state = State {
        upstream,
        parser: SseParser::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(payload) = state.ready.pop_front() {
                return Some((Ok(payload), state));
            }
            if state.finished {
                return None;
            }

            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    match state.parser.feed(&text) {
                        Ok(events) => {
                            for event in events {
                                match event {
                                    SseEvent::Data(payload) => state.ready.push_back(payload),
                                    SseEvent::Done => {
                                        // Anything after the sentinel is noise.
                                        state.finished = true;
                                        break;
                                    }
                                    SseEvent::Skip => {}
                                }
                            }
                        }
                        Err(error) => {
                            state.finished = true;
                            return Some((Err(error), state));
                        }
                    }
                }
                Some(Err(error)) => {
                    state.finished = true;
                    return Some((Err(error), state));
                }
                None => {
                    state.finished = true;
                    match state.parser.flush() {
                        Ok(Some(SseEvent::Data(payload))) => state.ready.push_back(payload),
                        Ok(_) => {}
                        Err(error) => return Some((Err(error), state)),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_feed_complete_event() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: {\"x\":1}\n\n").expect("feed");
        assert_eq!(events, vec![SseEvent::Data("{\"x\":1}".into())]);
    }

    #[test]
    fn test_feed_partial_lines_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"x\"").expect("feed").is_empty());
        let events = parser.feed(":1}\ndata: {\"x\":2}\n").expect("feed");
        assert_eq!(
            events,
            vec![
                SseEvent::Data("{\"x\":1}".into()),
                SseEvent::Data("{\"x\":2}".into())
            ]
        );
    }

    #[test]
    fn test_done_sentinel() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: [DONE]\n").expect("feed");
        assert_eq!(events, vec![SseEvent::Done]);
    }

    #[test]
    fn test_comments_and_event_lines_skipped() {
        let mut parser = SseParser::new();
        let events = parser.feed(": keepalive\nevent: ping\n").expect("feed");
        assert_eq!(events, vec![SseEvent::Skip]);
    }

    #[test]
    fn test_bare_json_line_accepted() {
        let mut parser = SseParser::new();
        let events = parser.feed("{\"candidates\":[]}\n").expect("feed");
        assert_eq!(events, vec![SseEvent::Data("{\"candidates\":[]}".into())]);
    }

    #[test]
    fn test_flush_trailing_data() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"tail\":true}").expect("feed").is_empty());
        let flushed = parser.flush().expect("flush");
        assert_eq!(flushed, Some(SseEvent::Data("{\"tail\":true}".into())));
    }

    #[test]
    fn test_repeat_guard_trips() {
        let mut parser = SseParser::new();
        let mut result = Ok(Vec::new());
        for _ in 0..=MAX_IDENTICAL_EVENTS {
            result = parser.feed("data: same\n");
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(GatewayError::Stream(_))));
    }

    #[tokio::test]
    async fn test_data_events_stops_at_done() {
        let chunks: Vec<Result<bytes::Bytes, GatewayError>> = vec![
            Ok("data: {\"a\":1}\n".into()),
            Ok("data: [DONE]\ndata: {\"b\":2}\n".into()),
        ];
        let upstream: ByteStream = Box::pin(futures::stream::iter(chunks));

        let events: Vec<_> = data_events(upstream).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_deref().expect("payload"), "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_data_events_flushes_at_eof() {
        let chunks: Vec<Result<bytes::Bytes, GatewayError>> =
            vec![Ok("data: {\"a\":1}\ndata: {\"b\":2}".into())];
        let upstream: ByteStream = Box::pin(futures::stream::iter(chunks));

        let events: Vec<_> = data_events(upstream)
            .map(|e| e.expect("payload"))
            .collect()
            .await;
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }
}
