//! Incremental server-sent-events parsing.
//!
//! Feed raw body chunks in, get completed events out. A chunk boundary can
//! land anywhere, including mid-line, so the parser buffers partial lines
//! between pushes. Only the `event:` and `data:` fields matter here;
//! `id:`, `retry:` and comment lines are skipped.

/// One dispatched event. `data` is the joined payload lines, newline
/// separated, as the SSE spec prescribes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSseEvent {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    /// Consume one body chunk and return every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawSseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let mut line = self.buffer[..newline].to_string();
            self.buffer.drain(..=newline);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(event) = self.take_line(&line) {
                out.push(event);
            }
        }
        out
    }

    /// Drain a trailing event that never got its terminating blank line.
    /// Some servers close the connection right after the last `data:` line.
    pub fn finish(&mut self) -> Option<RawSseEvent> {
        let line = std::mem::take(&mut self.buffer);
        if !line.is_empty() {
            let line = line.trim_end_matches('\r').to_string();
            self.take_line(&line);
        }
        self.dispatch()
    }

    fn take_line(&mut self, line: &str) -> Option<RawSseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawSseEvent> {
        if self.event.is_none() && self.data_lines.is_empty() {
            return None;
        }
        let event = self.event.take();
        let data = std::mem::take(&mut self.data_lines).join("\n");
        Some(RawSseEvent { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_event() {
        let mut parser = SseParser::default();
        let events = parser.push(b"event: thread.message.delta\ndata: {\"a\":1}\n\n");
        assert_eq!(
            events,
            vec![RawSseEvent {
                event: Some("thread.message.delta".to_string()),
                data: "{\"a\":1}".to_string(),
            }]
        );
    }

    #[test]
    fn reassembles_across_chunk_boundaries() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"event: done\nda").is_empty());
        assert!(parser.push(b"ta: [DO").is_empty());
        let events = parser.push(b"NE]\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "[DONE]");
    }

    #[test]
    fn joins_multi_line_data_and_handles_crlf() {
        let mut parser = SseParser::default();
        let events = parser.push(b"data: first\r\ndata: second\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, None);
        assert_eq!(events[0].data, "first\nsecond");
    }

    #[test]
    fn skips_comments_and_unknown_fields() {
        let mut parser = SseParser::default();
        let events = parser.push(b": keep-alive\nid: 7\nretry: 100\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"data: tail").is_empty());
        let event = parser.finish().expect("trailing event");
        assert_eq!(event.data, "tail");
    }
}
