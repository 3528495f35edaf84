//! Incremental server-sent events parser.

/// One dispatched event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// Turns raw stream chunks into events.
///
/// Chunks may split lines and multi-byte characters anywhere; bytes are held
/// until a full line arrives. A blank line dispatches the pending event.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: String,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.trim()),
            None => (line, ""),
        };

        match field {
            "event" => self.event = value.to_string(),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => self.retry = value.parse().ok(),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.event.is_empty() && self.data.is_empty() {
            return None;
        }
        let event = SseEvent {
            event: std::mem::take(&mut self.event),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
            retry: self.retry.take(),
        };
        Some(event)
    }

    /// Drop any partial line and pending fields, e.g. after a reconnect.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: init\ndata: {\"flags\":{}}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "init");
        assert_eq!(events[0].data, "{\"flags\":{}}");
    }

    #[test]
    fn test_multiline_data_joined() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: first\ndata: second\n\n");
        assert_eq!(events[0].data, "first\nsecond");
        assert_eq!(events[0].event, "");
    }

    #[test]
    fn test_split_chunks_and_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: flag-up").is_empty());
        assert!(parser.feed(b"date\r\ndata: {\"key\":").is_empty());
        let events = parser.feed(b"\"a\",\"enabled\":true}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "flag-update");
        assert_eq!(events[0].data, "{\"key\":\"a\",\"enabled\":true}");
    }

    #[test]
    fn test_split_multibyte_character() {
        let mut parser = SseParser::new();
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        let split = bytes.len() - 3;
        assert!(parser.feed(&bytes[..split]).is_empty());
        let events = parser.feed(&bytes[split..]);
        assert_eq!(events[0].data, "caf\u{e9}");
    }

    #[test]
    fn test_id_retry_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keepalive\nid: 42\nretry: 5000\nevent: flags\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("42"));
        assert_eq!(events[0].retry, Some(5000));
    }

    #[test]
    fn test_blank_lines_without_fields_dispatch_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"\n\n: ping\n\n").is_empty());
    }
}
