//! Minimal SSE parsing for provider token streams.
//! Format: `event: <type>\ndata: <json>\n\n`

/// Parse a raw SSE byte stream into individual events.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

/// A parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the parser and extract complete events.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        // Split on double newlines (event boundaries)
        while let Some(pos) = self.buffer.find("\n\n") {
            let block = self.buffer[..pos].to_string();
            self.buffer = self.buffer[pos + 2..].to_string();

            let mut event_type = None;
            let mut data_lines = Vec::new();

            for line in block.lines() {
                if let Some(val) = line.strip_prefix("event: ") {
                    event_type = Some(val.to_string());
                } else if let Some(val) = line.strip_prefix("data: ") {
                    data_lines.push(val.to_string());
                } else if let Some(val) = line.strip_prefix("data:") {
                    data_lines.push(val.to_string());
                }
            }

            if !data_lines.is_empty() {
                events.push(SseEvent {
                    event_type,
                    data: data_lines.join("\n"),
                });
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_events() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].data, "[DONE]");
    }

    #[test]
    fn buffers_partial_events_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"half\":").is_empty());
        let events = parser.feed("true}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"half\":true}");
    }

    #[test]
    fn captures_event_type() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: delta\ndata: x\n\n");
        assert_eq!(events[0].event_type.as_deref(), Some("delta"));
    }

    #[test]
    fn multi_line_data_joined() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }
}
