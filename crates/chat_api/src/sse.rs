use chat_protocol::StreamEvent;
use serde_json::Value;
use tracing::warn;

/// Incremental parser for SSE text streams carrying protocol events.
///
/// Bytes are buffered until a frame is complete, so multibyte characters
/// split across network chunks decode intact.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    buffer: Vec<u8>,
}

impl SseStreamParser {
    /// Feed arbitrary bytes into the parser and drain complete events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.contains(&b'\r') {
            normalize_crlf(&mut self.buffer);
        }
        let mut events = Vec::new();

        while let Some(split) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(0..split + 2).take(split).collect();
            events.extend(decode_frame_bytes(&frame));
        }

        events
    }

    /// Drain a trailing frame left unterminated when the body ended.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let frame = std::mem::take(&mut self.buffer);
        if frame.iter().all(u8::is_ascii_whitespace) {
            return Vec::new();
        }
        decode_frame_bytes(&frame).into_iter().collect()
    }

    /// Parse a complete SSE payload string in one shot.
    pub fn parse_frames(input: &str) -> Vec<StreamEvent> {
        let mut parser = Self::default();
        let mut events = parser.feed(input.as_bytes());
        events.extend(parser.finish());
        events
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

/// Rewrites `\r\n` as `\n`. A trailing `\r` is kept until its `\n` arrives.
fn normalize_crlf(buffer: &mut Vec<u8>) {
    let mut normalized = Vec::with_capacity(buffer.len());
    let mut bytes = buffer.iter().copied().peekable();
    while let Some(byte) = bytes.next() {
        if byte == b'\r' && bytes.peek() == Some(&b'\n') {
            continue;
        }
        normalized.push(byte);
    }
    *buffer = normalized;
}

fn decode_frame_bytes(frame: &[u8]) -> Option<StreamEvent> {
    match std::str::from_utf8(frame) {
        Ok(frame) => decode_frame(frame),
        Err(error) => {
            warn!(%error, "dropping SSE frame that is not valid UTF-8");
            None
        }
    }
}

fn decode_frame(frame: &str) -> Option<StreamEvent> {
    let payload = extract_data_payload(frame)?;
    if payload == "[DONE]" {
        return None;
    }

    let value = match serde_json::from_str::<Value>(&payload) {
        Ok(value) => value,
        Err(error) => {
            warn!(%error, "dropping SSE frame with malformed JSON");
            return None;
        }
    };

    match StreamEvent::from_value(value) {
        Ok(event) => Some(event),
        Err(error) => {
            warn!(%error, "dropping SSE frame that is not a protocol event");
            None
        }
    }
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use chat_protocol::StreamEvent;

    use super::SseStreamParser;

    #[test]
    fn parse_sse_frames_incrementally() {
        let mut parser = SseStreamParser::default();
        let mut events = Vec::new();

        events.extend(parser.feed(b"data: {\"type\":\"text-delta\",\"id\":\"t\","));
        assert!(events.is_empty());
        assert!(!parser.is_empty_buffer());

        events.extend(parser.feed(b"\"delta\":\"Hello\"}\n\n"));
        assert_eq!(events, vec![StreamEvent::text_delta("t", "Hello")]);

        events.extend(parser.feed(b"data: [DONE]\n\n"));
        assert_eq!(events.len(), 1);
        assert!(parser.is_empty_buffer());
    }

    #[test]
    fn crlf_framing_and_unterminated_tail_are_handled() {
        let mut parser = SseStreamParser::default();
        let events = parser.feed(b"data: {\"type\":\"start-step\"}\r\n\r\ndata: {\"type\":\"finish\"}");
        assert_eq!(events, vec![StreamEvent::StartStep {}]);

        assert_eq!(
            parser.finish(),
            vec![StreamEvent::Finish {
                finish_reason: None
            }]
        );
        assert!(parser.is_empty_buffer());
    }
}
