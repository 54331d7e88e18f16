//! Incremental parser for the `event:`/`data:` text framing.
//!
//! Feeds on raw response-body chunks; frame boundaries are blank lines.
//! Bytes are buffered until a newline, so multi-byte characters split
//! across network chunks are never mangled.

pub struct SseFrameParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: String,
}

impl Default for SseFrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            event: None,
            data: String::new(),
        }
    }

    /// Feed raw bytes; returns every `(event_type, data)` frame completed
    /// by this chunk.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<(String, String)> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']).trim();

            if line.is_empty() {
                if let Some(event) = self.event.take() {
                    if !self.data.is_empty() {
                        frames.push((event, std::mem::take(&mut self.data)));
                    }
                }
                self.data.clear();
                continue;
            }

            if let Some(rest) = line.strip_prefix("event:") {
                self.event = Some(rest.trim().to_owned());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push_str(rest.trim());
            }
            // Comment lines (`:`) and unknown fields are ignored.
        }

        frames
    }
}
