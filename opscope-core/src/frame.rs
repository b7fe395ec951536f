// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Event-stream frame parsing
//!
//! Incremental parser for `text/event-stream` payloads. Bytes are fed in
//! arbitrary chunks as they arrive from the network; complete frames are
//! returned as soon as their terminating blank line is seen.
//!
//! ```text
//! id: 42
//! event: message
//! data: {"operation_id": "42", ...}
//!
//! ```

/// One dispatched event-stream frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFrame {
    /// `id:` field of this frame, if any.
    pub id: Option<String>,
    /// `event:` field; `None` means the default `message` event.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
    /// `retry:` reconnection hint in milliseconds.
    pub retry: Option<u64>,
}

impl StreamFrame {
    /// Event name, defaulting to `message`.
    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

#[derive(Debug, Default)]
struct PendingFrame {
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
    retry: Option<u64>,
}

impl PendingFrame {
    fn take(&mut self) -> Option<StreamFrame> {
        let pending = std::mem::take(self);
        if pending.data.is_empty() {
            return None;
        }
        Some(StreamFrame {
            id: pending.id,
            event: pending.event,
            data: pending.data.join("\n"),
            retry: pending.retry,
        })
    }
}

/// Incremental event-stream parser.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
    pending: PendingFrame,
    started: bool,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        self.buffer.extend_from_slice(chunk);
        if !self.started && self.buffer.len() >= 3 {
            if self.buffer.starts_with(&[0xEF, 0xBB, 0xBF]) {
                self.buffer.drain(..3);
            }
            self.started = true;
        }

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(rel) = self.buffer[start..]
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r')
        {
            let end = start + rel;
            let mut next = end + 1;
            if self.buffer[end] == b'\r' {
                // A lone trailing CR may be the first half of CRLF.
                if next == self.buffer.len() {
                    break;
                }
                if self.buffer[next] == b'\n' {
                    next += 1;
                }
            }

            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            self.process_line(&line, &mut frames);
            start = next;
        }
        self.buffer.drain(..start);
        frames
    }

    /// Flush at end of input: a trailing line without terminator and a frame
    /// without its closing blank line are still dispatched.
    pub fn finish(&mut self) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            self.process_line(&line, &mut frames);
        }
        frames.extend(self.pending.take());
        frames
    }

    fn process_line(&mut self, line: &str, frames: &mut Vec<StreamFrame>) {
        if line.is_empty() {
            frames.extend(self.pending.take());
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.pending.data.push(value.to_string()),
            "event" => self.pending.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.pending.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.pending.retry = Some(ms);
                }
            }
            _ => {}
        }
    }
}

/// Parse a complete event-stream payload into frames.
pub fn parse_payload(payload: &str) -> Vec<StreamFrame> {
    let mut parser = FrameParser::new();
    let mut frames = parser.push(payload.as_bytes());
    frames.extend(parser.finish());
    frames
}
