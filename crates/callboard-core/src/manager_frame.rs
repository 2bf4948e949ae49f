//! Framing for the switch's manager protocol: blocks of `Key: Value` lines
//! terminated by an empty line.

use crate::{DecodeReport, FrameError};

pub const DEFAULT_MAX_MANAGER_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManagerMessage {
    headers: Vec<(String, String)>,
}

impl ManagerMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(name: &str) -> Self {
        Self::new().with_header("Action", name)
    }

    pub fn event(name: &str) -> Self {
        Self::new().with_header("Event", name)
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    /// Replaces the first header named `key`, or appends it.
    pub fn set_header(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((key.to_string(), value)),
        }
    }

    /// Case-insensitive lookup of the first header named `key`.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn event_name(&self) -> Option<&str> {
        self.header("Event")
    }

    pub fn response(&self) -> Option<&str> {
        self.header("Response")
    }

    pub fn action_id(&self) -> Option<&str> {
        self.header("ActionID")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.headers.len() * 24 + 2);
        for (key, value) in &self.headers {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            // Header values are single-line on the wire.
            out.extend_from_slice(value.replace(['\r', '\n'], " ").as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Returns a fresh correlation id for an outbound action.
pub fn next_action_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub struct ManagerFrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    current: ManagerMessage,
    current_bytes: usize,
    /// Set after an oversized block; lines are dropped until its blank line.
    discarding: bool,
}

impl ManagerFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            current: ManagerMessage::new(),
            current_bytes: 0,
            discarding: false,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<ManagerMessage> {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.accept_line(&line, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.push_error(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
            self.reset_current();
            self.discarding = true;
        }

        report
    }

    fn accept_line(&mut self, line: &[u8], report: &mut DecodeReport<ManagerMessage>) {
        if line.is_empty() {
            if self.discarding {
                self.discarding = false;
                self.reset_current();
                return;
            }
            if !self.current.is_empty() {
                let message = std::mem::take(&mut self.current);
                self.current_bytes = 0;
                report.push_frame(message);
            }
            return;
        }

        if self.discarding {
            return;
        }

        self.current_bytes += line.len() + 2;
        if self.current_bytes > self.max_frame_bytes {
            report.push_error(FrameError::OversizedFrame {
                size: self.current_bytes,
                max: self.max_frame_bytes,
            });
            self.reset_current();
            self.discarding = true;
            return;
        }

        let text = String::from_utf8_lossy(line);
        match text.split_once(':') {
            Some((key, value)) => {
                let key = key.trim();
                if key.is_empty() {
                    report.push_error(FrameError::Decode(format!("empty header name: {text}")));
                    return;
                }
                self.current.headers.push((key.to_string(), value.trim().to_string()));
            }
            None => {
                // Free-form output lines (command responses) have no key.
                self.current
                    .headers
                    .push(("Output".to_string(), text.trim().to_string()));
            }
        }
    }

    fn reset_current(&mut self) {
        self.current = ManagerMessage::new();
        self.current_bytes = 0;
    }
}

impl Default for ManagerFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MANAGER_FRAME_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_blocks_split_across_chunks() {
        let mut decoder = ManagerFrameDecoder::default();
        let first = decoder.push_chunk(b"Event: QueueCallerJoin\r\nQueue: sup");
        assert!(first.frames.is_empty());
        let second = decoder.push_chunk(b"port\r\nUniqueid: 1700.1\r\n\r\nEvent: Hangup\n\n");
        assert_eq!(second.frames.len(), 2);
        assert_eq!(second.frames[0].event_name(), Some("QueueCallerJoin"));
        assert_eq!(second.frames[0].header("queue"), Some("support"));
        assert_eq!(second.frames[0].header("UNIQUEID"), Some("1700.1"));
        assert_eq!(second.frames[1].event_name(), Some("Hangup"));
    }

    #[test]
    fn values_keep_embedded_colons() {
        let mut decoder = ManagerFrameDecoder::default();
        let report = decoder.push_chunk(b"Event: Newchannel\r\nChannel: SIP/1001-0000:1\r\n\r\n");
        assert_eq!(report.frames[0].header("Channel"), Some("SIP/1001-0000:1"));
    }

    #[test]
    fn oversized_block_is_dropped_and_decoder_recovers() {
        let mut decoder = ManagerFrameDecoder::new(64);
        let mut chunk = format!("Event: Big\r\nBlob: {}\r\n\r\n", "x".repeat(128)).into_bytes();
        chunk.extend_from_slice(b"Event: Small\r\n\r\n");
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::OversizedFrame { .. }));
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].event_name(), Some("Small"));
    }

    #[test]
    fn lines_after_an_oversized_header_are_not_emitted() {
        let mut decoder = ManagerFrameDecoder::new(64);
        let chunk = format!(
            "Event: Big\r\nBlob: {}\r\nQueue: support\r\nUniqueid: 1.1\r\n\r\nEvent: Small\r\n\r\n",
            "x".repeat(128)
        );
        let report = decoder.push_chunk(chunk.as_bytes());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].event_name(), Some("Small"));
        assert_eq!(report.frames[0].header("Queue"), None);
    }

    #[test]
    fn overflowing_partial_line_discards_its_block() {
        let mut decoder = ManagerFrameDecoder::new(32);
        let report = decoder.push_chunk(format!("Event: Big\r\nBlob: {}", "x".repeat(64)).as_bytes());
        assert!(matches!(report.errors[0], FrameError::OversizedBuffer { .. }));
        let report = decoder.push_chunk(b"tail\r\nQueue: support\r\n\r\nEvent: Hangup\r\n\r\n");
        assert!(report.errors.is_empty());
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].event_name(), Some("Hangup"));
    }

    #[test]
    fn encode_terminates_block_and_flattens_newlines() {
        let action = ManagerMessage::action("QueuePause")
            .with_header("Interface", "SIP/1001")
            .with_header("Reason", "coffee\r\nbreak");
        let encoded = String::from_utf8(action.encode()).expect("utf8");
        assert_eq!(
            encoded,
            "Action: QueuePause\r\nInterface: SIP/1001\r\nReason: coffee  break\r\n\r\n"
        );
    }

    #[test]
    fn set_header_replaces_case_insensitively() {
        let mut message = ManagerMessage::action("Login").with_header("ActionID", "a");
        message.set_header("actionid", "b");
        assert_eq!(message.action_id(), Some("b"));
        assert_eq!(message.headers().count(), 2);
    }
}
