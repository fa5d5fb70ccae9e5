//! DAP wire framing
//!
//! Frames are `Content-Length: N\r\n\r\n` followed by exactly N bytes of
//! UTF-8 JSON. The decoder accumulates raw bytes so frames may arrive split
//! across any read boundary.

use super::error::DapError;
use super::protocol::DapMessage;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Encode a message into a single wire frame.
pub fn encode_frame(message: &DapMessage) -> Result<Vec<u8>, DapError> {
    let body = serde_json::to_vec(message)
        .map_err(|e| DapError::Protocol(format!("failed to encode message: {e}")))?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental frame decoder with an internal byte accumulator.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the socket.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An unparseable header
    /// or a body that is not valid JSON is a fatal protocol error for the
    /// connection.
    pub fn next_message(&mut self) -> Result<Option<DapMessage>, DapError> {
        let header_end = match find_subslice(&self.buf, HEADER_TERMINATOR) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let content_length = parse_content_length(&self.buf[..header_end])?;
        let body_start = header_end + HEADER_TERMINATOR.len();
        let body_end = body_start + content_length;
        if self.buf.len() < body_end {
            return Ok(None);
        }

        let message = serde_json::from_slice(&self.buf[body_start..body_end])
            .map_err(|e| DapError::Protocol(format!("invalid JSON in frame body: {e}")))?;
        self.buf.drain(..body_end);
        Ok(Some(message))
    }
}

/// Parse the header block for a `Content-Length` line (case-insensitive).
fn parse_content_length(header: &[u8]) -> Result<usize, DapError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| DapError::Protocol("non-UTF-8 frame header".to_string()))?;
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value
                    .trim()
                    .parse()
                    .map_err(|_| DapError::Protocol(format!("bad Content-Length: {line:?}")));
            }
        }
    }
    Err(DapError::Protocol(format!(
        "missing Content-Length header in {text:?}"
    )))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::protocol::DapRequest;

    fn frame_for(command: &str, seq: u64) -> Vec<u8> {
        encode_frame(&DapMessage::Request(DapRequest {
            seq,
            command: command.to_string(),
            arguments: None,
        }))
        .unwrap()
    }

    fn command_of(msg: DapMessage) -> String {
        match msg {
            DapMessage::Request(r) => r.command,
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn whole_frame_decodes() {
        let mut dec = FrameDecoder::new();
        dec.push(&frame_for("initialize", 1));
        let msg = dec.next_message().unwrap().unwrap();
        assert_eq!(command_of(msg), "initialize");
        assert!(dec.next_message().unwrap().is_none());
    }

    #[test]
    fn byte_at_a_time_decodes() {
        let mut dec = FrameDecoder::new();
        let frame = frame_for("launch", 2);
        for (i, byte) in frame.iter().enumerate() {
            dec.push(std::slice::from_ref(byte));
            let msg = dec.next_message().unwrap();
            if i + 1 < frame.len() {
                assert!(msg.is_none(), "decoded early at byte {i}");
            } else {
                assert_eq!(command_of(msg.unwrap()), "launch");
            }
        }
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut dec = FrameDecoder::new();
        let mut bytes = frame_for("next", 3);
        bytes.extend_from_slice(&frame_for("stepIn", 4));
        dec.push(&bytes);
        assert_eq!(command_of(dec.next_message().unwrap().unwrap()), "next");
        assert_eq!(command_of(dec.next_message().unwrap().unwrap()), "stepIn");
        assert!(dec.next_message().unwrap().is_none());
    }

    #[test]
    fn split_across_header_and_body() {
        let mut dec = FrameDecoder::new();
        let frame = frame_for("continue", 5);
        let mid = frame.iter().position(|&b| b == b'{').unwrap() + 3;
        dec.push(&frame[..mid]);
        assert!(dec.next_message().unwrap().is_none());
        dec.push(&frame[mid..]);
        assert_eq!(command_of(dec.next_message().unwrap().unwrap()), "continue");
    }

    #[test]
    fn header_name_is_case_insensitive() {
        let body = br#"{"type":"event","seq":1,"event":"initialized"}"#;
        let mut bytes = format!("content-length: {}\r\n\r\n", body.len()).into_bytes();
        bytes.extend_from_slice(body);
        let mut dec = FrameDecoder::new();
        dec.push(&bytes);
        match dec.next_message().unwrap().unwrap() {
            DapMessage::Event(e) => assert_eq!(e.event, "initialized"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn invalid_json_body_is_fatal() {
        let mut dec = FrameDecoder::new();
        dec.push(b"Content-Length: 9\r\n\r\nnot json!");
        assert!(matches!(dec.next_message(), Err(DapError::Protocol(_))));
    }

    #[test]
    fn extra_headers_are_ignored() {
        let body = br#"{"type":"event","seq":2,"event":"stopped"}"#;
        let mut bytes = format!(
            "X-Custom: yes\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        bytes.extend_from_slice(body);
        let mut dec = FrameDecoder::new();
        dec.push(&bytes);
        assert!(dec.next_message().unwrap().is_some());
    }
}
