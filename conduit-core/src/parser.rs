//! C3 - Message parser: reassembles length-prefixed payload frames from a DATA body,
//! tolerating arbitrary chunk boundaries.
//!
//! Payload frame layout: `compression_flag: u8 | length: u32 (BE) | message_bytes`.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ParserError;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// A single decoded payload, with its compression flag preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub compression_flag: u8,
    pub message: Bytes,
}

/// Stateful per-stream reassembler.
pub struct MessageParser {
    buf: BytesMut,
    max_message_size: usize,
}

impl MessageParser {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Feed newly-arrived bytes and drain as many whole payload frames as are present.
    /// Leftover partial bytes remain buffered for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Payload>, ParserError> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            // compression_flag(1) + length(4)
            if self.buf.len() < 5 {
                break;
            }
            let declared_len = u32::from_be_bytes([
                self.buf[1],
                self.buf[2],
                self.buf[3],
                self.buf[4],
            ]) as usize;

            if declared_len > self.max_message_size {
                return Err(ParserError::MessageTooLarge {
                    declared: declared_len,
                    max: self.max_message_size,
                });
            }

            if self.buf.len() < 5 + declared_len {
                break;
            }

            let compression_flag = self.buf[0];
            self.buf.advance(5);
            let message = self.buf.split_to(declared_len).freeze();
            out.push(Payload {
                compression_flag,
                message,
            });
        }

        Ok(out)
    }
}

/// Encode a single payload frame (used by callers/responders before emitting a DATA frame).
pub fn encode_payload(compression_flag: u8, message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + message.len());
    buf.extend_from_slice(&[compression_flag]);
    buf.extend_from_slice(&(message.len() as u32).to_be_bytes());
    buf.extend_from_slice(message);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_payload_in_one_push() {
        let mut parser = MessageParser::new(DEFAULT_MAX_MESSAGE_SIZE);
        let frame = encode_payload(0, b"hello");
        let out = parser.push(&frame).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message, Bytes::from_static(b"hello"));
        assert_eq!(out[0].compression_flag, 0);
    }

    #[test]
    fn parses_across_arbitrary_chunk_boundaries() {
        let mut parser = MessageParser::new(DEFAULT_MAX_MESSAGE_SIZE);
        let frame = encode_payload(0, b"hello world");
        let mut all = Vec::new();
        for byte in &frame {
            all.extend(parser.push(&[*byte]).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].message, Bytes::from_static(b"hello world"));
    }

    #[test]
    fn parses_concatenated_payloads() {
        let mut parser = MessageParser::new(DEFAULT_MAX_MESSAGE_SIZE);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode_payload(0, b"one"));
        bytes.extend_from_slice(&encode_payload(0, b"two"));
        let out = parser.push(&bytes).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message, Bytes::from_static(b"one"));
        assert_eq!(out[1].message, Bytes::from_static(b"two"));
    }

    #[test]
    fn rejects_oversized_message() {
        let mut parser = MessageParser::new(4);
        let frame = encode_payload(0, b"hello");
        assert_eq!(
            parser.push(&frame),
            Err(ParserError::MessageTooLarge { declared: 5, max: 4 })
        );
    }
}
