//! C1 - Frame codec: the on-wire envelope that multiplexes streams over one transport.
//!
//! Layout (network byte order):
//! `stream_id: u32 | flags: u8 | [method_path_len: u16, method_path][body]`

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const END_STREAM      = 0b0000_0001;
        const IS_METADATA      = 0b0000_0010;
        const HAS_METHOD_PATH  = 0b0000_0100;
    }
}

const HEADER_LEN: usize = 5;

/// A single on-wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub flags: FrameFlags,
    pub method_path: Option<String>,
    pub body: Bytes,
}

impl Frame {
    pub fn data(stream_id: u32, body: impl Into<Bytes>, end_of_stream: bool) -> Self {
        let mut flags = FrameFlags::empty();
        if end_of_stream {
            flags |= FrameFlags::END_STREAM;
        }
        Self {
            stream_id,
            flags,
            method_path: None,
            body: body.into(),
        }
    }

    pub fn metadata(
        stream_id: u32,
        method_path: Option<String>,
        body: impl Into<Bytes>,
        end_of_stream: bool,
    ) -> Self {
        let mut flags = FrameFlags::IS_METADATA;
        if end_of_stream {
            flags |= FrameFlags::END_STREAM;
        }
        if method_path.is_some() {
            flags |= FrameFlags::HAS_METHOD_PATH;
        }
        Self {
            stream_id,
            flags,
            method_path,
            body: body.into(),
        }
    }

    pub fn is_metadata(&self) -> bool {
        self.flags.contains(FrameFlags::IS_METADATA)
    }

    pub fn end_of_stream(&self) -> bool {
        self.flags.contains(FrameFlags::END_STREAM)
    }

    /// Encode this frame into `out`, appending to any existing contents.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), FrameError> {
        if self.stream_id == 0 {
            return Err(FrameError::ZeroStreamId);
        }
        if self.method_path.is_some() && !self.flags.contains(FrameFlags::IS_METADATA) {
            return Err(FrameError::MethodPathOnDataFrame);
        }

        out.put_u32(self.stream_id);
        out.put_u8(self.flags.bits());

        if let Some(path) = &self.method_path {
            let path_bytes = path.as_bytes();
            out.put_u16(path_bytes.len() as u16);
            out.put_slice(path_bytes);
        }

        out.put_slice(&self.body);
        Ok(())
    }

    /// Decode exactly one frame from `buf`, consuming it. `buf` must contain exactly
    /// one whole frame's worth of bytes (the transport is responsible for delimiting
    /// frames; see the transport contract).
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let stream_id = buf.get_u32();
        if stream_id == 0 {
            return Err(FrameError::ZeroStreamId);
        }
        let flags = FrameFlags::from_bits_truncate(buf.get_u8());

        let mut method_path = None;
        if flags.contains(FrameFlags::HAS_METHOD_PATH) {
            if !flags.contains(FrameFlags::IS_METADATA) {
                return Err(FrameError::MethodPathOnDataFrame);
            }
            if buf.len() < 2 {
                return Err(FrameError::Truncated);
            }
            let path_len = buf.get_u16() as usize;
            if buf.len() < path_len {
                return Err(FrameError::Truncated);
            }
            let path_bytes = buf.split_to(path_len);
            method_path = Some(
                String::from_utf8(path_bytes.to_vec())
                    .map_err(|_| FrameError::InvalidUtf8MethodPath)?,
            );
        }

        Ok(Self {
            stream_id,
            flags,
            method_path,
            body: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_data_frame() {
        let frame = Frame::data(3, Bytes::from_static(b"hello"), true);
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        let decoded = Frame::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trips_metadata_with_method_path() {
        let frame = Frame::metadata(
            1,
            Some("/Echo/Ping".to_string()),
            Bytes::from_static(b""),
            false,
        );
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        let decoded = Frame::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_zero_stream_id() {
        let frame = Frame::data(0, Bytes::new(), false);
        let mut buf = BytesMut::new();
        assert_eq!(frame.encode(&mut buf), Err(FrameError::ZeroStreamId));
    }

    #[test]
    fn rejects_method_path_on_data_frame() {
        let mut frame = Frame::data(1, Bytes::new(), false);
        frame.flags |= FrameFlags::HAS_METHOD_PATH;
        frame.method_path = Some("/x/y".to_string());
        let mut buf = BytesMut::new();
        assert_eq!(
            frame.encode(&mut buf),
            Err(FrameError::MethodPathOnDataFrame)
        );
    }

    #[test]
    fn rejects_truncated_header() {
        let buf = Bytes::from_static(&[0, 0, 0]);
        assert_eq!(Frame::decode(buf), Err(FrameError::Truncated));
    }

    #[test]
    fn rejects_truncated_method_path() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8((FrameFlags::IS_METADATA | FrameFlags::HAS_METHOD_PATH).bits());
        buf.put_u16(10);
        buf.put_slice(b"short");
        assert_eq!(Frame::decode(buf.freeze()), Err(FrameError::Truncated));
    }
}
