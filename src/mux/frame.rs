//! Frame codec for multiplexed sessions
//!
//! Frame format (rides inside one transport frame, which carries the
//! length):
//!
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |          Stream ID (4B)           |
//! +--------+--------+--------+--------+--------+
//! |                 Payload                    |
//! +--------------------------------------------+
//! ```

use super::MuxError;
use crate::crypto::TAG_LEN;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const MUX_HEADER_SIZE: usize = 5;

/// Maximum payload of a data frame, leaving room for the header and the
/// AEAD tag of a sealed transport frame
pub const MAX_DATA_LEN: usize = MAX_FRAME_SIZE - TAG_LEN - MUX_HEADER_SIZE;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Data on an open stream
    Data = 0x00,
    /// Stream open request; payload is the destination address
    Open = 0x01,
    /// Stream close
    Close = 0x02,
    /// Session is going away
    GoAway = 0x03,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::Open),
            0x02 => Ok(FrameType::Close),
            0x03 => Ok(FrameType::GoAway),
            _ => Err(MuxError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A session frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// Create a stream open frame
    pub fn open(stream_id: u32, destination: &[u8]) -> Self {
        Self {
            frame_type: FrameType::Open,
            stream_id,
            payload: Bytes::copy_from_slice(destination),
        }
    }

    /// Create a stream close frame
    pub fn close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Close,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a session go-away frame
    pub fn go_away() -> Self {
        Self {
            frame_type: FrameType::GoAway,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Encode into a transport frame payload
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(MUX_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from a transport frame payload
    pub fn decode(mut buf: BytesMut) -> Result<Self, MuxError> {
        if buf.len() < MUX_HEADER_SIZE {
            return Err(MuxError::InvalidFrame(format!(
                "Short frame: {} bytes",
                buf.len()
            )));
        }

        let frame_type = FrameType::try_from(buf.get_u8())?;
        let stream_id = buf.get_u32();

        Ok(Self {
            frame_type,
            stream_id,
            payload: buf.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_roundtrip() {
        let frame = Frame::data(42, Bytes::from_static(b"Hello, World!"));
        let decoded = Frame::decode(frame.encode()).unwrap();

        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.stream_id, 42);
        assert_eq!(&decoded.payload[..], b"Hello, World!");
    }

    #[test]
    fn test_open_frame_carries_destination() {
        let frame = Frame::open(7, b"127.0.0.1:8080");
        let decoded = Frame::decode(frame.encode()).unwrap();

        assert_eq!(decoded.frame_type, FrameType::Open);
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(&decoded.payload[..], b"127.0.0.1:8080");
    }

    #[test]
    fn test_short_frame_rejected() {
        let buf = BytesMut::from(&[0x00, 0x01][..]);
        assert!(Frame::decode(buf).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x77);
        buf.put_u32(1);
        assert!(Frame::decode(buf).is_err());
    }
}
