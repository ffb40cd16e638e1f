//! HTTP/2 frame layout
//!
//! Frame format (RFC 9113 Section 4.1):
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+-------------------------------+
//! |R|                 Stream Identifier (31)                      |
//! +=+=============================================================+
//! |                   Frame Payload (0...)                      ...
//! +---------------------------------------------------------------+
//! ```

use crate::http2::FRAME_HEADER_LENGTH;
use thiserror::Error;

/// HTTP/2 frame types (RFC 9113 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::GoAway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }
}

/// HTTP/2 frame flags (RFC 9113 Section 6)
pub mod flags {
    pub const NONE: u8 = 0x0;
    /// SETTINGS and PING
    pub const ACK: u8 = 0x1;
    /// HEADERS and DATA
    pub const END_STREAM: u8 = 0x1;
    /// HEADERS, PUSH_PROMISE and CONTINUATION
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    /// HEADERS only
    pub const PRIORITY: u8 = 0x20;
    /// Pre-standard DATA compression flag, never valid without negotiation
    pub const COMPRESSED: u8 = 0x20;
}

/// GOAWAY and RST_STREAM error codes (RFC 9113 Section 7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => return None,
        })
    }
}

/// Frame-level protocol violations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame size error: {0} exceeds max frame size {1}")]
    FrameSize(usize, usize),

    #[error("{0} frame with stream id 0")]
    ZeroStreamId(&'static str),

    #[error("{0} frame with non-zero stream id {1}")]
    NonZeroStreamId(&'static str, u32),

    #[error("Padding {padding} exceeds remaining length {remaining}")]
    Padding { padding: usize, remaining: usize },

    #[error("CONTINUATION stream id changed from {expected} to {actual}")]
    ContinuationStreamChanged { expected: u32, actual: u32 },

    #[error("CONTINUATION without a preceding HEADERS frame")]
    UnexpectedContinuation,

    #[error("SETTINGS ACK with payload length {0}")]
    SettingsAckWithPayload(usize),

    #[error("SETTINGS payload length {0} is not a multiple of 6")]
    SettingsLength(usize),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("GOAWAY payload length {0} < 8")]
    GoAwayLength(usize),

    #[error("DATA frame has FLAG_COMPRESSED set")]
    Compressed,
}

/// Decoded 9-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    /// Raw type byte, may be an extension type
    pub kind: u8,
    pub flags: u8,
    /// 31-bit stream id, reserved bit masked off
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn new(kind: FrameType, flags: u8, stream_id: u32, length: usize) -> Self {
        Self {
            length,
            kind: kind as u8,
            flags,
            stream_id,
        }
    }

    /// Parse the first 9 bytes, `None` when fewer are available
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_LENGTH {
            return None;
        }
        let length = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | (data[2] as usize);
        let stream_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) & 0x7fff_ffff;
        Some(Self {
            length,
            kind: data[3],
            flags: data[4],
            stream_id,
        })
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.kind)
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Header plus payload length
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LENGTH + self.length
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push((self.length >> 16) as u8);
        out.push((self.length >> 8) as u8);
        out.push(self.length as u8);
        out.push(self.kind);
        out.push(self.flags);
        out.extend_from_slice(&(self.stream_id & 0x7fff_ffff).to_be_bytes());
    }
}

/// Serialize one complete frame
pub fn encode_frame(kind: FrameType, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LENGTH + payload.len());
    FrameHeader::new(kind, flags, stream_id, payload.len()).write(&mut out);
    out.extend_from_slice(payload);
    out
}

/// Strip the pad length, optional priority block and trailing padding from a
/// DATA or HEADERS payload.
pub fn strip_padding(header: &FrameHeader, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut start = 0;
    let mut padding = 0;
    if header.has_flag(flags::PADDED) {
        padding = *payload.first().ok_or(FrameError::Padding {
            padding: 1,
            remaining: 0,
        })? as usize;
        start = 1;
    }
    if header.kind == FrameType::Headers as u8 && header.has_flag(flags::PRIORITY) {
        // Stream dependency (4) + weight (1)
        start += 5;
    }
    let remaining = payload.len().saturating_sub(start);
    if start > payload.len() || padding > remaining {
        return Err(FrameError::Padding { padding, remaining });
    }
    Ok(payload[start..payload.len() - padding].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_from_u8() {
        assert_eq!(FrameType::from_u8(0x0), Some(FrameType::Data));
        assert_eq!(FrameType::from_u8(0x9), Some(FrameType::Continuation));
        assert_eq!(FrameType::from_u8(0xa), None);
    }

    /// Test: reserved bit is masked off the stream id
    #[test]
    fn test_parse_header_masks_reserved_bit() {
        let data = [0x00, 0x00, 0x05, 0x01, 0x05, 0x80, 0x00, 0x00, 0x03];
        let header = FrameHeader::parse(&data).unwrap();
        assert_eq!(header.length, 5);
        assert_eq!(header.frame_type(), Some(FrameType::Headers));
        assert!(header.has_flag(flags::END_STREAM));
        assert!(header.has_flag(flags::END_HEADERS));
        assert_eq!(header.stream_id, 3);
        assert_eq!(header.frame_len(), 14);
    }

    #[test]
    fn test_parse_header_short() {
        assert!(FrameHeader::parse(&[0x00; 8]).is_none());
    }

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame(FrameType::Data, flags::END_STREAM, 1, b"hi");
        assert_eq!(
            frame,
            vec![0x00, 0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, b'h', b'i']
        );
    }

    /// Test: padded HEADERS with priority
    #[test]
    fn test_strip_padding_with_priority() {
        let header = FrameHeader::new(
            FrameType::Headers,
            flags::PADDED | flags::PRIORITY | flags::END_HEADERS,
            1,
            10,
        );
        // pad=2, priority 5 bytes, block "ab", padding 2
        let payload = [2, 0, 0, 0, 0, 16, b'a', b'b', 0, 0];
        assert_eq!(strip_padding(&header, &payload).unwrap(), b"ab");
    }

    /// Test: padding longer than the payload is a protocol error
    #[test]
    fn test_strip_padding_too_large() {
        let header = FrameHeader::new(FrameType::Data, flags::PADDED, 1, 3);
        match strip_padding(&header, &[5, b'a', b'b']) {
            Err(FrameError::Padding { padding, remaining }) => {
                assert_eq!(padding, 5);
                assert_eq!(remaining, 2);
            }
            other => panic!("Expected Padding error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_code() {
        assert_eq!(ErrorCode::from_u32(0x8), Some(ErrorCode::Cancel));
        assert_eq!(ErrorCode::from_u32(0xff), None);
    }
}
