//! WebSocket frames after a 101 upgrade
//!
//! Frames are parsed incrementally from whatever buffer boundaries the
//! tunnel delivers. Raw bytes are never altered; decoded messages are put on
//! the exchange for the application interceptors that follow.

use super::exchange::HttpExchange;
use crate::error::Result;
use crate::gateway::{Chain, Direction, Interceptor};
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

const FLAG_FIN: u8 = 0x80;
const FLAG_RSV: u8 = 0x70;
const MASK_OPCODE: u8 = 0x0f;
const OPCODE_FLAG_CONTROL: u8 = 0x08;
const FLAG_MASK: u8 = 0x80;
const MASK_LENGTH: u8 = 0x7f;

const PAYLOAD_SHORT: u8 = 126;
const PAYLOAD_LONG: u8 = 127;
/// Largest control frame payload
const PAYLOAD_BYTE_MAX: u64 = 125;

pub const OPCODE_CONTINUATION: u8 = 0x0;
pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xa;

/// Close frame without a status code
pub const CLOSE_NO_STATUS_CODE: u16 = 1005;

/// Frames larger than this are refused instead of buffered
pub const MAX_FRAME_LENGTH: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebSocketError {
    #[error("Control frames must be final")]
    FragmentedControl,

    #[error("Reserved flags are unsupported")]
    ReservedFlags,

    #[error("Server-sent frames must not be masked")]
    MaskedServerFrame,

    #[error("Client-sent frames must be masked")]
    UnmaskedClientFrame,

    #[error("Control frame payload {0} exceeds 125 bytes")]
    ControlTooLong(u64),

    #[error("Frame length {0} exceeds 16 MiB")]
    FrameTooLong(u64),

    #[error("Unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    #[error("Expected continuation opcode, got {0:#x}")]
    ExpectedContinuation(u8),

    #[error("Continuation without a message to continue")]
    UnexpectedContinuation,

    #[error("Malformed close payload length of 1")]
    CloseLength,

    #[error("Close code {0} is out of range or reserved")]
    CloseCode(u16),
}

/// A complete message or control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketMessage {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

/// Reject close codes outside [1000, 5000) and the reserved ranges
fn check_close_code(code: u16) -> std::result::Result<(), WebSocketError> {
    match code {
        1000..=1003 | 1007..=1011 | 3000..=4999 => Ok(()),
        _ => Err(WebSocketError::CloseCode(code)),
    }
}

fn toggle_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

#[derive(Debug)]
struct FrameHead {
    fin: bool,
    opcode: u8,
    mask: Option<[u8; 4]>,
    length: usize,
    header_length: usize,
}

/// Incremental frame reader for one direction.
///
/// `from_server` selects the masking rule: server frames must be unmasked,
/// client frames masked.
#[derive(Debug)]
pub struct WebSocketReader {
    from_server: bool,
    buffer: BytesMut,
    /// Opcode and segments of a fragmented data message
    message: Option<(u8, Vec<u8>)>,
}

impl WebSocketReader {
    pub fn new(from_server: bool) -> Self {
        Self {
            from_server,
            buffer: BytesMut::new(),
            message: None,
        }
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append `data` and decode every frame it completes
    pub fn read(
        &mut self,
        data: &[u8],
        out: &mut Vec<WebSocketMessage>,
    ) -> std::result::Result<(), WebSocketError> {
        self.buffer.extend_from_slice(data);
        while let Some(head) = self.parse_head()? {
            if self.buffer.len() < head.header_length + head.length {
                break;
            }
            self.buffer.advance(head.header_length);
            let mut payload = self.buffer.split_to(head.length).to_vec();
            if let Some(key) = head.mask {
                toggle_mask(&mut payload, key);
            }
            if head.opcode & OPCODE_FLAG_CONTROL != 0 {
                out.push(control_message(head.opcode, payload)?);
            } else if let Some(message) = self.data_frame(&head, payload)? {
                out.push(message);
            }
        }
        Ok(())
    }

    fn parse_head(&self) -> std::result::Result<Option<FrameHead>, WebSocketError> {
        let data = &self.buffer[..];
        if data.len() < 2 {
            return Ok(None);
        }
        let b0 = data[0];
        let b1 = data[1];
        let fin = b0 & FLAG_FIN != 0;
        let opcode = b0 & MASK_OPCODE;
        let control = opcode & OPCODE_FLAG_CONTROL != 0;
        if control && !fin {
            return Err(WebSocketError::FragmentedControl);
        }
        if b0 & FLAG_RSV != 0 {
            return Err(WebSocketError::ReservedFlags);
        }
        let masked = b1 & FLAG_MASK != 0;
        match (self.from_server, masked) {
            (true, true) => return Err(WebSocketError::MaskedServerFrame),
            (false, false) => return Err(WebSocketError::UnmaskedClientFrame),
            _ => {}
        }

        let mut header_length = 2;
        let length = match b1 & MASK_LENGTH {
            PAYLOAD_SHORT => {
                if data.len() < 4 {
                    return Ok(None);
                }
                header_length += 2;
                u16::from_be_bytes([data[2], data[3]]) as u64
            }
            PAYLOAD_LONG => {
                if data.len() < 10 {
                    return Ok(None);
                }
                header_length += 8;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[2..10]);
                u64::from_be_bytes(raw)
            }
            short => short as u64,
        };
        if control && length > PAYLOAD_BYTE_MAX {
            return Err(WebSocketError::ControlTooLong(length));
        }
        if length > MAX_FRAME_LENGTH {
            return Err(WebSocketError::FrameTooLong(length));
        }

        let mask = if masked {
            if data.len() < header_length + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&data[header_length..header_length + 4]);
            header_length += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some(FrameHead {
            fin,
            opcode,
            mask,
            length: length as usize,
            header_length,
        }))
    }

    fn data_frame(
        &mut self,
        head: &FrameHead,
        payload: Vec<u8>,
    ) -> std::result::Result<Option<WebSocketMessage>, WebSocketError> {
        let (opcode, segments) = match (head.opcode, self.message.take()) {
            (OPCODE_TEXT | OPCODE_BINARY, None) => (head.opcode, payload),
            (OPCODE_CONTINUATION, Some((opcode, mut segments))) => {
                segments.extend_from_slice(&payload);
                (opcode, segments)
            }
            (OPCODE_CONTINUATION, None) => return Err(WebSocketError::UnexpectedContinuation),
            (OPCODE_TEXT | OPCODE_BINARY, Some(_)) => {
                return Err(WebSocketError::ExpectedContinuation(head.opcode))
            }
            (other, _) => return Err(WebSocketError::UnknownOpcode(other)),
        };
        if !head.fin {
            self.message = Some((opcode, segments));
            return Ok(None);
        }
        Ok(Some(match opcode {
            OPCODE_TEXT => WebSocketMessage::Text(String::from_utf8_lossy(&segments).into_owned()),
            _ => WebSocketMessage::Binary(Bytes::from(segments)),
        }))
    }
}

fn control_message(
    opcode: u8,
    payload: Vec<u8>,
) -> std::result::Result<WebSocketMessage, WebSocketError> {
    match opcode {
        OPCODE_PING => Ok(WebSocketMessage::Ping(Bytes::from(payload))),
        OPCODE_PONG => Ok(WebSocketMessage::Pong(Bytes::from(payload))),
        OPCODE_CLOSE => match payload.len() {
            0 => Ok(WebSocketMessage::Close {
                code: CLOSE_NO_STATUS_CODE,
                reason: String::new(),
            }),
            1 => Err(WebSocketError::CloseLength),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                check_close_code(code)?;
                Ok(WebSocketMessage::Close {
                    code,
                    reason: String::from_utf8_lossy(&payload[2..]).into_owned(),
                })
            }
        },
        other => Err(WebSocketError::UnknownOpcode(other)),
    }
}

/// Exchange stage decoding WebSocket traffic once the response upgraded.
///
/// Messages decoded from each buffer are left in
/// [`HttpExchange::websocket_messages`] for the stages after this one. A
/// malformed stream is logged and passed through undecoded from then on.
#[derive(Debug, Default)]
pub struct WebSocketInterceptor {
    heads: [bool; 2],
    readers: [Option<WebSocketReader>; 2],
    failed: [bool; 2],
}

impl WebSocketInterceptor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interceptor<HttpExchange> for WebSocketInterceptor {
    fn intercept(&mut self, chain: &mut Chain<'_, HttpExchange>, buffer: Bytes) -> Result<()> {
        let direction = chain.direction();
        let slot = direction.index();
        let exchange = chain.context();
        exchange.websocket_messages.clear();

        if !self.heads[slot] {
            self.heads[slot] = true;
            return chain.process(buffer);
        }
        if self.failed[slot] || !exchange.session.is_websocket_upgrade() {
            return chain.process(buffer);
        }

        let reader = self.readers[slot].get_or_insert_with(|| {
            debug!(exchange = %exchange.id.id, direction = %direction, "Reading WebSocket frames");
            WebSocketReader::new(direction == Direction::Response)
        });
        let mut messages = Vec::new();
        if let Err(e) = reader.read(&buffer, &mut messages) {
            warn!(
                exchange = %exchange.id.id,
                direction = %direction,
                error = %e,
                "Malformed WebSocket stream, no longer decoding"
            );
            self.failed[slot] = true;
            self.readers[slot] = None;
        }
        exchange.websocket_messages = messages;
        chain.process(buffer)
    }

    fn on_finished(&mut self, direction: Direction, _context: &mut HttpExchange) {
        let slot = direction.index();
        self.heads[slot] = false;
        self.readers[slot] = None;
        self.failed[slot] = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build one frame, masking it with `key` when given
    fn frame(fin: bool, opcode: u8, payload: &[u8], key: Option<[u8; 4]>) -> Vec<u8> {
        let mut out = vec![if fin { FLAG_FIN | opcode } else { opcode }];
        let mask_bit = if key.is_some() { FLAG_MASK } else { 0 };
        match payload.len() {
            n if n < 126 => out.push(mask_bit | n as u8),
            n if n <= 0xffff => {
                out.push(mask_bit | PAYLOAD_SHORT);
                out.extend_from_slice(&(n as u16).to_be_bytes());
            }
            n => {
                out.push(mask_bit | PAYLOAD_LONG);
                out.extend_from_slice(&(n as u64).to_be_bytes());
            }
        }
        let mut body = payload.to_vec();
        if let Some(key) = key {
            out.extend_from_slice(&key);
            toggle_mask(&mut body, key);
        }
        out.extend(body);
        out
    }

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    /// Test: RFC 6455 5.7 single-frame unmasked text
    #[test]
    fn test_unmasked_text() {
        let mut reader = WebSocketReader::new(true);
        let mut out = Vec::new();
        reader
            .read(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f], &mut out)
            .unwrap();
        assert_eq!(out, vec![WebSocketMessage::Text("Hello".into())]);
    }

    /// Test: RFC 6455 5.7 masked text from a client
    #[test]
    fn test_masked_text() {
        let mut reader = WebSocketReader::new(false);
        let mut out = Vec::new();
        reader
            .read(
                &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58],
                &mut out,
            )
            .unwrap();
        assert_eq!(out, vec![WebSocketMessage::Text("Hello".into())]);
    }

    /// Test: fragments join, with a ping in between surfacing first
    #[test]
    fn test_fragmented_message_with_interleaved_ping() {
        let mut data = frame(false, OPCODE_TEXT, b"Hel", None);
        data.extend(frame(true, OPCODE_PING, b"p", None));
        data.extend(frame(true, OPCODE_CONTINUATION, b"lo", None));

        let mut reader = WebSocketReader::new(true);
        let mut out = Vec::new();
        reader.read(&data, &mut out).unwrap();
        assert_eq!(
            out,
            vec![
                WebSocketMessage::Ping(Bytes::from_static(b"p")),
                WebSocketMessage::Text("Hello".into()),
            ]
        );
    }

    /// Test: a frame split at every offset decodes exactly once
    #[test]
    fn test_split_at_every_offset() {
        let payload = vec![0xabu8; 300];
        let data = frame(true, OPCODE_BINARY, &payload, Some(KEY));
        for split in 1..data.len() {
            let mut reader = WebSocketReader::new(false);
            let mut out = Vec::new();
            reader.read(&data[..split], &mut out).unwrap();
            assert!(out.is_empty(), "split at {}", split);
            reader.read(&data[split..], &mut out).unwrap();
            assert_eq!(
                out,
                vec![WebSocketMessage::Binary(Bytes::from(payload.clone()))]
            );
            assert_eq!(reader.buffered(), 0);
        }
    }

    /// Test: 64-bit length form
    #[test]
    fn test_long_length() {
        let payload = vec![7u8; 70_000];
        let mut reader = WebSocketReader::new(true);
        let mut out = Vec::new();
        reader
            .read(&frame(true, OPCODE_BINARY, &payload, None), &mut out)
            .unwrap();
        assert_eq!(out, vec![WebSocketMessage::Binary(Bytes::from(payload))]);
    }

    /// Test: close frames carry a code and reason, or the no-status code
    #[test]
    fn test_close_frames() {
        let mut reader = WebSocketReader::new(true);
        let mut out = Vec::new();
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        reader
            .read(&frame(true, OPCODE_CLOSE, &payload, None), &mut out)
            .unwrap();
        reader
            .read(&frame(true, OPCODE_CLOSE, &[], None), &mut out)
            .unwrap();
        assert_eq!(
            out,
            vec![
                WebSocketMessage::Close {
                    code: 1000,
                    reason: "bye".into()
                },
                WebSocketMessage::Close {
                    code: CLOSE_NO_STATUS_CODE,
                    reason: String::new()
                },
            ]
        );
    }

    /// Test: protocol violations are rejected
    #[test]
    fn test_violations() {
        let read = |from_server: bool, data: Vec<u8>| {
            WebSocketReader::new(from_server).read(&data, &mut Vec::new())
        };
        assert_eq!(
            read(true, frame(true, OPCODE_TEXT, b"x", Some(KEY))),
            Err(WebSocketError::MaskedServerFrame)
        );
        assert_eq!(
            read(false, frame(true, OPCODE_TEXT, b"x", None)),
            Err(WebSocketError::UnmaskedClientFrame)
        );
        assert_eq!(
            read(true, frame(false, OPCODE_PING, b"x", None)),
            Err(WebSocketError::FragmentedControl)
        );
        assert_eq!(
            read(true, frame(true, OPCODE_PING, &[0u8; 126], None)),
            Err(WebSocketError::ControlTooLong(126))
        );
        assert_eq!(
            read(true, vec![0xc1, 0x00]),
            Err(WebSocketError::ReservedFlags)
        );
        assert_eq!(
            read(true, frame(true, 0x3, b"", None)),
            Err(WebSocketError::UnknownOpcode(0x3))
        );
        assert_eq!(
            read(true, frame(true, OPCODE_CONTINUATION, b"x", None)),
            Err(WebSocketError::UnexpectedContinuation)
        );
        assert_eq!(
            read(true, frame(true, OPCODE_CLOSE, &[0x03], None)),
            Err(WebSocketError::CloseLength)
        );
        assert_eq!(
            read(true, frame(true, OPCODE_CLOSE, &1005u16.to_be_bytes(), None)),
            Err(WebSocketError::CloseCode(1005))
        );
    }
}
