//! HTTP/2 wire codec
//!
//! - `frame` / `settings` - frame header layout and the SETTINGS table
//! - `huffman` / `hpack` - RFC 7541 header compression
//! - `sniff`, `decode`, `encode` - interceptor stages that translate frames to
//!   and from the HTTP/1-style view seen by application interceptors

pub mod decode;
pub mod encode;
pub mod frame;
pub mod hpack;
pub mod huffman;
pub mod settings;
pub mod sniff;

use crate::gateway::Direction;
use hpack::{HpackReader, HpackWriter};

pub use decode::Http2DecodeInterceptor;
pub use encode::Http2EncodeInterceptor;
pub use frame::{ErrorCode, FrameError, FrameHeader, FrameType};
pub use hpack::{HeaderField, HpackError};
pub use settings::Http2Settings;
pub use sniff::Http2SniffInterceptor;

/// Size of the fixed frame header
pub const FRAME_HEADER_LENGTH: usize = 9;

/// SETTINGS_MAX_FRAME_SIZE before any SETTINGS frame is seen
pub const INITIAL_MAX_FRAME_SIZE: u32 = 0x4000;

/// Client connection preface (RFC 9113 Section 3.4)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Protocol token used in synthesized request and status lines
pub const H2_PROTOCOL_TOKEN: &str = "h2";

/// Per-connection HPACK state, one reader and one writer per direction.
///
/// Readers mirror the tables of the peer that produced the frames; writers
/// own the tables of the peer that receives the re-encoded frames.
#[derive(Debug, Default)]
pub struct HpackState {
    readers: [HpackReader; 2],
    writers: [HpackWriter; 2],
}

impl HpackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reader(&mut self, direction: Direction) -> &mut HpackReader {
        &mut self.readers[direction.index()]
    }

    pub fn writer(&mut self, direction: Direction) -> &mut HpackWriter {
        &mut self.writers[direction.index()]
    }
}
