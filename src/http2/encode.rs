//! Re-framing of the HTTP/1-style view back into HTTP/2

use super::frame::{encode_frame, flags, FrameType};
use super::INITIAL_MAX_FRAME_SIZE;
use crate::error::Result;
use crate::gateway::{Chain, Direction, Interceptor};
use crate::http::gateway::HttpContext;
use crate::http::session::{HttpId, HttpSession};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::trace;

/// Split a header block into HEADERS plus as many CONTINUATION frames as the
/// receiver's max frame size requires.
pub fn frame_header_block(stream_id: u32, block: &[u8], max: usize, end_stream: bool) -> Vec<u8> {
    let max = max.max(1);
    let mut out = Vec::with_capacity(block.len() + 9 * (block.len() / max + 1));
    let mut chunks = block.chunks(max).peekable();
    let end_flag = if end_stream { flags::END_STREAM } else { flags::NONE };

    let first = chunks.next().unwrap_or_default();
    let mut first_flags = end_flag;
    if chunks.peek().is_none() {
        first_flags |= flags::END_HEADERS;
    }
    out.extend(encode_frame(FrameType::Headers, first_flags, stream_id, first));

    while let Some(chunk) = chunks.next() {
        let flag = if chunks.peek().is_none() {
            flags::END_HEADERS
        } else {
            flags::NONE
        };
        out.extend(encode_frame(FrameType::Continuation, flag, stream_id, chunk));
    }
    out
}

/// Split a body buffer into DATA frames, END_STREAM on the last one only
pub fn frame_data(stream_id: u32, data: &[u8], max: usize, end_stream: bool) -> Vec<u8> {
    let max = max.max(1);
    let mut out = Vec::with_capacity(data.len() + 9 * (data.len() / max + 1));
    let mut chunks = data.chunks(max).peekable();
    while let Some(chunk) = chunks.next() {
        let flag = if end_stream && chunks.peek().is_none() {
            flags::END_STREAM
        } else {
            flags::NONE
        };
        out.extend(encode_frame(FrameType::Data, flag, stream_id, chunk));
    }
    out
}

/// Turns heads and bodies coming out of the exchange stages into frames.
///
/// The first buffer of a stream direction is a head; its HEADERS frame is
/// rebuilt from the exchange session so header edits made by application
/// interceptors reach the wire.
#[derive(Debug, Default)]
pub struct Http2EncodeInterceptor {
    counters: HashMap<(Direction, HttpId), usize>,
}

impl Http2EncodeInterceptor {
    pub fn new() -> Self {
        Self::default()
    }
}

fn encode_head(
    context: &mut HttpContext,
    direction: Direction,
    session: &HttpSession,
) -> Vec<u8> {
    let mut block = Vec::new();
    let writer = context.hpack.writer(direction);
    match direction {
        Direction::Request => {
            let authority = session.request_headers.first("host");
            let headers: Vec<(&str, &str)> = session
                .request_headers
                .iter()
                .filter(|(name, _)| !name.eq_ignore_ascii_case("host"))
                .collect();
            let scheme = if session.is_https { "https" } else { "http" };
            writer.write_request_headers(
                session.method.as_str(),
                session.path.as_deref().unwrap_or("/"),
                authority,
                scheme,
                &headers,
                &mut block,
            );
        }
        Direction::Response => {
            let headers = session.response_headers.pairs();
            writer.write_response_headers(session.code, &headers, &mut block);
        }
    }
    block
}

impl Interceptor<HttpContext> for Http2EncodeInterceptor {
    fn intercept(&mut self, chain: &mut Chain<'_, HttpContext>, buffer: Bytes) -> Result<()> {
        let direction = chain.direction();
        let context = chain.context();
        let root = context.zygote.root();
        if !root.protocol.is_http2() {
            return chain.process(buffer);
        }
        let max = root
            .receiver_settings(direction)
            .map_or(INITIAL_MAX_FRAME_SIZE, |s| {
                s.max_frame_size(INITIAL_MAX_FRAME_SIZE)
            }) as usize;

        let id = context.zygote.active(direction).clone();
        if !id.is_stream() {
            return chain.process(buffer);
        }
        let stream_id = id.stream_id as u32;
        let session = context.zygote.session(&id).cloned().unwrap_or_default();
        let end_stream = session.stream_end(direction);

        let key = (direction, id);
        if buffer.is_empty() {
            // The frame carrying END_STREAM was refluxed upstream
            if end_stream {
                self.counters.remove(&key);
            }
            return Ok(());
        }
        let index = *self.counters.entry(key.clone()).or_insert(0);
        let frames = if index == 0 {
            let block = encode_head(context, direction, &session);
            trace!(stream = stream_id, direction = %direction, len = block.len(), "Encoded HEADERS");
            frame_header_block(stream_id, &block, max, end_stream)
        } else {
            frame_data(stream_id, &buffer, max, end_stream)
        };

        if end_stream {
            self.counters.remove(&key);
        } else if let Some(counter) = self.counters.get_mut(&key) {
            *counter += 1;
        }
        chain.process(Bytes::from(frames))
    }

    fn on_finished(&mut self, direction: Direction, _context: &mut HttpContext) {
        self.counters.retain(|(d, _), _| *d != direction);
    }
}
