//! HTTP/2 frame decoding
//!
//! Frames are split out of the decrypted byte stream and either translated
//! into an HTTP/1-style head and body for the exchange stages, or refluxed
//! untouched. SETTINGS are tracked on the root session so both sides agree
//! on frame sizes and HPACK table sizes.

use super::encode::frame_header_block;
use super::frame::{encode_frame, flags, strip_padding, FrameError, FrameHeader, FrameType};
use super::hpack::{HeaderField, SETTINGS_HEADER_TABLE_SIZE_LIMIT};
use super::settings::{id, Http2Settings};
use super::{FRAME_HEADER_LENGTH, H2_PROTOCOL_TOKEN, INITIAL_MAX_FRAME_SIZE};
use crate::error::{NetBareError, Result};
use crate::gateway::{Chain, Direction, Interceptor, PendingBuffers};
use crate::http::gateway::HttpContext;
use crate::http::ssl_codec::reflux;
use bytes::Bytes;
use std::collections::HashSet;
use tracing::{debug, info, trace};

/// Header block waiting for its CONTINUATION frames
#[derive(Debug)]
struct PendingBlock {
    stream_id: u32,
    fragment: Vec<u8>,
    end_stream: bool,
}

#[derive(Debug, Default)]
pub struct Http2DecodeInterceptor {
    pending: PendingBuffers,
    blocks: [Option<PendingBlock>; 2],
    /// Streams whose first header block was already seen, per direction
    headers_seen: [HashSet<u32>; 2],
}

impl Http2DecodeInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_frame(
        &mut self,
        chain: &mut Chain<'_, HttpContext>,
        header: FrameHeader,
        frame: Bytes,
    ) -> Result<()> {
        let direction = chain.direction();
        let kind = header.frame_type();

        if let Some(block) = &self.blocks[direction.index()] {
            if kind != Some(FrameType::Continuation) {
                return Err(NetBareError::protocol(format!(
                    "frame type {:#x} while header block of stream {} is incomplete",
                    header.kind, block.stream_id
                )));
            }
        }

        let payload = frame.slice(FRAME_HEADER_LENGTH..);
        match kind {
            Some(FrameType::Data) => self.decode_data(chain, &header, &payload),
            Some(FrameType::Headers) => self.decode_headers(chain, &header, &payload),
            Some(FrameType::Continuation) => self.decode_continuation(chain, &header, &payload),
            Some(FrameType::Settings) => decode_settings(chain, &header, &payload, frame),
            Some(FrameType::GoAway) => decode_goaway(chain, &header, &payload, frame),
            _ => reflux(chain, frame),
        }
    }

    fn decode_data(
        &mut self,
        chain: &mut Chain<'_, HttpContext>,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<()> {
        if header.stream_id == 0 {
            return Err(FrameError::ZeroStreamId("DATA").into());
        }
        if header.has_flag(flags::COMPRESSED) {
            return Err(FrameError::Compressed.into());
        }
        let data = strip_padding(header, payload)?;
        let end_stream = header.has_flag(flags::END_STREAM);
        let direction = chain.direction();

        let zygote = &mut chain.context().zygote;
        let id = zygote.stream(header.stream_id);
        zygote.activate(direction, id.clone());
        if end_stream {
            if let Some(session) = zygote.session_mut(&id) {
                session.set_stream_end(direction);
            }
            self.headers_seen[direction.index()].remove(&header.stream_id);
        }

        if data.is_empty() {
            let flag = if end_stream { flags::END_STREAM } else { flags::NONE };
            let frame = encode_frame(FrameType::Data, flag, header.stream_id, &[]);
            reflux(chain, Bytes::from(frame))?;
            return end_of_stream(chain, end_stream);
        }
        chain.process(Bytes::from(data))
    }

    fn decode_headers(
        &mut self,
        chain: &mut Chain<'_, HttpContext>,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<()> {
        if header.stream_id == 0 {
            return Err(FrameError::ZeroStreamId("HEADERS").into());
        }
        let fragment = strip_padding(header, payload)?;
        let end_stream = header.has_flag(flags::END_STREAM);
        if header.has_flag(flags::END_HEADERS) {
            return self.header_block(chain, header.stream_id, &fragment, end_stream);
        }
        self.blocks[chain.direction().index()] = Some(PendingBlock {
            stream_id: header.stream_id,
            fragment,
            end_stream,
        });
        Ok(())
    }

    fn decode_continuation(
        &mut self,
        chain: &mut Chain<'_, HttpContext>,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<()> {
        let slot = chain.direction().index();
        let mut block = self.blocks[slot]
            .take()
            .ok_or(FrameError::UnexpectedContinuation)?;
        if block.stream_id != header.stream_id {
            return Err(FrameError::ContinuationStreamChanged {
                expected: block.stream_id,
                actual: header.stream_id,
            }
            .into());
        }
        block.fragment.extend_from_slice(payload);
        if header.has_flag(flags::END_HEADERS) {
            return self.header_block(chain, block.stream_id, &block.fragment, block.end_stream);
        }
        self.blocks[slot] = Some(block);
        Ok(())
    }

    /// Handle one complete header block
    fn header_block(
        &mut self,
        chain: &mut Chain<'_, HttpContext>,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
    ) -> Result<()> {
        let direction = chain.direction();
        let context = chain.context();
        let fields = context.hpack.reader(direction).read_headers(block)?;

        let id = context.zygote.stream(stream_id);
        context.zygote.activate(direction, id.clone());
        if end_stream {
            if let Some(session) = context.zygote.session_mut(&id) {
                session.set_stream_end(direction);
            }
        }

        let slot = direction.index();
        let informational = direction == Direction::Response && is_informational(&fields);
        if !informational && self.headers_seen[slot].insert(stream_id) {
            if end_stream {
                self.headers_seen[slot].remove(&stream_id);
            }
            let head = synthesize_head(direction, &fields);
            trace!(stream = stream_id, direction = %direction, "Decoded header block");
            return chain.process(Bytes::from(head));
        }
        if end_stream {
            self.headers_seen[slot].remove(&stream_id);
        }

        // Trailers and 1xx heads skip the exchange stages
        trace!(stream = stream_id, direction = %direction, informational, "Refluxing header block");
        let pairs: Vec<(&[u8], &[u8])> = fields
            .iter()
            .map(|f| (f.name.as_slice(), f.value.as_slice()))
            .collect();
        let mut encoded = Vec::new();
        context.hpack.writer(direction).write_headers(&pairs, &mut encoded);
        let max = receiver_max_frame_size(context, direction);
        let frames = frame_header_block(stream_id, &encoded, max, end_stream);
        reflux(chain, Bytes::from(frames))?;
        end_of_stream(chain, end_stream)
    }

    /// Streams with a head seen but not yet ended in `direction`
    pub fn open_streams(&self, direction: Direction) -> usize {
        self.headers_seen[direction.index()].len()
    }
}

/// Push an empty buffer down the chain so later stages see the stream end
/// of a frame that was refluxed instead of decoded
fn end_of_stream(chain: &mut Chain<'_, HttpContext>, end_stream: bool) -> Result<()> {
    if end_stream {
        chain.process(Bytes::new())
    } else {
        Ok(())
    }
}

/// `:status` 1xx, followed later by the real response head
fn is_informational(fields: &[HeaderField]) -> bool {
    fields
        .iter()
        .find(|f| f.name == b":status")
        .map_or(false, |f| f.value.len() == 3 && f.value[0] == b'1')
}

/// Max frame size the receiver of `direction` accepts
fn receiver_max_frame_size(context: &HttpContext, direction: Direction) -> usize {
    context
        .zygote
        .root()
        .receiver_settings(direction)
        .map_or(INITIAL_MAX_FRAME_SIZE, |s| s.max_frame_size(INITIAL_MAX_FRAME_SIZE)) as usize
}

/// Render decoded fields as an HTTP/1-style head
fn synthesize_head(direction: Direction, fields: &[HeaderField]) -> Vec<u8> {
    let pseudo = |name: &str| {
        fields
            .iter()
            .find(|f| f.name == name.as_bytes())
            .map(|f| String::from_utf8_lossy(&f.value).into_owned())
    };

    let mut head = String::new();
    let authority = match direction {
        Direction::Request => {
            let method = pseudo(":method").unwrap_or_default();
            let path = pseudo(":path").unwrap_or_else(|| "/".to_string());
            head.push_str(&format!("{} {} {}\r\n", method, path, H2_PROTOCOL_TOKEN));
            let authority = pseudo(":authority");
            if let Some(authority) = &authority {
                head.push_str(&format!("Host: {}\r\n", authority));
            }
            authority
        }
        Direction::Response => {
            let status = pseudo(":status").unwrap_or_default();
            head.push_str(&format!("{} {}\r\n", H2_PROTOCOL_TOKEN, status));
            None
        }
    };

    for field in fields {
        if field.name.first() == Some(&b':') {
            continue;
        }
        if authority.is_some() && field.name.eq_ignore_ascii_case(b"host") {
            continue;
        }
        head.push_str(&String::from_utf8_lossy(&field.name));
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(&field.value));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

fn decode_settings(
    chain: &mut Chain<'_, HttpContext>,
    header: &FrameHeader,
    payload: &[u8],
    frame: Bytes,
) -> Result<()> {
    if header.stream_id != 0 {
        return Err(FrameError::NonZeroStreamId("SETTINGS", header.stream_id).into());
    }
    if header.has_flag(flags::ACK) {
        if !payload.is_empty() {
            return Err(FrameError::SettingsAckWithPayload(payload.len()).into());
        }
        return reflux(chain, frame);
    }

    let direction = chain.direction();
    let mut settings = Http2Settings::parse(payload)?;
    let mut rewrite = direction == Direction::Request;
    if let Some(size) = settings.header_table_size() {
        if size as usize > SETTINGS_HEADER_TABLE_SIZE_LIMIT {
            settings.set(id::HEADER_TABLE_SIZE, SETTINGS_HEADER_TABLE_SIZE_LIMIT as u32);
            rewrite = true;
        }
    }
    let context = chain.context();
    match direction {
        Direction::Request => {
            // Server push cannot be mapped onto an exchange
            settings.set(id::ENABLE_PUSH, 0);
            context
                .zygote
                .root_mut()
                .client_settings
                .get_or_insert_with(Http2Settings::new)
                .merge(&settings);
        }
        Direction::Response => {
            context
                .zygote
                .root_mut()
                .peer_settings
                .get_or_insert_with(Http2Settings::new)
                .merge(&settings);
        }
    }
    // The sender's decoder limit binds frames flowing the other way
    if let Some(size) = settings.header_table_size() {
        let opposite = direction.opposite();
        context.hpack.reader(opposite).set_header_table_size(size as usize);
        context.hpack.writer(opposite).set_header_table_size(size as usize);
    }
    debug!(
        session = %context.session.id,
        direction = %direction,
        count = settings.len(),
        "SETTINGS"
    );

    if rewrite {
        let rewritten = encode_frame(FrameType::Settings, flags::NONE, 0, &settings.to_payload());
        reflux(chain, Bytes::from(rewritten))
    } else {
        reflux(chain, frame)
    }
}

fn decode_goaway(
    chain: &mut Chain<'_, HttpContext>,
    header: &FrameHeader,
    payload: &[u8],
    frame: Bytes,
) -> Result<()> {
    if header.stream_id != 0 {
        return Err(FrameError::NonZeroStreamId("GOAWAY", header.stream_id).into());
    }
    if payload.len() < 8 {
        return Err(FrameError::GoAwayLength(payload.len()).into());
    }
    let last_stream_id =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
    let error_code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let direction = chain.direction();
    info!(
        session = %chain.context().session.id,
        direction = %direction,
        last_stream_id,
        error_code,
        debug_data = %String::from_utf8_lossy(&payload[8..]),
        "GOAWAY"
    );
    reflux(chain, frame)
}

impl Interceptor<HttpContext> for Http2DecodeInterceptor {
    fn intercept(&mut self, chain: &mut Chain<'_, HttpContext>, buffer: Bytes) -> Result<()> {
        let direction = chain.direction();
        let context = chain.context();
        if !context.zygote.root().protocol.is_http2() {
            return chain.process(buffer);
        }
        // Frames arriving here were sized for the receiver's limit
        let max = receiver_max_frame_size(context, direction);

        let data = self.pending.merge(direction, buffer);
        let mut offset = 0;
        while let Some(header) = FrameHeader::parse(&data[offset..]) {
            if header.length > max {
                return Err(FrameError::FrameSize(header.length, max).into());
            }
            let end = offset + header.frame_len();
            if end > data.len() {
                break;
            }
            let frame = data.slice(offset..end);
            offset = end;
            self.decode_frame(chain, header, frame)?;
        }
        if offset < data.len() {
            self.pending.pend(direction, data.slice(offset..));
        }
        Ok(())
    }

    fn on_finished(&mut self, direction: Direction, _context: &mut HttpContext) {
        self.pending.clear(direction);
        self.blocks[direction.index()] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Sinks;
    use crate::http::protocol::HttpProtocol;
    use crate::http2::hpack::HpackWriter;
    use crate::mitm::SslWhiteList;
    use crate::net::{Protocol, Session};
    use crate::tunnel::MemoryTunnel;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    struct Fixture {
        decoder: Http2DecodeInterceptor,
        context: HttpContext,
        sinks: Sinks,
        response: Arc<MemoryTunnel>,
        server: HpackWriter,
    }

    impl Fixture {
        fn new() -> Self {
            let session = Arc::new(Session::new(
                Protocol::Tcp,
                50001,
                443,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            ));
            let mut context = HttpContext::new(session, Arc::new(SslWhiteList::new()), None);
            context.zygote.root_mut().protocol = HttpProtocol::Http2;
            let request = Arc::new(MemoryTunnel::new());
            let response = Arc::new(MemoryTunnel::new());
            Self {
                decoder: Http2DecodeInterceptor::new(),
                context,
                sinks: Sinks::new(request, response.clone()),
                response,
                server: HpackWriter::new(),
            }
        }

        fn feed(&mut self, direction: Direction, frame: Vec<u8>) {
            let mut rest: Vec<Box<dyn Interceptor<HttpContext>>> = Vec::new();
            let mut chain = Chain::new(direction, &mut self.context, &mut rest, &self.sinks);
            self.decoder.intercept(&mut chain, Bytes::from(frame)).unwrap();
        }

        fn request(&mut self, stream_id: u32) {
            let mut block = Vec::new();
            HpackWriter::new().write_headers(&[(":method", "GET"), (":path", "/")], &mut block);
            self.feed(
                Direction::Request,
                frame_header_block(stream_id, &block, 16384, true),
            );
        }

        fn server_headers(&mut self, stream_id: u32, headers: &[(&str, &str)], end_stream: bool) {
            let mut block = Vec::new();
            self.server.write_headers(headers, &mut block);
            self.feed(
                Direction::Response,
                frame_header_block(stream_id, &block, 16384, end_stream),
            );
        }
    }

    /// Test: stream ids are forgotten once each direction ends
    #[test]
    fn test_streams_forgotten_after_end() {
        let mut f = Fixture::new();
        for stream_id in [1, 3, 5] {
            f.request(stream_id);
        }
        assert_eq!(f.decoder.open_streams(Direction::Request), 0);

        f.server_headers(1, &[(":status", "200")], false);
        f.server_headers(3, &[(":status", "200")], false);
        f.server_headers(5, &[(":status", "204")], true);
        assert_eq!(f.decoder.open_streams(Direction::Response), 2);

        // Empty DATA and trailers both end a stream
        f.feed(
            Direction::Response,
            encode_frame(FrameType::Data, flags::END_STREAM, 1, &[]),
        );
        f.server_headers(3, &[("grpc-status", "0")], true);
        assert_eq!(f.decoder.open_streams(Direction::Response), 0);
    }

    /// Test: a 103 is refluxed and the 200 after it is still the head
    #[test]
    fn test_informational_head_is_not_the_response_head() {
        let mut f = Fixture::new();
        f.request(1);
        f.server_headers(1, &[(":status", "103"), ("link", "</a.css>")], false);
        assert_eq!(f.decoder.open_streams(Direction::Response), 0);
        f.server_headers(1, &[(":status", "200"), ("server", "test")], false);

        let written = f.response.written();
        assert_eq!(written.len(), 2);
        let header = FrameHeader::parse(&written[0]).unwrap();
        assert_eq!(header.frame_type(), Some(FrameType::Headers));
        assert!(!header.has_flag(flags::END_STREAM));
        assert_eq!(&written[1][..], b"h2 200\r\nserver: test\r\n\r\n");
        assert_eq!(f.decoder.open_streams(Direction::Response), 1);
    }

    /// Test: an oversized HEADER_TABLE_SIZE is clamped on the wire too
    #[test]
    fn test_settings_header_table_size_clamped() {
        let mut f = Fixture::new();
        let mut settings = Http2Settings::new();
        settings.set(id::HEADER_TABLE_SIZE, 65536);
        f.feed(
            Direction::Response,
            encode_frame(FrameType::Settings, flags::NONE, 0, &settings.to_payload()),
        );

        let written = f.response.written();
        let forwarded = Http2Settings::parse(&written[0][FRAME_HEADER_LENGTH..]).unwrap();
        assert_eq!(
            forwarded.header_table_size(),
            Some(SETTINGS_HEADER_TABLE_SIZE_LIMIT as u32)
        );
        assert_eq!(
            f.context.hpack.reader(Direction::Request).header_table_size(),
            SETTINGS_HEADER_TABLE_SIZE_LIMIT
        );
    }

    /// Test: pseudo-headers become the request line with Host first
    #[test]
    fn test_synthesize_request_head() {
        let fields = vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new(":scheme", "https"),
            HeaderField::new(":authority", "example.com"),
            HeaderField::new(":path", "/index.html"),
            HeaderField::new("host", "ignored.example"),
            HeaderField::new("accept", "*/*"),
        ];
        let head = synthesize_head(Direction::Request, &fields);
        assert_eq!(
            head,
            b"GET /index.html h2\r\nHost: example.com\r\naccept: */*\r\n\r\n".to_vec()
        );
    }

    /// Test: status line carries the code only
    #[test]
    fn test_synthesize_response_head() {
        let fields = vec![
            HeaderField::new(":status", "204"),
            HeaderField::new("server", "test"),
        ];
        let head = synthesize_head(Direction::Response, &fields);
        assert_eq!(head, b"h2 204\r\nserver: test\r\n\r\n".to_vec());
    }

    /// Test: only 1xx statuses are informational
    #[test]
    fn test_is_informational() {
        assert!(is_informational(&[HeaderField::new(":status", "100")]));
        assert!(is_informational(&[HeaderField::new(":status", "103")]));
        assert!(!is_informational(&[HeaderField::new(":status", "200")]));
        assert!(!is_informational(&[HeaderField::new("grpc-status", "0")]));
    }
}
