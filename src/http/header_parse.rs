//! Request line, status line and header parsing

use super::exchange::HttpExchange;
use super::protocol::{HttpMethod, HttpProtocol};
use super::session::HttpSession;
use crate::error::Result;
use crate::gateway::{Chain, Direction, IndexedInterceptor};
use bytes::Bytes;
use tracing::warn;

/// Parses the head (index 0) of each direction into the exchange's session
#[derive(Debug, Default)]
pub struct HeaderParseInterceptor;

impl IndexedInterceptor<HttpExchange> for HeaderParseInterceptor {
    fn intercept_indexed(
        &mut self,
        chain: &mut Chain<'_, HttpExchange>,
        buffer: Bytes,
        index: usize,
    ) -> Result<()> {
        if index == 0 && !buffer.is_empty() {
            let direction = chain.direction();
            let session = &mut chain.context().session;
            match direction {
                Direction::Request => parse_request_head(session, &buffer),
                Direction::Response => parse_response_head(session, &buffer),
            }
        }
        chain.process(buffer)
    }
}

/// Fill method, path, protocol and request headers from a request head
pub fn parse_request_head(session: &mut HttpSession, head: &[u8]) {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let first = lines.next().unwrap_or_default();
    let tokens: Vec<&str> = first.split(' ').filter(|t| !t.is_empty()).collect();
    if tokens.len() < 3 {
        warn!(line = %first, "Malformed request line");
        return;
    }
    session.method = HttpMethod::parse(tokens[0]);
    session.path = Some(tokens[1].to_string());
    set_protocol(session, tokens[2]);
    parse_headers(lines, Direction::Request, session);
    session.req_body_offset = head.len();
}

/// Fill status, message, protocol and response headers from a status head
pub fn parse_response_head(session: &mut HttpSession, head: &[u8]) {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let first = lines.next().unwrap_or_default();
    let mut tokens = first.splitn(3, ' ');
    let (protocol, code) = match (tokens.next(), tokens.next()) {
        (Some(protocol), Some(code)) => (protocol, code),
        _ => {
            warn!(line = %first, "Malformed status line");
            return;
        }
    };
    let code = match code.trim().parse::<u16>() {
        Ok(code) => code,
        Err(_) => {
            warn!(line = %first, "Malformed status code");
            return;
        }
    };
    set_protocol(session, protocol);
    session.code = code;
    session.message = tokens
        .next()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string);
    parse_headers(lines, Direction::Response, session);
    session.res_body_offset = head.len();
}

fn set_protocol(session: &mut HttpSession, token: &str) {
    let protocol = HttpProtocol::parse(token);
    if protocol != HttpProtocol::Unknown {
        session.protocol = protocol;
    }
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
    direction: Direction,
    session: &mut HttpSession,
) {
    let headers = session.headers_mut(direction);
    for line in lines {
        if line.is_empty() {
            break;
        }
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                headers.add(name.trim(), value.trim());
            }
            _ => warn!(line = %line, "Skipping malformed header line"),
        }
    }
}
