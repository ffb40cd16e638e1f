//! Plaintext check before the HTTP/1 stages

use super::gateway::HttpContext;
use super::protocol::{HttpMethod, HttpProtocol};
use super::ssl_codec::reflux;
use crate::error::Result;
use crate::gateway::{Chain, Direction, Interceptor};
use bytes::Bytes;
use tracing::debug;

/// Refluxes connections whose first decrypted bytes are not HTTP
#[derive(Debug, Default)]
pub struct HeaderSniffInterceptor {
    verdict: [Option<bool>; 2],
}

impl HeaderSniffInterceptor {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Does `data` start like an HTTP head travelling in `direction`
fn looks_like_head(direction: Direction, data: &[u8]) -> bool {
    match direction {
        Direction::Request => HttpMethod::starts_request(data),
        Direction::Response => {
            data.starts_with(b"HTTP/1.")
                || data.starts_with(HttpProtocol::Http2.as_str().as_bytes())
        }
    }
}

impl Interceptor<HttpContext> for HeaderSniffInterceptor {
    fn intercept(&mut self, chain: &mut Chain<'_, HttpContext>, buffer: Bytes) -> Result<()> {
        if buffer.is_empty() {
            return chain.process(buffer);
        }
        let direction = chain.direction();
        let context = chain.context();
        let active = context.zygote.active(direction).clone();
        let protocol = context
            .zygote
            .session(&active)
            .map_or(context.zygote.root().protocol, |s| s.protocol);
        if protocol.is_http2() {
            return chain.process(buffer);
        }

        let slot = direction.index();
        if self.verdict[slot].is_none() && protocol == HttpProtocol::Unknown {
            let valid = looks_like_head(direction, &buffer);
            if !valid {
                debug!(
                    session = %context.session.id,
                    direction = %direction,
                    "Not HTTP, refluxing"
                );
                // A non-HTTP request means the whole connection is opaque
                if direction == Direction::Request {
                    self.verdict[Direction::Response.index()] = Some(false);
                }
            }
            self.verdict[slot] = Some(valid);
        }

        match self.verdict[slot] {
            Some(false) => reflux(chain, buffer),
            _ => chain.process(buffer),
        }
    }
}
