//! HTTP/1.1 keep-alive demultiplexing

use super::gateway::HttpContext;
use super::protocol::HttpProtocol;
use super::session::HttpId;
use crate::error::Result;
use crate::gateway::{Chain, Direction, Interceptor};
use bytes::Bytes;
use tracing::debug;

/// Starts a new exchange when a request follows a response on the same
/// HTTP/1.1 connection.
///
/// A 101 upgrade to WebSocket stops demultiplexing for good: everything after
/// it belongs to the upgraded exchange.
#[derive(Debug, Default)]
pub struct MultiplexInterceptor {
    response_count: usize,
    websocket: bool,
}

impl MultiplexInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_websocket(&self) -> bool {
        self.websocket
    }
}

impl Interceptor<HttpContext> for MultiplexInterceptor {
    fn intercept(&mut self, chain: &mut Chain<'_, HttpContext>, buffer: Bytes) -> Result<()> {
        let direction = chain.direction();
        let context = chain.context();
        let active = context.zygote.active(direction);
        let protocol = context
            .zygote
            .session(active)
            .map_or(context.zygote.root().protocol, |s| s.protocol);
        if protocol != HttpProtocol::Http11 || self.websocket || buffer.is_empty() {
            return chain.process(buffer);
        }

        match direction {
            Direction::Response => self.response_count += 1,
            Direction::Request if self.response_count > 0 => {
                let current = context.zygote.active(Direction::Request).clone();
                let upgraded = context
                    .zygote
                    .session(&current)
                    .map_or(false, |s| s.is_websocket_upgrade());
                if upgraded {
                    debug!(session = %context.session.id, "WebSocket upgrade, demultiplexing off");
                    self.websocket = true;
                    if let Some(session) = context.zygote.session_mut(&current) {
                        session.websocket = true;
                    }
                } else {
                    let id = HttpId::new(-1);
                    debug!(
                        session = %context.session.id,
                        previous = %current.id,
                        next = %id.id,
                        "Keep-alive request, new exchange"
                    );
                    context.zygote.zygote(&id);
                    context.zygote.activate(Direction::Request, id.clone());
                    context.zygote.activate(Direction::Response, id);
                    self.response_count = 0;
                }
            }
            Direction::Request => {}
        }
        chain.process(buffer)
    }

    fn on_finished(&mut self, direction: Direction, _context: &mut HttpContext) {
        if direction == Direction::Response {
            self.response_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Sinks;
    use crate::mitm::SslWhiteList;
    use crate::net::{Protocol, Session};
    use crate::tunnel::MemoryTunnel;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    /// Request, response, request on one connection speaking `protocol`
    fn exchanges_after_second_request(protocol: HttpProtocol) -> usize {
        let session = Arc::new(Session::new(
            Protocol::Tcp,
            50003,
            80,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        ));
        let mut context = HttpContext::new(session, Arc::new(SslWhiteList::new()), None);
        context.zygote.root_mut().protocol = protocol;
        let tunnel = Arc::new(MemoryTunnel::new());
        let sinks = Sinks::new(tunnel.clone(), tunnel);
        let mut multiplex = MultiplexInterceptor::new();
        let mut rest: Vec<Box<dyn Interceptor<HttpContext>>> = Vec::new();

        for (direction, data) in [
            (Direction::Request, &b"GET /a HTTP/1.x\r\n\r\n"[..]),
            (Direction::Response, &b"HTTP/1.x 200 OK\r\n\r\n"[..]),
            (Direction::Request, &b"GET /b HTTP/1.x\r\n\r\n"[..]),
        ] {
            let mut chain = Chain::new(direction, &mut context, &mut rest, &sinks);
            multiplex
                .intercept(&mut chain, Bytes::from_static(data))
                .unwrap();
        }
        context.zygote.len()
    }

    #[test]
    fn test_keep_alive_split_only_for_http11() {
        assert_eq!(exchanges_after_second_request(HttpProtocol::Http11), 1);
        assert_eq!(exchanges_after_second_request(HttpProtocol::Http10), 0);
        assert_eq!(exchanges_after_second_request(HttpProtocol::Unknown), 0);
    }
}
