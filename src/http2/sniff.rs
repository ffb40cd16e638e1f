//! HTTP/2 connection preface handling

use super::CONNECTION_PREFACE;
use crate::error::Result;
use crate::gateway::{Chain, Direction, Interceptor, PendingBuffers};
use crate::http::gateway::HttpContext;
use crate::http::protocol::HttpProtocol;
use crate::http::ssl_codec::reflux;
use bytes::Bytes;
use tracing::debug;

/// Strips the client preface ahead of frame decoding.
///
/// On a connection that negotiated h2 the preface is refluxed as-is and the
/// frames after it continue down the chain. A preface on any other connection
/// is HTTP/2 with prior knowledge, which is passed through untouched.
#[derive(Debug, Default)]
pub struct Http2SniffInterceptor {
    pending: PendingBuffers,
    checked: bool,
    passthrough: bool,
}

impl Http2SniffInterceptor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interceptor<HttpContext> for Http2SniffInterceptor {
    fn intercept(&mut self, chain: &mut Chain<'_, HttpContext>, buffer: Bytes) -> Result<()> {
        if self.passthrough {
            return reflux(chain, buffer);
        }
        if self.checked || chain.direction() == Direction::Response {
            return chain.process(buffer);
        }

        let data = self.pending.merge(Direction::Request, buffer);
        if data.len() < CONNECTION_PREFACE.len() && CONNECTION_PREFACE.starts_with(&data) {
            self.pending.pend(Direction::Request, data);
            return Ok(());
        }
        self.checked = true;

        if !data.starts_with(CONNECTION_PREFACE) {
            return chain.process(data);
        }

        let context = chain.context();
        if context.zygote.root().protocol.is_http2() {
            reflux(chain, data.slice(..CONNECTION_PREFACE.len()))?;
            let rest = data.slice(CONNECTION_PREFACE.len()..);
            if rest.is_empty() {
                return Ok(());
            }
            return chain.process(rest);
        }

        debug!(session = %context.session.id, "HTTP/2 with prior knowledge, passing through");
        context.zygote.root_mut().protocol = HttpProtocol::H2PriorKnowledge;
        self.passthrough = true;
        reflux(chain, data)
    }
}
