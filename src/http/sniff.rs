//! First-buffer classification of a TCP connection

use super::gateway::HttpContext;
use super::protocol::is_method_letter;
use crate::error::Result;
use crate::gateway::{Chain, Direction, IndexedInterceptor};
use crate::mitm::ssl_utils::is_tls_content_type;
use bytes::Bytes;
use tracing::debug;

/// Decides from the first request byte whether the connection is HTTP,
/// HTTPS, or something to leave alone.
///
/// Whitelisted peers, connections without a known host and anything that is
/// neither a method letter nor a TLS record type skip every later stage.
#[derive(Debug, Default)]
pub struct HttpSniffInterceptor {
    valid: Option<bool>,
}

impl HttpSniffInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> Option<bool> {
        self.valid
    }

    fn sniff(&mut self, context: &mut HttpContext, buffer: &[u8]) {
        let session = &context.session;
        let ip = session.remote_ip.to_string();
        let host = session.host();

        if context.whitelist.contains(&ip)
            || host.as_deref().map_or(false, |h| context.whitelist.contains(h))
        {
            debug!(session = %session.id, ip = %ip, "Whitelisted peer, not intercepting");
            self.valid = Some(false);
            return;
        }
        if host.is_none() {
            debug!(session = %session.id, ip = %ip, "No host, not intercepting");
            self.valid = Some(false);
            return;
        }

        match buffer.first() {
            Some(&byte) if is_method_letter(byte) => {
                self.valid = Some(true);
                context.zygote.root_mut().is_https = false;
            }
            Some(&byte) if is_tls_content_type(byte) => {
                self.valid = Some(true);
                context.zygote.root_mut().is_https = true;
            }
            _ => {
                debug!(session = %session.id, "Neither HTTP nor TLS, not intercepting");
                self.valid = Some(false);
            }
        }
    }
}

impl IndexedInterceptor<HttpContext> for HttpSniffInterceptor {
    fn intercept_indexed(
        &mut self,
        chain: &mut Chain<'_, HttpContext>,
        buffer: Bytes,
        index: usize,
    ) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        if self.valid.is_none() {
            match chain.direction() {
                Direction::Request if index == 0 => self.sniff(chain.context(), &buffer),
                // Server spoke first
                _ => self.valid = Some(false),
            }
        }
        match self.valid {
            Some(true) => chain.process(buffer),
            _ => chain.process_final(buffer),
        }
    }
}
