//! TLS termination stages
//!
//! The request codec faces the intercepted client (we are its server), the
//! response codec faces the real server (we are its client). The handshake
//! with the server runs first: the client's ClientHello is held back until
//! the server has picked an ALPN protocol, and only then is the client-facing
//! engine created offering exactly that protocol.

use super::gateway::HttpContext;
use super::protocol::HttpProtocol;
use crate::error::{NetBareError, Result};
use crate::gateway::{Chain, Direction, Interceptor, PendingBuffers};
use crate::mitm::codec::{CodecOutput, SslCodec};
use crate::mitm::ssl_utils::{parse_client_hello, verify_packet, PacketStatus};
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

/// ALPN protocols we know how to intercept
const SUPPORTED_ALPN: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Both engines of one intercepted connection
#[derive(Debug)]
pub struct SslPair {
    host: String,
    /// Client-facing engine, created once the server chose ALPN
    request: Option<SslCodec>,
    /// Server-facing engine
    response: Option<SslCodec>,
    client_alpn: Vec<Vec<u8>>,
    /// ClientHello and anything after it, held until `request` exists
    pending_hello: BytesMut,
    /// Decrypted client data produced while handling a response buffer
    ready_request: Vec<Bytes>,
    bypass: bool,
}

impl SslPair {
    fn new(host: String, client_alpn: Vec<Vec<u8>>) -> Self {
        Self {
            host,
            request: None,
            response: None,
            client_alpn,
            pending_hello: BytesMut::new(),
            ready_request: Vec::new(),
            bypass: false,
        }
    }

    fn bypassed(host: String) -> Self {
        Self {
            bypass: true,
            ..Self::new(host, Vec::new())
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// ALPN protocols offered by the client
    pub fn client_alpn(&self) -> &[Vec<u8>] {
        &self.client_alpn
    }

    /// Protocol the server selected
    pub fn selected_alpn(&self) -> Option<&[u8]> {
        self.response.as_ref()?.alpn_protocol()
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    /// Both engines exist
    pub fn is_established(&self) -> bool {
        self.request.is_some() && self.response.is_some()
    }

    /// Encrypt plaintext travelling in `direction` for the side it goes to
    pub fn encode(&mut self, direction: Direction, plain: &[u8]) -> Result<Vec<Bytes>> {
        let codec = match direction {
            Direction::Request => self.response.as_mut(),
            Direction::Response => self.request.as_mut(),
        };
        let codec = codec.ok_or_else(|| {
            NetBareError::handshake(&self.host, format!("No {} engine yet", direction))
        })?;
        let mut out = Vec::new();
        codec.encode(plain, &mut out)?;
        Ok(encrypted(out))
    }
}

fn encrypted(outputs: Vec<CodecOutput>) -> Vec<Bytes> {
    outputs
        .into_iter()
        .filter_map(|o| match o {
            CodecOutput::Encrypted(b) => Some(b),
            _ => None,
        })
        .collect()
}

/// Send a buffer on to its sink, re-encrypting it when the connection is
/// intercepted TLS
pub fn reflux(chain: &mut Chain<'_, HttpContext>, buffer: Bytes) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let direction = chain.direction();
    let intercepted = chain.context().ssl.as_ref().map_or(false, |ssl| !ssl.bypass);
    if !intercepted {
        return chain.write_sink(direction, buffer);
    }
    let records = match chain.context().ssl.as_mut() {
        Some(ssl) => ssl.encode(direction, &buffer)?,
        None => Vec::new(),
    };
    for record in records {
        chain.write_sink(direction, record)?;
    }
    Ok(())
}

/// Decrypts both directions of an HTTPS connection
#[derive(Debug, Default)]
pub struct SslCodecInterceptor {
    pending: PendingBuffers,
}

impl SslCodecInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    fn intercept_request(
        &mut self,
        chain: &mut Chain<'_, HttpContext>,
        buffer: Bytes,
    ) -> Result<()> {
        let state = chain
            .context()
            .ssl
            .as_ref()
            .map(|ssl| (ssl.bypass, ssl.request.is_some()));
        match state {
            None => self.start(chain, buffer),
            Some((true, _)) => chain.process_final(buffer),
            Some((false, false)) => {
                if let Some(ssl) = chain.context().ssl.as_mut() {
                    ssl.pending_hello.extend_from_slice(&buffer);
                }
                Ok(())
            }
            Some((false, true)) => {
                let ready = match chain.context().ssl.as_mut() {
                    Some(ssl) => std::mem::take(&mut ssl.ready_request),
                    None => Vec::new(),
                };
                for plain in ready {
                    chain.process(plain)?;
                }

                let mut out = Vec::new();
                if let Some(codec) = chain.context().ssl.as_mut().and_then(|s| s.request.as_mut())
                {
                    codec.decode(&buffer, &mut out)?;
                }
                for output in out {
                    match output {
                        CodecOutput::Encrypted(records) => {
                            chain.write_sink(Direction::Response, records)?
                        }
                        CodecOutput::Decrypted(plain) => chain.process(plain)?,
                        CodecOutput::Plaintext(plain) => chain.process_final(plain)?,
                    }
                }
                Ok(())
            }
        }
    }

    /// First client bytes of an HTTPS connection
    fn start(&mut self, chain: &mut Chain<'_, HttpContext>, buffer: Bytes) -> Result<()> {
        let data = self.pending.merge(Direction::Request, buffer);
        match verify_packet(&data) {
            PacketStatus::NotEnough => {
                self.pending.pend(Direction::Request, data);
                return Ok(());
            }
            PacketStatus::NotEncrypted => return chain.process(data),
            PacketStatus::Ssl(_) => {}
        }

        let hello = parse_client_hello(&data)
            .ok_or_else(|| NetBareError::protocol("First TLS record is not a ClientHello"))?;
        let context = chain.context();
        let host = hello
            .server_name
            .clone()
            .or_else(|| context.session.host())
            .unwrap_or_else(|| context.session.remote_ip.to_string());
        let alpn: Vec<Vec<u8>> = hello
            .alpn
            .into_iter()
            .filter(|p| SUPPORTED_ALPN.contains(&p.as_slice()))
            .collect();

        let engine = match context.engine.clone() {
            Some(engine) => engine,
            None => {
                context.ssl = Some(SslPair::bypassed(host));
                return chain.process_final(data);
            }
        };
        let mut response = match engine.create_client_engine(&host, &alpn) {
            Ok(codec) => codec,
            Err(e) => {
                warn!(host = %host, error = %e, "Cannot create server-facing engine, bypassing");
                context.ssl = Some(SslPair::bypassed(host));
                return chain.process_final(data);
            }
        };

        let mut out = Vec::new();
        response.prepare_handshake(&mut out)?;
        debug!(
            session = %context.session.id,
            host = %host,
            alpn = ?alpn.iter().map(|p| String::from_utf8_lossy(p)).collect::<Vec<_>>(),
            "Intercepting TLS connection"
        );

        let mut ssl = SslPair::new(host, alpn);
        ssl.response = Some(response);
        ssl.pending_hello.extend_from_slice(&data);
        context.ssl = Some(ssl);

        for records in encrypted(out) {
            chain.write_sink(Direction::Request, records)?;
        }
        Ok(())
    }

    fn intercept_response(
        &mut self,
        chain: &mut Chain<'_, HttpContext>,
        buffer: Bytes,
    ) -> Result<()> {
        let state = {
            let context = chain.context();
            (
                context.ssl.as_ref().map(|ssl| ssl.bypass),
                context.zygote.root().is_https,
            )
        };
        match state {
            (Some(false), _) => {}
            (Some(true), _) | (None, true) => return chain.process_final(buffer),
            (None, false) => return chain.process(buffer),
        }

        let mut out = Vec::new();
        if let Some(codec) = chain.context().ssl.as_mut().and_then(|s| s.response.as_mut()) {
            codec.decode(&buffer, &mut out)?;
        }

        let mut decrypted = Vec::new();
        for output in out {
            match output {
                CodecOutput::Encrypted(records) => {
                    chain.write_sink(Direction::Request, records)?
                }
                CodecOutput::Decrypted(plain) => decrypted.push(plain),
                CodecOutput::Plaintext(plain) => chain.process_final(plain)?,
            }
        }

        self.attach_client_engine(chain)?;

        // Client data that arrived with the held ClientHello
        let ready = match chain.context().ssl.as_mut() {
            Some(ssl) => std::mem::take(&mut ssl.ready_request),
            None => Vec::new(),
        };
        if !ready.is_empty() {
            let mut request = chain.toward(Direction::Request);
            for plain in ready {
                request.process(plain)?;
            }
        }

        for plain in decrypted {
            chain.process(plain)?;
        }
        Ok(())
    }

    /// Create the client-facing engine once the server's ALPN choice is known
    /// and replay the held ClientHello into it
    fn attach_client_engine(&mut self, chain: &mut Chain<'_, HttpContext>) -> Result<()> {
        let context = chain.context();
        let engine = match context.engine.clone() {
            Some(engine) => engine,
            None => return Ok(()),
        };
        let ssl = match context.ssl.as_mut() {
            Some(ssl) if ssl.request.is_none() => ssl,
            _ => return Ok(()),
        };
        let resolved = match ssl.response.as_ref() {
            Some(codec) => codec.alpn_protocol().is_some() || !codec.is_handshaking(),
            None => false,
        };
        if !resolved {
            return Ok(());
        }

        let selected = ssl.selected_alpn().map(<[u8]>::to_vec);
        if let Some(protocol) = selected.as_deref().and_then(HttpProtocol::from_alpn) {
            context.zygote.root_mut().protocol = protocol;
        }
        debug!(
            host = %ssl.host,
            alpn = ?selected.as_deref().map(String::from_utf8_lossy),
            "Server selected ALPN"
        );

        let alpn: Vec<Vec<u8>> = selected.into_iter().collect();
        let mut request = engine.create_server_engine(&ssl.host, &alpn)?;
        let hello = std::mem::take(&mut ssl.pending_hello).freeze();
        let mut out = Vec::new();
        request.decode(&hello, &mut out)?;
        ssl.request = Some(request);

        for output in out {
            match output {
                CodecOutput::Encrypted(records) => {
                    chain.write_sink(Direction::Response, records)?
                }
                CodecOutput::Decrypted(plain) => {
                    if let Some(ssl) = chain.context().ssl.as_mut() {
                        ssl.ready_request.push(plain);
                    }
                }
                CodecOutput::Plaintext(_) => {}
            }
        }
        Ok(())
    }
}

impl Interceptor<HttpContext> for SslCodecInterceptor {
    fn intercept(&mut self, chain: &mut Chain<'_, HttpContext>, buffer: Bytes) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        match chain.direction() {
            Direction::Request if !chain.context().zygote.root().is_https => {
                chain.process(buffer)
            }
            Direction::Request => self.intercept_request(chain, buffer),
            Direction::Response => self.intercept_response(chain, buffer),
        }
    }

    fn on_finished(&mut self, direction: Direction, _context: &mut HttpContext) {
        self.pending.clear(direction);
    }
}

/// Last stage: encrypt what reached the end of the chain and write it out
#[derive(Debug, Default)]
pub struct SslRefluxInterceptor;

impl Interceptor<HttpContext> for SslRefluxInterceptor {
    fn intercept(&mut self, chain: &mut Chain<'_, HttpContext>, buffer: Bytes) -> Result<()> {
        reflux(chain, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Sinks;
    use crate::mitm::{CertificateAuthority, SslEngineFactory, SslWhiteList};
    use crate::net::{Protocol, Session};
    use crate::tunnel::MemoryTunnel;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_client_data_decrypted_during_response_is_flushed() {
        let authority =
            CertificateAuthority::generate("NetBare Test CA", 4, Duration::from_secs(600))
                .unwrap();
        let engine = SslEngineFactory::new(Arc::new(authority), 4, Duration::from_secs(600));
        let session = Arc::new(Session::new(
            Protocol::Tcp,
            50002,
            443,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        ));
        let mut context = HttpContext::new(session, Arc::new(SslWhiteList::new()), None);
        context.zygote.root_mut().is_https = true;

        let mut ssl = SslPair::new("example.com".to_string(), Vec::new());
        let mut upstream = engine.create_client_engine("example.com", &[]).unwrap();
        upstream.prepare_handshake(&mut Vec::new()).unwrap();
        ssl.response = Some(upstream);
        ssl.request = Some(engine.create_server_engine("example.com", &[]).unwrap());
        ssl.ready_request
            .push(Bytes::from_static(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"));
        context.ssl = Some(ssl);

        let request = Arc::new(MemoryTunnel::new());
        let response = Arc::new(MemoryTunnel::new());
        let sinks = Sinks::new(request.clone(), response.clone());
        let mut stages: Vec<Box<dyn Interceptor<HttpContext>>> =
            vec![Box::new(SslCodecInterceptor::new())];

        // Part of a server record, nothing decrypts yet
        Chain::new(Direction::Response, &mut context, &mut stages, &sinks)
            .process(Bytes::from_static(&[0x16, 0x03, 0x03]))
            .unwrap();

        assert_eq!(
            request.concat(),
            b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec()
        );
        assert!(response.written().is_empty());
        assert!(context.ssl.as_ref().unwrap().ready_request.is_empty());
    }
}
