//! TLS MITM codec
//!
//! One `SslCodec` terminates one side of an intercepted connection: the
//! client-facing codec acts as a TLS server with a forged leaf certificate,
//! the server-facing codec acts as a TLS client toward the real peer. Both are
//! sans-IO: bytes go in through `decode`/`encode` and every produced buffer is
//! returned as a tagged `CodecOutput` for the caller to route.

use super::ssl_utils::{verify_packet, PacketStatus};
use crate::error::{NetBareError, Result};
use bytes::Bytes;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    Handshaking,
    Finished,
}

/// A buffer produced by the codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecOutput {
    /// Input that turned out not to be TLS, passed through untouched
    Plaintext(Bytes),
    /// Records to send to the peer of this codec
    Encrypted(Bytes),
    /// Application data recovered from the peer's records
    Decrypted(Bytes),
}

/// Handshake and record state machine for one side of a MITM connection
pub struct SslCodec {
    host: String,
    connection: Connection,
    state: HandshakeState,
    engine_closed: bool,
    /// Plaintext submitted before the handshake finished, in FIFO order
    queued: VecDeque<Bytes>,
}

impl std::fmt::Debug for SslCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SslCodec")
            .field("host", &self.host)
            .field("state", &self.state)
            .field("engine_closed", &self.engine_closed)
            .field("queued", &self.queued.len())
            .finish()
    }
}

impl SslCodec {
    /// Client-facing codec, presenting `config`'s certificate to the client
    pub fn server(host: impl Into<String>, config: Arc<ServerConfig>) -> Result<Self> {
        let connection = ServerConnection::new(config)?;
        Ok(Self::with_connection(host.into(), connection.into()))
    }

    /// Server-facing codec, connecting to `host` as a TLS client
    pub fn client(host: impl Into<String>, config: Arc<ClientConfig>) -> Result<Self> {
        let host = host.into();
        let name = ServerName::try_from(host.clone())
            .map_err(|e| NetBareError::handshake(&host, format!("invalid server name: {}", e)))?;
        let connection = ClientConnection::new(config, name)?;
        Ok(Self::with_connection(host, connection.into()))
    }

    fn with_connection(host: String, connection: Connection) -> Self {
        Self {
            host,
            connection,
            state: HandshakeState::NotStarted,
            engine_closed: false,
            queued: VecDeque::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_handshake_finished(&self) -> bool {
        self.state == HandshakeState::Finished
    }

    /// The engine still negotiates, as reported by the TLS library
    pub fn is_handshaking(&self) -> bool {
        self.connection.is_handshaking()
    }

    pub fn is_closed(&self) -> bool {
        self.engine_closed
    }

    /// Protocol selected by ALPN, once known
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.connection.alpn_protocol()
    }

    /// Plaintext buffers waiting for the handshake
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Start a client handshake, emitting the ClientHello.
    ///
    /// A no-op for server codecs, which wait for the peer's hello.
    pub fn prepare_handshake(&mut self, out: &mut Vec<CodecOutput>) -> Result<()> {
        if self.state != HandshakeState::NotStarted {
            return Ok(());
        }
        if let Connection::Client(_) = self.connection {
            self.state = HandshakeState::Handshaking;
            self.flush_records(out)?;
            debug!(host = %self.host, "Started client handshake");
        }
        Ok(())
    }

    /// Feed bytes received from this codec's peer
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<CodecOutput>) -> Result<()> {
        if self.engine_closed {
            trace!(host = %self.host, len = input.len(), "Engine closed, dropping input");
            return Ok(());
        }
        if input.is_empty() {
            return Ok(());
        }
        if self.state == HandshakeState::NotStarted {
            if verify_packet(input) == PacketStatus::NotEncrypted {
                out.push(CodecOutput::Plaintext(Bytes::copy_from_slice(input)));
                return Ok(());
            }
            self.state = HandshakeState::Handshaking;
        }

        let mut remaining = input;
        while !remaining.is_empty() {
            let read = self.connection.read_tls(&mut remaining)?;
            if let Err(e) = self.connection.process_new_packets() {
                // Send the alert before giving up
                let _ = self.flush_records(out);
                self.engine_closed = true;
                return Err(self.failure(e));
            }
            self.drain_plaintext(out)?;
            self.flush_records(out)?;
            if read == 0 {
                break;
            }
        }

        if self.state == HandshakeState::Handshaking && !self.connection.is_handshaking() {
            self.state = HandshakeState::Finished;
            debug!(
                host = %self.host,
                alpn = ?self.alpn_protocol().map(String::from_utf8_lossy),
                queued = self.queued.len(),
                "Handshake finished"
            );
            while let Some(plain) = self.queued.pop_front() {
                self.wrap(&plain, out)?;
            }
            self.drain_plaintext(out)?;
        }
        Ok(())
    }

    /// Encrypt application data for this codec's peer.
    ///
    /// Before the handshake finishes the buffer is queued and flushed, in
    /// submission order, when it does.
    pub fn encode(&mut self, plain: &[u8], out: &mut Vec<CodecOutput>) -> Result<()> {
        if plain.is_empty() {
            return Ok(());
        }
        if self.engine_closed {
            warn!(host = %self.host, len = plain.len(), "Engine closed, dropping plaintext");
            return Ok(());
        }
        if self.state != HandshakeState::Finished {
            self.queued.push_back(Bytes::copy_from_slice(plain));
            return Ok(());
        }
        self.wrap(plain, out)
    }

    /// Send close_notify and stop accepting data
    pub fn close(&mut self, out: &mut Vec<CodecOutput>) -> Result<()> {
        if self.engine_closed {
            return Ok(());
        }
        self.connection.send_close_notify();
        self.engine_closed = true;
        self.flush_records(out)
    }

    fn wrap(&mut self, plain: &[u8], out: &mut Vec<CodecOutput>) -> Result<()> {
        self.connection.writer().write_all(plain)?;
        self.flush_records(out)
    }

    fn flush_records(&mut self, out: &mut Vec<CodecOutput>) -> Result<()> {
        let mut records = Vec::new();
        while self.connection.wants_write() {
            self.connection.write_tls(&mut records)?;
        }
        if !records.is_empty() {
            out.push(CodecOutput::Encrypted(Bytes::from(records)));
        }
        Ok(())
    }

    fn drain_plaintext(&mut self, out: &mut Vec<CodecOutput>) -> Result<()> {
        let mut plain = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.connection.reader().read(&mut chunk) {
                Ok(0) => {
                    debug!(host = %self.host, "Peer sent close_notify");
                    self.engine_closed = true;
                    break;
                }
                Ok(n) => plain.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        if !plain.is_empty() {
            out.push(CodecOutput::Decrypted(Bytes::from(plain)));
        }
        Ok(())
    }

    fn failure(&self, error: rustls::Error) -> NetBareError {
        if self.state == HandshakeState::Finished {
            NetBareError::Tls(error)
        } else {
            NetBareError::handshake(&self.host, error.to_string())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::RootCertStore;

    /// Self-signed server and trusting client configs for `host`
    pub(crate) fn test_configs(
        host: &str,
        alpn: &[&[u8]],
    ) -> (Arc<ServerConfig>, Arc<ClientConfig>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec![host.to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let der: CertificateDer<'static> = cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut server = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![der.clone()], key)
            .unwrap();
        server.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

        let mut roots = RootCertStore::empty();
        roots.add(der).unwrap();
        let mut client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        client.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        (Arc::new(server), Arc::new(client))
    }

    fn encrypted(out: &mut Vec<CodecOutput>) -> Vec<Bytes> {
        out.drain(..)
            .filter_map(|o| match o {
                CodecOutput::Encrypted(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    fn decrypted(out: &[CodecOutput]) -> Vec<u8> {
        out.iter()
            .filter_map(|o| match o {
                CodecOutput::Decrypted(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Pump records between the two codecs until neither has output
    fn pump(client: &mut SslCodec, server: &mut SslCodec, seed: Vec<Bytes>) -> (Vec<u8>, Vec<u8>) {
        let mut to_server = seed;
        let mut to_client = Vec::new();
        let mut server_plain = Vec::new();
        let mut client_plain = Vec::new();
        for _ in 0..16 {
            if to_server.is_empty() && to_client.is_empty() {
                break;
            }
            let mut out = Vec::new();
            for record in to_server.drain(..) {
                server.decode(&record, &mut out).unwrap();
            }
            server_plain.extend(decrypted(&out));
            to_client.extend(encrypted(&mut out));

            let mut out = Vec::new();
            for record in to_client.drain(..) {
                client.decode(&record, &mut out).unwrap();
            }
            client_plain.extend(decrypted(&out));
            to_server.extend(encrypted(&mut out));
        }
        (server_plain, client_plain)
    }

    /// Test: plaintext queued before the handshake arrives in submission order
    #[test]
    fn test_queued_plaintext_is_flushed_in_order() {
        let (server_config, client_config) = test_configs("example.com", &[b"h2", b"http/1.1"]);
        let mut client = SslCodec::client("example.com", client_config).unwrap();
        let mut server = SslCodec::server("example.com", server_config).unwrap();

        let mut out = Vec::new();
        client.encode(b"first,", &mut out).unwrap();
        client.encode(b"second,", &mut out).unwrap();
        client.encode(b"third", &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(client.queued(), 3);

        client.prepare_handshake(&mut out).unwrap();
        let hello = encrypted(&mut out);
        assert_eq!(hello.len(), 1);

        let (server_plain, _) = pump(&mut client, &mut server, hello);
        assert!(client.is_handshake_finished());
        assert!(server.is_handshake_finished());
        assert_eq!(client.queued(), 0);
        assert_eq!(server_plain, b"first,second,third");
        assert_eq!(client.alpn_protocol(), Some(&b"h2"[..]));
        assert_eq!(server.alpn_protocol(), Some(&b"h2"[..]));
    }

    /// Test: non-TLS input before the handshake passes through
    #[test]
    fn test_plaintext_passthrough() {
        let (server_config, _) = test_configs("example.com", &[]);
        let mut server = SslCodec::server("example.com", server_config).unwrap();
        let mut out = Vec::new();
        server
            .decode(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", &mut out)
            .unwrap();
        assert!(matches!(&out[..], [CodecOutput::Plaintext(_)]));
        assert_eq!(server.state(), HandshakeState::NotStarted);
    }

    /// Test: a record split across two decode calls still completes the handshake
    #[test]
    fn test_split_records() {
        let (server_config, client_config) = test_configs("example.com", &[]);
        let mut client = SslCodec::client("example.com", client_config).unwrap();
        let mut server = SslCodec::server("example.com", server_config).unwrap();

        let mut out = Vec::new();
        client.prepare_handshake(&mut out).unwrap();
        let hello = encrypted(&mut out).concat();
        let (head, tail) = hello.split_at(3);

        let mut out = Vec::new();
        server.decode(head, &mut out).unwrap();
        assert!(out.is_empty());
        let seed = vec![Bytes::copy_from_slice(tail)];
        let (_, _) = pump(&mut client, &mut server, seed);
        assert!(client.is_handshake_finished());

        let mut out = Vec::new();
        server.encode(b"hello client", &mut out).unwrap();
        let records = encrypted(&mut out);
        let mut out = Vec::new();
        for record in records {
            client.decode(&record, &mut out).unwrap();
        }
        assert_eq!(decrypted(&out), b"hello client");
    }

    /// Test: an untrusted certificate fails as a handshake error
    #[test]
    fn test_untrusted_certificate() {
        let (server_config, _) = test_configs("example.com", &[]);
        let (_, other_client) = test_configs("example.com", &[]);
        let mut client = SslCodec::client("example.com", other_client).unwrap();
        let mut server = SslCodec::server("example.com", server_config).unwrap();

        let mut out = Vec::new();
        client.prepare_handshake(&mut out).unwrap();
        let mut to_server = encrypted(&mut out);
        let mut failure = None;
        for _ in 0..8 {
            let mut out = Vec::new();
            for record in to_server.drain(..) {
                server.decode(&record, &mut out).unwrap();
            }
            let mut back = Vec::new();
            for record in encrypted(&mut out) {
                if let Err(e) = client.decode(&record, &mut back) {
                    failure = Some(e);
                }
            }
            if failure.is_some() {
                break;
            }
            to_server = encrypted(&mut back);
        }
        let failure = failure.expect("handshake should fail");
        assert!(matches!(failure, NetBareError::Handshake { .. }));
        assert!(client.is_closed());
    }
}
