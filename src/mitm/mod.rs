//! MITM (Man-in-the-Middle) TLS interception
//!
//! - Certificate Authority: per-host leaf certificates signed by the root CA
//! - Engine factory: cached rustls configs for both sides of a connection
//! - Codec: sans-IO handshake and record state machine
//! - SSL whitelist: peers that failed interception and are bypassed
//! - ClientHello sniffing for SNI and ALPN

pub mod bypass;
pub mod certificate_authority;
pub mod codec;
pub mod engine;
pub mod ssl_utils;

pub use bypass::{BypassEntry, BypassReason, SslWhiteList};
pub use certificate_authority::{CertificateAuthority, HostIdentifier, IssuedCertificate};
pub use codec::{CodecOutput, HandshakeState, SslCodec};
pub use engine::{
    roots_verifier, KeyManagerProvider, SslEngineFactory, TlsVersion, TrustManagerProvider,
    DEFAULT_CACHE_TTL,
};
pub use ssl_utils::{parse_client_hello, verify_packet, ClientHello, PacketStatus};
