//! NetBare - packet capture and interception over a virtual network interface
//!
//! Raw IP datagrams read from a virtual interface are dispatched to per-protocol
//! forwarders. TCP connections are NATed to a local proxy server, paired with a
//! protected socket to the real server, and every byte in both directions runs
//! through a per-connection gateway.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use netbare::{Config, HttpVirtualGatewayFactory, SslWhiteList};
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::from_env()?;
//! let factory = HttpVirtualGatewayFactory::new(None, Arc::new(SslWhiteList::new()), Vec::new());
//! # let _ = (config, factory);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - `service` - lifecycle and the virtual interface reader
//! - `proxy` - TCP/UDP/ICMP forwarders
//! - `tunnel` - per-connection socket pumps
//! - `gateway` - policy resolution and the interceptor chain
//! - `mitm` - certificate authority and sans-IO TLS codec
//! - `http` / `http2` - exchange demultiplexing and the HTTP/2 wire codec

// Packet plumbing
pub mod net;
pub mod proxy;
pub mod service;
pub mod tunnel;

// Interception
pub mod gateway;
pub mod http;
pub mod http2;
pub mod mitm;

// Ambient
pub mod config;
pub mod error;
pub mod logger;

pub use config::{Config, ConfigBuilder};
pub use error::{ErrorKind, NetBareError, Result};
pub use logger::{init_tracing, ConnectionLog, ConnectionSummary};

pub use gateway::{
    Chain, DefaultVirtualGatewayFactory, Direction, HostPolicy, Indexed, IndexedInterceptor,
    Interceptor, InterceptorFactory, Policy, PolicyGateway, SessionContext, Sinks,
    VirtualGateway, VirtualGatewayFactory,
};
pub use http::{
    HttpExchange, HttpId, HttpInterceptorFactory, HttpMethod, HttpProtocol, HttpSession,
    HttpVirtualGatewayFactory,
};
pub use http2::{Http2Settings, HpackState};
pub use mitm::{
    BypassReason, CertificateAuthority, KeyManagerProvider, SslCodec, SslEngineFactory,
    SslWhiteList, TrustManagerProvider,
};
pub use net::{IpPacket, PacketCodec, Protocol, Session, SessionProvider, UidProvider};
pub use service::{NetBareListener, NetBareService};
pub use tunnel::{SocketProtector, Tunnel};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
