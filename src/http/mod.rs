//! HTTP interception pipeline
//!
//! Connection stages, in order:
//!
//! 1. `sniff` - HTTP, HTTPS or leave alone
//! 2. `ssl_codec` - TLS termination toward both peers
//! 3. HTTP/2 preface sniffing and frame decoding (see `crate::http2`)
//! 4. `multiplex` - keep-alive exchanges
//! 5. `header_sniff` - reflux anything that is not HTTP
//! 6. `container` - per-exchange stages, WebSocket decoding after an
//!    upgrade, then application interceptors
//! 7. HTTP/2 frame encoding, then re-encryption

pub mod container;
pub mod exchange;
pub mod gateway;
pub mod header_parse;
pub mod header_separate;
pub mod header_sniff;
pub mod multiplex;
pub mod protocol;
pub mod session;
pub mod sniff;
pub mod ssl_codec;
pub mod websocket;

pub use container::ContainerInterceptor;
pub use exchange::HttpExchange;
pub use gateway::{HttpContext, HttpInterceptorFactory, HttpVirtualGatewayFactory};
pub use header_parse::HeaderParseInterceptor;
pub use header_separate::HeaderSeparateInterceptor;
pub use header_sniff::HeaderSniffInterceptor;
pub use multiplex::MultiplexInterceptor;
pub use protocol::{HttpMethod, HttpProtocol};
pub use session::{HeaderMap, HttpId, HttpSession, HttpZygote};
pub use sniff::HttpSniffInterceptor;
pub use ssl_codec::{reflux, SslCodecInterceptor, SslPair, SslRefluxInterceptor};
pub use websocket::{WebSocketInterceptor, WebSocketMessage, WebSocketReader};
