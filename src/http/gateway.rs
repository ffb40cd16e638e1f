//! HTTP gateway: the full sniff / TLS / HTTP2 / container pipeline

use super::container::ContainerInterceptor;
use super::exchange::HttpExchange;
use super::header_sniff::HeaderSniffInterceptor;
use super::multiplex::MultiplexInterceptor;
use super::session::HttpZygote;
use super::sniff::HttpSniffInterceptor;
use super::ssl_codec::{SslCodecInterceptor, SslPair, SslRefluxInterceptor};
use crate::gateway::{
    Indexed, Interceptor, InterceptorFactory, InterceptorGateway, SessionContext, Sinks,
    VirtualGateway, VirtualGatewayFactory,
};
use crate::http2::{
    HpackState, Http2DecodeInterceptor, Http2EncodeInterceptor, Http2SniffInterceptor,
};
use crate::mitm::{SslEngineFactory, SslWhiteList};
use crate::net::{Protocol, Session};
use std::sync::Arc;
use tracing::debug;

/// Factory of per-exchange application interceptors
pub type HttpInterceptorFactory = dyn InterceptorFactory<HttpExchange>;

/// Connection state shared by every stage of the HTTP pipeline
pub struct HttpContext {
    pub session: Arc<Session>,
    pub zygote: HttpZygote,
    /// Set once the connection is known to carry TLS
    pub ssl: Option<SslPair>,
    pub hpack: HpackState,
    pub whitelist: Arc<SslWhiteList>,
    /// `None` disables decryption; TLS connections then pass through
    pub engine: Option<Arc<SslEngineFactory>>,
}

impl HttpContext {
    pub fn new(
        session: Arc<Session>,
        whitelist: Arc<SslWhiteList>,
        engine: Option<Arc<SslEngineFactory>>,
    ) -> Self {
        Self {
            session,
            zygote: HttpZygote::new(),
            ssl: None,
            hpack: HpackState::new(),
            whitelist,
            engine,
        }
    }
}

/// Builds HTTP gateways for TCP connections, pass-through gateways otherwise
pub struct HttpVirtualGatewayFactory {
    engine: Option<Arc<SslEngineFactory>>,
    whitelist: Arc<SslWhiteList>,
    factories: Arc<Vec<Arc<HttpInterceptorFactory>>>,
}

impl HttpVirtualGatewayFactory {
    pub fn new(
        engine: Option<Arc<SslEngineFactory>>,
        whitelist: Arc<SslWhiteList>,
        factories: Vec<Arc<HttpInterceptorFactory>>,
    ) -> Self {
        Self {
            engine,
            whitelist,
            factories: Arc::new(factories),
        }
    }

    pub fn whitelist(&self) -> &Arc<SslWhiteList> {
        &self.whitelist
    }

    /// Connection-level stages in traversal order
    fn stages(&self) -> Vec<Box<dyn Interceptor<HttpContext>>> {
        vec![
            Box::new(Indexed::new(HttpSniffInterceptor::new())),
            Box::new(SslCodecInterceptor::new()),
            Box::new(Http2SniffInterceptor::new()),
            Box::new(Http2DecodeInterceptor::new()),
            Box::new(MultiplexInterceptor::new()),
            Box::new(HeaderSniffInterceptor::new()),
            Box::new(ContainerInterceptor::new(self.factories.clone())),
            Box::new(Http2EncodeInterceptor::new()),
            Box::new(SslRefluxInterceptor),
        ]
    }
}

impl HttpVirtualGatewayFactory {
    /// The full HTTP pipeline for one TCP connection
    pub fn http_gateway(
        &self,
        session: Arc<Session>,
        sinks: Sinks,
    ) -> InterceptorGateway<HttpContext> {
        let context = HttpContext::new(session, self.whitelist.clone(), self.engine.clone());
        InterceptorGateway::new(context, self.stages(), sinks)
    }
}

impl VirtualGatewayFactory for HttpVirtualGatewayFactory {
    fn create(&self, session: Arc<Session>, sinks: Sinks) -> Box<dyn VirtualGateway> {
        if session.protocol != Protocol::Tcp {
            debug!(session = %session.id, protocol = %session.protocol, "Pass-through gateway");
            return Box::new(InterceptorGateway::new(
                SessionContext { session },
                Vec::new(),
                sinks,
            ));
        }
        Box::new(self.http_gateway(session, sinks))
    }

    fn ssl_whitelist(&self) -> Option<Arc<SslWhiteList>> {
        Some(self.whitelist.clone())
    }
}
