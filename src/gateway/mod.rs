//! Virtual gateways
//!
//! A gateway is the per-connection root. It owns the request sink (toward the
//! remote server) and the response sink (toward the virtual interface) and
//! feeds buffers through an interceptor chain.

pub mod chain;
pub mod indexed;
pub mod policy;

use crate::error::Result;
use crate::mitm::SslWhiteList;
use crate::net::Session;
use bytes::Bytes;
use std::sync::Arc;

pub use chain::{finish, Chain, Direction, Interceptor, Sinks};
pub use indexed::{Indexed, IndexedInterceptor, PendingBuffers};
pub use policy::{HostPolicy, Policy, PolicyGateway};

/// Per-connection event sink driven by a virtual tunnel
pub trait VirtualGateway: Send {
    /// Bytes from the virtual interface, bound for the remote server
    fn on_request(&mut self, buffer: Bytes) -> Result<()>;

    /// Bytes from the remote server, bound for the virtual interface
    fn on_response(&mut self, buffer: Bytes) -> Result<()>;

    fn on_request_finished(&mut self);

    fn on_response_finished(&mut self);
}

/// Creates one gateway per connection
pub trait VirtualGatewayFactory: Send + Sync {
    fn create(&self, session: Arc<Session>, sinks: Sinks) -> Box<dyn VirtualGateway>;

    /// Whitelist consulted by the gateways, shared with the tunnels so
    /// failed handshakes are bypassed next time
    fn ssl_whitelist(&self) -> Option<Arc<SslWhiteList>> {
        None
    }
}

/// Creates fresh interceptor state, once per connection or exchange
pub trait InterceptorFactory<C>: Send + Sync {
    fn create(&self) -> Box<dyn Interceptor<C>>;
}

/// Gateway running an ordered stage list over a context `C`
pub struct InterceptorGateway<C> {
    context: C,
    stages: Vec<Box<dyn Interceptor<C>>>,
    sinks: Sinks,
}

impl<C> InterceptorGateway<C> {
    pub fn new(context: C, stages: Vec<Box<dyn Interceptor<C>>>, sinks: Sinks) -> Self {
        Self {
            context,
            stages,
            sinks,
        }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    fn run(&mut self, direction: Direction, buffer: Bytes) -> Result<()> {
        Chain::new(direction, &mut self.context, &mut self.stages, &self.sinks).process(buffer)
    }
}

impl<C: Send> VirtualGateway for InterceptorGateway<C> {
    fn on_request(&mut self, buffer: Bytes) -> Result<()> {
        self.run(Direction::Request, buffer)
    }

    fn on_response(&mut self, buffer: Bytes) -> Result<()> {
        self.run(Direction::Response, buffer)
    }

    fn on_request_finished(&mut self) {
        finish(&mut self.stages, Direction::Request, &mut self.context);
    }

    fn on_response_finished(&mut self) {
        finish(&mut self.stages, Direction::Response, &mut self.context);
    }
}

/// Context of the default raw-byte gateway
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session: Arc<Session>,
}

/// Raw-byte gateway: user interceptors over the connection's plain buffers
#[derive(Default)]
pub struct DefaultVirtualGatewayFactory {
    factories: Vec<Arc<dyn InterceptorFactory<SessionContext>>>,
}

impl DefaultVirtualGatewayFactory {
    pub fn new(factories: Vec<Arc<dyn InterceptorFactory<SessionContext>>>) -> Self {
        Self { factories }
    }
}

impl VirtualGatewayFactory for DefaultVirtualGatewayFactory {
    fn create(&self, session: Arc<Session>, sinks: Sinks) -> Box<dyn VirtualGateway> {
        let stages = self.factories.iter().map(|f| f.create()).collect();
        Box::new(InterceptorGateway::new(
            SessionContext { session },
            stages,
            sinks,
        ))
    }
}
