//! Per-protocol packet forwarders
//!
//! The interface reader classifies each datagram with the packet codec and
//! hands it to the forwarder registered for its IP protocol.

pub mod icmp;
pub mod tcp;
pub mod udp;

use crate::error::Result;
use crate::gateway::{HostPolicy, VirtualGatewayFactory};
use crate::mitm::SslWhiteList;
use crate::net::{InterfaceOutput, IpPacket, PacketCodec, SessionProvider};
use crate::tunnel::SocketProtector;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

pub use icmp::IcmpProxyForwarder;
pub use tcp::TcpProxyForwarder;
pub use udp::UdpProxyForwarder;

/// Lifecycle of one protocol's forwarding
pub trait Forwarder: Send {
    /// Acquire sockets and start background tasks
    fn prepare(&mut self) -> Result<()>;

    /// Handle one datagram read from the virtual interface
    fn forward(&mut self, packet: &mut [u8], ip: &IpPacket) -> Result<()>;

    /// Stop background tasks and close every tunnel. Idempotent.
    fn release(&mut self);
}

/// Everything a forwarder shares with the service
#[derive(Clone)]
pub struct ForwarderContext {
    pub runtime: Handle,
    pub shutdown: CancellationToken,
    pub local_ip: IpAddr,
    pub mtu: usize,
    pub codec: Arc<dyn PacketCodec>,
    pub output: InterfaceOutput,
    pub sessions: Arc<SessionProvider>,
    pub factory: Arc<dyn VirtualGatewayFactory>,
    pub hosts: Arc<HostPolicy>,
    pub whitelist: Arc<SslWhiteList>,
    pub protector: Option<Arc<dyn SocketProtector>>,
    pub max_pending: Option<usize>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}
