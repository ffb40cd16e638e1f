//! Per-flow UDP tunnel
//!
//! Client datagrams arrive from the UDP forwarder over a channel; replies are
//! wrapped back into IP datagrams with the packet codec and written to the
//! virtual interface. A flow with no traffic for `idle_timeout` is closed.

use super::{ChannelTunnel, SocketProtector, TunnelReceiver};
use crate::error::{NetBareError, Result};
use crate::gateway::{HostPolicy, PolicyGateway, Sinks, VirtualGateway, VirtualGatewayFactory};
use crate::logger::ConnectionLog;
use crate::net::packet::write_packet;
use crate::net::{InterfaceOutput, PacketCodec, Session};
use crate::tunnel::Tunnel;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_DATAGRAM: usize = 65535;

pub struct UdpVirtualTunnel {
    session: Arc<Session>,
    /// Client endpoint on the virtual interface
    local: SocketAddr,
    factory: Arc<dyn VirtualGatewayFactory>,
    hosts: Arc<HostPolicy>,
    codec: Arc<dyn PacketCodec>,
    output: InterfaceOutput,
    protector: Option<Arc<dyn SocketProtector>>,
    idle_timeout: Duration,
}

impl UdpVirtualTunnel {
    pub fn new(
        session: Arc<Session>,
        local: SocketAddr,
        factory: Arc<dyn VirtualGatewayFactory>,
        hosts: Arc<HostPolicy>,
        codec: Arc<dyn PacketCodec>,
        output: InterfaceOutput,
    ) -> Self {
        Self {
            session,
            local,
            factory,
            hosts,
            codec,
            output,
            protector: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_protector(mut self, protector: Option<Arc<dyn SocketProtector>>) -> Self {
        self.protector = protector;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.session.remote_ip, self.session.remote_port)
    }

    /// Run the flow until it idles out, the forwarder drops `requests`, or
    /// the service stops.
    pub async fn run(self, requests: mpsc::Receiver<Bytes>, shutdown: CancellationToken) {
        let log = ConnectionLog::new(&self.session);
        let span = log.span();
        async move {
            let (remote_tunnel, remote_rx) = ChannelTunnel::pair(None);
            let (proxy_tunnel, proxy_rx) = ChannelTunnel::pair(None);
            let sinks = Sinks::new(remote_tunnel.clone(), proxy_tunnel.clone());
            let inner = self.factory.create(self.session.clone(), sinks.clone());
            let mut gateway =
                PolicyGateway::new(self.session.clone(), sinks, self.hosts.clone(), inner);

            let result = match self.bind().await {
                Ok(socket) => {
                    self.pump(&mut gateway, socket, requests, remote_rx, proxy_rx, &shutdown)
                        .await
                }
                Err(e) => Err(e),
            };
            let error = result.err().map(|e| {
                warn!(error = %e, "UDP flow failed");
                e.to_string()
            });
            remote_tunnel.close();
            proxy_tunnel.close();
            gateway.on_request_finished();
            gateway.on_response_finished();
            log.closed(&self.session, error);
        }
        .instrument(span)
        .await
    }

    async fn bind(&self) -> Result<UdpSocket> {
        let any = match self.session.remote_ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(any, 0)).await?;
        if let Some(protector) = &self.protector {
            if !protector.protect_udp(&socket) {
                return Err(NetBareError::shutdown("failed to protect UDP socket"));
            }
        }
        socket.connect(self.remote()).await?;
        Ok(socket)
    }

    async fn pump(
        &self,
        gateway: &mut PolicyGateway,
        socket: UdpSocket,
        mut requests: mpsc::Receiver<Bytes>,
        mut remote_rx: TunnelReceiver,
        mut proxy_rx: TunnelReceiver,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.idle_timeout) => {
                    debug!(idle = ?self.idle_timeout, "UDP flow idle");
                    return Ok(());
                }
                request = requests.recv() => {
                    let Some(payload) = request else {
                        return Ok(());
                    };
                    self.session.touch();
                    self.session.add_send_data_size(payload.len());
                    gateway.on_request(payload)?;
                }
                read = socket.recv(&mut buf) => {
                    let n = read?;
                    self.session.touch();
                    self.session.add_receive_data_size(n);
                    gateway.on_response(Bytes::copy_from_slice(&buf[..n]))?;
                }
                Some(datagram) = remote_rx.recv() => {
                    socket.send(&datagram).await?;
                }
                Some(payload) = proxy_rx.recv() => {
                    let packet = self.codec.build_udp_datagram(self.remote(), self.local, &payload)?;
                    write_packet(&self.output, &packet)?;
                }
            }
        }
    }
}
