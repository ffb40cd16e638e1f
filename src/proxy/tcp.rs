//! TCP forwarding through a local proxy server
//!
//! Client packets are NATed to a listener on the virtual address: the source
//! becomes `remote_ip:local_port` and the destination `local_ip:proxy_port`.
//! The listener recovers the session from the peer port, and its replies are
//! rewritten back to `remote_ip:remote_port -> local_ip:local_port`.

use super::{Forwarder, ForwarderContext};
use crate::error::{NetBareError, Result};
use crate::net::packet::write_packet;
use crate::net::{IpPacket, Protocol};
use crate::tunnel::TcpVirtualTunnel;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct TcpProxyForwarder {
    context: ForwarderContext,
    proxy_port: Option<u16>,
    shutdown: CancellationToken,
}

impl TcpProxyForwarder {
    pub fn new(context: ForwarderContext) -> Self {
        let shutdown = context.shutdown.child_token();
        Self {
            context,
            proxy_port: None,
            shutdown,
        }
    }

    /// Port of the local proxy server once prepared
    pub fn proxy_port(&self) -> Option<u16> {
        self.proxy_port
    }

    fn bind(&self) -> Result<TcpListener> {
        let listener = std::net::TcpListener::bind(SocketAddr::new(self.context.local_ip, 0))?;
        listener.set_nonblocking(true)?;
        let _guard = self.context.runtime.enter();
        Ok(TcpListener::from_std(listener)?)
    }
}

async fn accept_loop(listener: TcpListener, context: ForwarderContext, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Proxy server accept failed");
                continue;
            }
        };
        let session = match context.sessions.query(peer.port()) {
            Some(session) => session,
            None => {
                warn!(error = %NetBareError::SessionNotFound(peer.port()), "Dropping connection");
                continue;
            }
        };
        let tunnel = TcpVirtualTunnel::new(
            session,
            context.factory.clone(),
            context.hosts.clone(),
            context.whitelist.clone(),
        )
        .with_protector(context.protector.clone())
        .with_max_pending(context.max_pending)
        .with_connect_timeout(context.connect_timeout)
        .with_read_buffer(context.mtu);
        tokio::spawn(tunnel.run(stream, shutdown.child_token()));
    }
    debug!("Proxy server stopped");
}

impl Forwarder for TcpProxyForwarder {
    fn prepare(&mut self) -> Result<()> {
        if self.proxy_port.is_some() {
            return Ok(());
        }
        let listener = self.bind()?;
        let port = listener.local_addr()?.port();
        self.proxy_port = Some(port);
        self.context.runtime.spawn(accept_loop(
            listener,
            self.context.clone(),
            self.shutdown.clone(),
        ));
        info!(local_ip = %self.context.local_ip, port, "TCP proxy server started");
        Ok(())
    }

    fn forward(&mut self, packet: &mut [u8], ip: &IpPacket) -> Result<()> {
        let proxy_port = self
            .proxy_port
            .ok_or_else(|| NetBareError::shutdown("TCP forwarder not prepared"))?;

        if ip.source.port() == proxy_port {
            // Proxy server -> client
            let local_port = ip.destination.port();
            let session = match self.context.sessions.query(local_port) {
                Some(session) => session,
                None => {
                    debug!(local_port, "No session for proxy reply, dropping");
                    return Ok(());
                }
            };
            self.context.codec.rewrite(
                packet,
                SocketAddr::new(session.remote_ip, session.remote_port),
                SocketAddr::new(ip.source.ip(), local_port),
            )?;
        } else {
            // Client -> proxy server
            let local_port = ip.source.port();
            let session = self.context.sessions.ensure_query(
                Protocol::Tcp,
                local_port,
                ip.destination.port(),
                ip.destination.ip(),
            );
            session.touch();
            session.next_packet_index();
            self.context.codec.rewrite(
                packet,
                SocketAddr::new(ip.destination.ip(), local_port),
                SocketAddr::new(ip.source.ip(), proxy_port),
            )?;
        }
        write_packet(&self.context.output, packet)?;
        Ok(())
    }

    fn release(&mut self) {
        self.shutdown.cancel();
        if self.proxy_port.take().is_some() {
            info!("TCP proxy server released");
        }
    }
}
