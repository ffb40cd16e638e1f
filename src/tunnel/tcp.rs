//! Per-connection TCP tunnel
//!
//! Pairs the accepted proxy-side stream with a freshly connected remote
//! stream and drives the connection's gateway from a single task. All
//! interceptor and codec work for the connection runs on that task.

use super::{ChannelTunnel, SocketProtector, TunnelReceiver};
use crate::error::{ErrorKind, NetBareError, Result};
use crate::gateway::{HostPolicy, PolicyGateway, Sinks, VirtualGateway, VirtualGatewayFactory};
use crate::logger::ConnectionLog;
use crate::mitm::{BypassReason, SslWhiteList};
use crate::net::Session;
use crate::tunnel::Tunnel;
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_READ_BUFFER: usize = 16384;

pub struct TcpVirtualTunnel {
    session: Arc<Session>,
    factory: Arc<dyn VirtualGatewayFactory>,
    hosts: Arc<HostPolicy>,
    whitelist: Arc<SslWhiteList>,
    protector: Option<Arc<dyn SocketProtector>>,
    max_pending: Option<usize>,
    connect_timeout: Duration,
    read_buffer: usize,
}

impl TcpVirtualTunnel {
    pub fn new(
        session: Arc<Session>,
        factory: Arc<dyn VirtualGatewayFactory>,
        hosts: Arc<HostPolicy>,
        whitelist: Arc<SslWhiteList>,
    ) -> Self {
        Self {
            session,
            factory,
            hosts,
            whitelist,
            protector: None,
            max_pending: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_buffer: DEFAULT_READ_BUFFER,
        }
    }

    pub fn with_protector(mut self, protector: Option<Arc<dyn SocketProtector>>) -> Self {
        self.protector = protector;
        self
    }

    pub fn with_max_pending(mut self, max_pending: Option<usize>) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Read size per socket read, at least one MTU
    pub fn with_read_buffer(mut self, size: usize) -> Self {
        self.read_buffer = size.max(1);
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Run the connection to completion.
    ///
    /// Errors never escape: they are classified, logged, and close only this
    /// connection. Both finish callbacks of the gateway fire exactly once.
    pub async fn run(self, proxy: TcpStream, shutdown: CancellationToken) {
        let log = ConnectionLog::new(&self.session);
        let span = log.span();
        async move {
            let (remote_tunnel, remote_rx) = ChannelTunnel::pair(self.max_pending);
            let (proxy_tunnel, proxy_rx) = ChannelTunnel::pair(self.max_pending);
            let sinks = Sinks::new(remote_tunnel.clone(), proxy_tunnel.clone());
            let inner = self.factory.create(self.session.clone(), sinks.clone());
            let mut gateway =
                PolicyGateway::new(self.session.clone(), sinks, self.hosts.clone(), inner);

            let result = match self.connect().await {
                Ok(remote) => {
                    debug!("Connected to remote");
                    self.pump(&mut gateway, proxy, remote, remote_rx, proxy_rx, &shutdown)
                        .await
                }
                Err(e) => Err(e),
            };

            let error = result.err().map(|e| {
                self.handle_error(&e);
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

    async fn connect(&self) -> Result<TcpStream> {
        let address = SocketAddr::new(self.session.remote_ip, self.session.remote_port);
        let socket = match address.ip() {
            IpAddr::V4(_) => TcpSocket::new_v4()?,
            IpAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(protector) = &self.protector {
            if !protector.protect_tcp(&socket) {
                return Err(NetBareError::shutdown(format!(
                    "failed to protect socket to {}",
                    address
                )));
            }
        }
        match tokio::time::timeout(self.connect_timeout, socket.connect(address)).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(NetBareError::shutdown(format!(
                "connect to {} timed out after {:?}",
                address, self.connect_timeout
            ))),
        }
    }

    async fn pump(
        &self,
        gateway: &mut PolicyGateway,
        proxy: TcpStream,
        remote: TcpStream,
        mut remote_rx: TunnelReceiver,
        mut proxy_rx: TunnelReceiver,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let (mut proxy_read, mut proxy_write) = proxy.into_split();
        let (mut remote_read, mut remote_write) = remote.into_split();
        let mut proxy_buf = vec![0u8; self.read_buffer];
        let mut remote_buf = vec![0u8; self.read_buffer];

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Service stopping, closing connection");
                    break Ok(());
                }
                read = proxy_read.read(&mut proxy_buf) => {
                    match read {
                        Ok(0) => {
                            debug!("Client closed");
                            break Ok(());
                        }
                        Ok(n) => {
                            self.session.touch();
                            self.session.add_send_data_size(n);
                            if let Err(e) = gateway.on_request(Bytes::copy_from_slice(&proxy_buf[..n])) {
                                break Err(e);
                            }
                        }
                        Err(e) => break Err(e.into()),
                    }
                }
                read = remote_read.read(&mut remote_buf) => {
                    match read {
                        Ok(0) => {
                            debug!("Remote closed");
                            break Ok(());
                        }
                        Ok(n) => {
                            self.session.touch();
                            self.session.add_receive_data_size(n);
                            if let Err(e) = gateway.on_response(Bytes::copy_from_slice(&remote_buf[..n])) {
                                break Err(e);
                            }
                        }
                        Err(e) => break Err(e.into()),
                    }
                }
                Some(buffer) = remote_rx.recv() => {
                    if let Err(e) = remote_write.write_all(&buffer).await {
                        break Err(e.into());
                    }
                }
                Some(buffer) = proxy_rx.recv() => {
                    if let Err(e) = proxy_write.write_all(&buffer).await {
                        break Err(e.into());
                    }
                }
            }
        };

        // Flush what the gateway queued before the close
        while let Some(buffer) = remote_rx.try_recv() {
            if remote_write.write_all(&buffer).await.is_err() {
                break;
            }
        }
        while let Some(buffer) = proxy_rx.try_recv() {
            if proxy_write.write_all(&buffer).await.is_err() {
                break;
            }
        }
        let _ = remote_write.shutdown().await;
        let _ = proxy_write.shutdown().await;
        result
    }

    /// Classify an error at the tunnel boundary
    fn handle_error(&self, error: &NetBareError) {
        let reason = match error.kind() {
            ErrorKind::HandshakeFailure => BypassReason::HandshakeFailure,
            ErrorKind::Other => BypassReason::UnexpectedError,
            ErrorKind::Transport => {
                debug!(error = %error, "Transport error");
                return;
            }
            ErrorKind::ProtocolViolation => {
                warn!(error = %error, "Protocol violation, aborting connection");
                return;
            }
        };
        let ip = self.session.remote_ip.to_string();
        warn!(
            error = %error,
            ip = %ip,
            host = ?self.session.host(),
            reason = %reason,
            "Bypassing peer on future connections"
        );
        self.whitelist.add(ip, reason);
        if let Some(host) = self.session.host() {
            self.whitelist.add(host, reason);
        }
    }
}
