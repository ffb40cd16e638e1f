//! Service lifecycle
//!
//! `start` prepares the forwarders, runs the I/O runtime and spawns the
//! virtual interface reader thread. `stop` cancels everything: the reader
//! releases its forwarders, and every tunnel closes and fires its gateway's
//! finish callbacks.

use crate::config::Config;
use crate::error::{NetBareError, Result};
use crate::gateway::policy::current_uid;
use crate::gateway::{HostPolicy, VirtualGatewayFactory};
use crate::mitm::{BypassReason, SslWhiteList};
use crate::net::{InterfaceOutput, PacketCodec, Protocol, SessionProvider, UidDumper};
use crate::proxy::{
    Forwarder, ForwarderContext, IcmpProxyForwarder, TcpProxyForwarder, UdpProxyForwarder,
};
use std::collections::HashMap;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const IO_THREADS: usize = 2;
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(1);
const READ_RETRY: Duration = Duration::from_millis(10);

/// Service state notifications
pub trait NetBareListener: Send + Sync {
    fn on_service_started(&self) {}

    fn on_service_stopped(&self) {}
}

pub struct NetBareService {
    shutdown: CancellationToken,
    runtime: Option<Runtime>,
    reader: Option<JoinHandle<()>>,
    listeners: Vec<Arc<dyn NetBareListener>>,
    sessions: Arc<SessionProvider>,
    whitelist: Arc<SslWhiteList>,
    proxy_port: Option<u16>,
    stopped: bool,
}

impl NetBareService {
    pub fn start(
        config: Config,
        input: Box<dyn Read + Send>,
        output: Box<dyn Write + Send>,
        codec: Arc<dyn PacketCodec>,
        factory: Arc<dyn VirtualGatewayFactory>,
        listeners: Vec<Arc<dyn NetBareListener>>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| NetBareError::config(format!("{:#}", e)))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(IO_THREADS)
            .thread_name("netbare-io")
            .enable_all()
            .build()?;
        let shutdown = CancellationToken::new();

        let local_ip = config.local_ip();
        let uid_dumper = config
            .dump_uid
            .then(|| Arc::new(UidDumper::new(Some(local_ip), config.uid_provider.clone())));
        let sessions = Arc::new(SessionProvider::new(uid_dumper));

        let mut hosts = HostPolicy::new(
            config.allowed_hosts.iter().cloned(),
            config.disallowed_hosts.iter().cloned(),
        );
        if config.exclude_self {
            hosts = hosts.exclude_self(current_uid());
        }
        if !config.allowed_applications.is_empty() || !config.disallowed_applications.is_empty() {
            debug!(
                allowed = config.allowed_applications.len(),
                disallowed = config.disallowed_applications.len(),
                "Application lists are applied by the platform when routing"
            );
        }

        let whitelist = factory
            .ssl_whitelist()
            .unwrap_or_else(|| Arc::new(SslWhiteList::new()));
        for address in &config.ssl_whitelist {
            whitelist.add(address.clone(), BypassReason::UserConfigured);
        }

        let output: InterfaceOutput = Arc::new(Mutex::new(output));
        let context = ForwarderContext {
            runtime: runtime.handle().clone(),
            shutdown: shutdown.clone(),
            local_ip,
            mtu: config.mtu,
            codec: codec.clone(),
            output,
            sessions: sessions.clone(),
            factory,
            hosts: Arc::new(hosts),
            whitelist: whitelist.clone(),
            protector: config.socket_protector.clone(),
            max_pending: config.max_pending_writes,
            connect_timeout: config.connect_timeout,
            idle_timeout: config.session_idle_timeout,
        };

        let mut tcp = TcpProxyForwarder::new(context.clone());
        let mut udp = UdpProxyForwarder::new(context.clone());
        let mut icmp = IcmpProxyForwarder::new();
        tcp.prepare()?;
        udp.prepare()?;
        icmp.prepare()?;
        let proxy_port = tcp.proxy_port();

        let mut forwarders: HashMap<Protocol, Box<dyn Forwarder>> = HashMap::new();
        forwarders.insert(Protocol::Tcp, Box::new(tcp));
        forwarders.insert(Protocol::Udp, Box::new(udp));
        forwarders.insert(Protocol::Icmp, Box::new(icmp));

        runtime.spawn(cleanup_sessions(
            sessions.clone(),
            config.session_idle_timeout,
            shutdown.clone(),
        ));

        let reader = std::thread::Builder::new()
            .name("netbare-reader".to_string())
            .spawn({
                let shutdown = shutdown.clone();
                let mtu = config.mtu;
                move || read_interface(input, codec, forwarders, mtu, shutdown)
            })?;

        info!(
            session = %config.session_name,
            address = %config.address,
            mtu = config.mtu,
            proxy_port = ?proxy_port,
            "NetBare service started"
        );
        for listener in &listeners {
            listener.on_service_started();
        }

        Ok(Self {
            shutdown,
            runtime: Some(runtime),
            reader: Some(reader),
            listeners,
            sessions,
            whitelist,
            proxy_port,
            stopped: false,
        })
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    pub fn sessions(&self) -> &Arc<SessionProvider> {
        &self.sessions
    }

    pub fn whitelist(&self) -> &Arc<SslWhiteList> {
        &self.whitelist
    }

    /// Port of the local TCP proxy server
    pub fn proxy_port(&self) -> Option<u16> {
        self.proxy_port
    }

    /// Stop the service. Must not be called from inside an async context.
    ///
    /// The reader thread is joined only if it already returned; a reader
    /// blocked on the interface exits on its next read.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shutdown.cancel();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
        }
        if let Some(reader) = self.reader.take() {
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
        self.sessions.clear();
        info!("NetBare service stopped");
        for listener in &self.listeners {
            listener.on_service_stopped();
        }
    }
}

impl Drop for NetBareService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_interface(
    mut input: Box<dyn Read + Send>,
    codec: Arc<dyn PacketCodec>,
    mut forwarders: HashMap<Protocol, Box<dyn Forwarder>>,
    mtu: usize,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; mtu];
    while !shutdown.is_cancelled() {
        let n = match input.read(&mut buf) {
            Ok(0) => {
                debug!("Virtual interface closed");
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(e) if e.kind() == IoErrorKind::WouldBlock => {
                std::thread::sleep(READ_RETRY);
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Virtual interface read failed");
                break;
            }
        };
        let packet = &mut buf[..n];
        let Some(ip) = codec.parse(packet) else {
            trace!(len = n, "Unsupported packet");
            continue;
        };
        if let Some(forwarder) = forwarders.get_mut(&ip.protocol) {
            if let Err(e) = forwarder.forward(packet, &ip) {
                debug!(error = %e, protocol = %ip.protocol, "Forward failed");
            }
        }
    }
    for forwarder in forwarders.values_mut() {
        forwarder.release();
    }
    shutdown.cancel();
}

async fn cleanup_sessions(
    sessions: Arc<SessionProvider>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(idle_timeout.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                sessions.cleanup(idle_timeout);
            }
        }
    }
}
