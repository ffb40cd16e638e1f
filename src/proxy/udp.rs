//! UDP forwarding, one tunnel per local port

use super::{Forwarder, ForwarderContext};
use crate::error::Result;
use crate::net::{IpPacket, Protocol};
use crate::tunnel::UdpVirtualTunnel;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const FLOW_QUEUE: usize = 256;

struct Flow {
    session_id: String,
    requests: mpsc::Sender<Bytes>,
}

pub struct UdpProxyForwarder {
    context: ForwarderContext,
    flows: HashMap<u16, Flow>,
    shutdown: CancellationToken,
}

impl UdpProxyForwarder {
    pub fn new(context: ForwarderContext) -> Self {
        let shutdown = context.shutdown.child_token();
        Self {
            context,
            flows: HashMap::new(),
            shutdown,
        }
    }

    /// Live flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

impl Forwarder for UdpProxyForwarder {
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn forward(&mut self, packet: &mut [u8], ip: &IpPacket) -> Result<()> {
        let local_port = ip.source.port();
        let session = self.context.sessions.ensure_query(
            Protocol::Udp,
            local_port,
            ip.destination.port(),
            ip.destination.ip(),
        );
        session.touch();
        session.next_packet_index();
        let payload = Bytes::copy_from_slice(ip.payload(packet));

        let reusable = self.flows.get(&local_port).map_or(false, |flow| {
            flow.session_id == session.id && !flow.requests.is_closed()
        });
        if !reusable {
            let (requests, rx) = mpsc::channel(FLOW_QUEUE);
            let tunnel = UdpVirtualTunnel::new(
                session.clone(),
                ip.source,
                self.context.factory.clone(),
                self.context.hosts.clone(),
                self.context.codec.clone(),
                self.context.output.clone(),
            )
            .with_protector(self.context.protector.clone())
            .with_idle_timeout(self.context.idle_timeout);
            self.context
                .runtime
                .spawn(tunnel.run(rx, self.shutdown.child_token()));
            debug!(local_port, remote = %ip.destination, "New UDP flow");
            self.flows.insert(
                local_port,
                Flow {
                    session_id: session.id.clone(),
                    requests,
                },
            );
        }

        if let Some(flow) = self.flows.get(&local_port) {
            if flow.requests.try_send(payload).is_err() {
                debug!(local_port, "UDP flow queue full, dropping datagram");
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        self.shutdown.cancel();
        let count = self.flows.len();
        self.flows.clear();
        if count > 0 {
            info!(flows = count, "UDP flows released");
        }
    }
}
