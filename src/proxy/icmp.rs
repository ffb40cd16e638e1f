use super::Forwarder;
use crate::error::Result;
use crate::net::IpPacket;
use tracing::debug;

/// ICMP is observed only; echo requests are not answered.
#[derive(Debug, Default)]
pub struct IcmpProxyForwarder {
    seen: u64,
}

impl IcmpProxyForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }
}

impl Forwarder for IcmpProxyForwarder {
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn forward(&mut self, _packet: &mut [u8], ip: &IpPacket) -> Result<()> {
        self.seen += 1;
        let (kind, code) = ip.icmp.unwrap_or_default();
        debug!(
            source = %ip.source.ip(),
            destination = %ip.destination.ip(),
            kind,
            code,
            "ICMP packet"
        );
        Ok(())
    }

    fn release(&mut self) {}
}
