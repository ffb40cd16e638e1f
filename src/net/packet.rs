//! Raw IP packet seam
//!
//! Header parsing, address rewriting and checksums are supplied by the
//! embedding application through `PacketCodec`. The forwarders only need the
//! addressing view in `IpPacket`.

use super::session::Protocol;
use crate::error::Result;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Smallest IPv4 header
pub const MIN_IP_HEADER_LENGTH: usize = 20;

/// Writable side of the virtual interface, shared by every forwarder
pub type InterfaceOutput = Arc<Mutex<Box<dyn Write + Send>>>;

/// Addressing view over one raw datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPacket {
    pub protocol: Protocol,
    /// Source address and port (port 0 for ICMP)
    pub source: SocketAddr,
    /// Destination address and port (port 0 for ICMP)
    pub destination: SocketAddr,
    /// Offset of the transport payload
    pub payload_offset: usize,
    pub payload_len: usize,
    /// ICMP type and code
    pub icmp: Option<(u8, u8)>,
}

impl IpPacket {
    pub fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        let end = (self.payload_offset + self.payload_len).min(packet.len());
        packet.get(self.payload_offset..end).unwrap_or(&[])
    }
}

/// IP/TCP/UDP header routines
pub trait PacketCodec: Send + Sync {
    /// Parse the headers of `packet`, `None` for anything unsupported
    fn parse(&self, packet: &[u8]) -> Option<IpPacket>;

    /// Rewrite source and destination in place, updating every checksum
    fn rewrite(&self, packet: &mut [u8], source: SocketAddr, destination: SocketAddr)
        -> Result<()>;

    /// Build a complete UDP datagram carrying `payload`
    fn build_udp_datagram(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        payload: &[u8],
    ) -> Result<Vec<u8>>;
}

/// Write one packet to the virtual interface
pub fn write_packet(output: &InterfaceOutput, packet: &[u8]) -> std::io::Result<()> {
    let mut writer = output.lock().unwrap_or_else(|e| e.into_inner());
    writer.write_all(packet)?;
    writer.flush()
}
