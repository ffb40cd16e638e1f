//! Flow identity

use rand::Rng;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

/// IP protocols handled by the forwarders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
}

impl Protocol {
    /// Map an IP protocol number
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Protocol::Icmp),
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Protocol::Icmp => 1,
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Uid value while the owning process is unknown
pub const UID_UNKNOWN: i32 = 0;

/// One logical flow seen on the virtual interface
#[derive(Debug)]
pub struct Session {
    /// Random hex identifier
    pub id: String,
    /// Creation time, unix millis
    pub time: i64,
    pub protocol: Protocol,
    pub local_port: u16,
    pub remote_port: u16,
    pub remote_ip: IpAddr,

    host: RwLock<Option<String>>,
    uid: AtomicI32,
    packet_index: AtomicU32,
    send_data_size: AtomicU64,
    receive_data_size: AtomicU64,
    last_active: AtomicI64,
}

impl Session {
    pub fn new(protocol: Protocol, local_port: u16, remote_port: u16, remote_ip: IpAddr) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: random_id(),
            time: now,
            protocol,
            local_port,
            remote_port,
            remote_ip,
            host: RwLock::new(None),
            uid: AtomicI32::new(UID_UNKNOWN),
            packet_index: AtomicU32::new(0),
            send_data_size: AtomicU64::new(0),
            receive_data_size: AtomicU64::new(0),
            last_active: AtomicI64::new(now),
        }
    }

    /// Host name learned from an HTTP `Host` header or TLS SNI
    pub fn host(&self) -> Option<String> {
        self.host.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_host(&self, host: impl Into<String>) {
        *self.host.write().unwrap_or_else(|e| e.into_inner()) = Some(host.into());
    }

    pub fn uid(&self) -> i32 {
        self.uid.load(Ordering::Acquire)
    }

    pub fn set_uid(&self, uid: i32) {
        self.uid.store(uid, Ordering::Release);
    }

    /// Count one more client packet and return the previous count
    pub fn next_packet_index(&self) -> u32 {
        self.touch();
        self.packet_index.fetch_add(1, Ordering::AcqRel)
    }

    pub fn packet_index(&self) -> u32 {
        self.packet_index.load(Ordering::Acquire)
    }

    pub fn add_send_data_size(&self, bytes: usize) {
        self.touch();
        self.send_data_size.fetch_add(bytes as u64, Ordering::AcqRel);
    }

    pub fn add_receive_data_size(&self, bytes: usize) {
        self.touch();
        self.receive_data_size
            .fetch_add(bytes as u64, Ordering::AcqRel);
    }

    pub fn send_data_size(&self) -> u64 {
        self.send_data_size.load(Ordering::Acquire)
    }

    pub fn receive_data_size(&self) -> u64 {
        self.receive_data_size.load(Ordering::Acquire)
    }

    /// Mark the session active now
    pub fn touch(&self) {
        self.last_active
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Unix millis of the last recorded activity
    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Acquire)
    }

    /// Same remote endpoint and protocol
    pub fn matches(&self, protocol: Protocol, remote_port: u16, remote_ip: IpAddr) -> bool {
        self.protocol == protocol && self.remote_port == remote_port && self.remote_ip == remote_ip
    }
}

/// Random 16-character hex identifier
pub fn random_id() -> String {
    let value: u64 = rand::thread_rng().gen();
    format!("{:016x}", value)
}
