//! Best-effort uid attribution for sessions
//!
//! A pluggable `UidProvider` is consulted first. Without an answer the dumper
//! scans `/proc/net/{tcp,tcp6,udp,udp6}` on a short-lived worker thread and
//! caches what it finds.

use super::session::{Protocol, Session};
use lazy_static::lazy_static;
use lru::LruCache;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Resolves the owning uid of a session, `None` when unknown
pub trait UidProvider: Send + Sync {
    fn uid(&self, session: &Session) -> Option<i32>;
}

const NET_ALIVE: Duration = Duration::from_secs(15);
const NET_CACHE_SIZE: usize = 100;
const MAX_DUMP_DURATION: Duration = Duration::from_millis(100);

lazy_static! {
    static ref IPV4_PATTERN: Regex = Regex::new(concat!(
        r"(?i)\s+\d+:\s([0-9A-F]{8}):([0-9A-F]{4})\s([0-9A-F]{8}):([0-9A-F]{4})\s([0-9A-F]{2})",
        r"\s[0-9A-F]{8}:[0-9A-F]{8}\s[0-9A-F]{2}:[0-9A-F]{8}\s[0-9A-F]{8}\s+([0-9A-F]+)"
    ))
    .unwrap_or_else(|e| panic!("invalid IPv4 net pattern: {}", e));
    static ref IPV6_PATTERN: Regex = Regex::new(concat!(
        r"(?i)\s+\d+:\s([0-9A-F]{32}):([0-9A-F]{4})\s([0-9A-F]{32}):([0-9A-F]{4})\s([0-9A-F]{2})",
        r"\s[0-9A-F]{8}:[0-9A-F]{8}\s[0-9A-F]{2}:[0-9A-F]{8}\s[0-9A-F]{8}\s+([0-9A-F]+)"
    ))
    .unwrap_or_else(|e| panic!("invalid IPv6 net pattern: {}", e));
}

/// One socket row from a `/proc/net` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetEntry {
    pub uid: i32,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
}

#[derive(Clone)]
struct CachedNet {
    entry: NetEntry,
    cached_at: Instant,
}

pub struct UidDumper {
    local_ip: Option<IpAddr>,
    provider: Option<Arc<dyn UidProvider>>,
    proc_root: PathBuf,
    cache: Arc<Mutex<LruCache<(Protocol, u16), CachedNet>>>,
}

impl UidDumper {
    pub fn new(local_ip: Option<IpAddr>, provider: Option<Arc<dyn UidProvider>>) -> Self {
        Self::with_proc_root(local_ip, provider, "/proc")
    }

    /// Read the socket tables below `proc_root` instead of `/proc`
    pub fn with_proc_root(
        local_ip: Option<IpAddr>,
        provider: Option<Arc<dyn UidProvider>>,
        proc_root: impl Into<PathBuf>,
    ) -> Self {
        let capacity = NonZeroUsize::new(NET_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            local_ip,
            provider,
            proc_root: proc_root.into(),
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Resolve the uid of `session` in the background
    pub fn request(self: &Arc<Self>, session: Arc<Session>) {
        if let Some(provider) = &self.provider {
            if let Some(uid) = provider.uid(&session) {
                session.set_uid(uid);
                return;
            }
        }
        if session.protocol == Protocol::Icmp {
            return;
        }

        if let Some(entry) = self.cached(session.protocol, session.local_port) {
            session.set_uid(entry.uid);
            return;
        }

        let dumper = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("uid-dumper".to_string())
            .spawn(move || {
                if let Some(entry) = dumper.dump(session.protocol, session.local_port) {
                    debug!(
                        local_port = session.local_port,
                        uid = entry.uid,
                        "Resolved session uid"
                    );
                    session.set_uid(entry.uid);
                    dumper.store(session.protocol, entry);
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn uid dumper thread: {}", e);
        }
    }

    /// Scan the socket tables for `port`
    pub fn dump(&self, protocol: Protocol, port: u16) -> Option<NetEntry> {
        let tables: [(&str, &Regex); 2] = match protocol {
            Protocol::Tcp => [("net/tcp6", &IPV6_PATTERN), ("net/tcp", &IPV4_PATTERN)],
            Protocol::Udp => [("net/udp6", &IPV6_PATTERN), ("net/udp", &IPV4_PATTERN)],
            Protocol::Icmp => return None,
        };
        tables
            .iter()
            .find_map(|(file, pattern)| self.dump_table(&self.proc_root.join(file), pattern, port))
    }

    fn dump_table(&self, path: &Path, pattern: &Regex, port: u16) -> Option<NetEntry> {
        let content = std::fs::read_to_string(path).ok()?;
        let started = Instant::now();
        for line in content.lines() {
            if started.elapsed() > MAX_DUMP_DURATION {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            for caps in pattern.captures_iter(line) {
                let uid = match caps[6].parse::<i32>() {
                    Ok(uid) if uid > 0 => uid,
                    _ => continue,
                };
                if parse_port(&caps[2]) != Some(port) {
                    continue;
                }
                let local_ip = match parse_ip(&caps[1]) {
                    Some(ip) => ip,
                    None => continue,
                };
                if self.local_ip.map_or(false, |expected| expected != local_ip) {
                    continue;
                }
                let (remote_ip, remote_port) = match (parse_ip(&caps[3]), parse_port(&caps[4])) {
                    (Some(ip), Some(port)) => (ip, port),
                    _ => continue,
                };
                return Some(NetEntry {
                    uid,
                    local_ip,
                    local_port: port,
                    remote_ip,
                    remote_port,
                });
            }
        }
        None
    }

    fn cached(&self, protocol: Protocol, port: u16) -> Option<NetEntry> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let key = (protocol, port);
        match cache.get(&key) {
            Some(cached) if cached.cached_at.elapsed() <= NET_ALIVE => Some(cached.entry.clone()),
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        }
    }

    fn store(&self, protocol: Protocol, entry: NetEntry) {
        let key = (protocol, entry.local_port);
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).put(
            key,
            CachedNet {
                entry,
                cached_at: Instant::now(),
            },
        );
    }
}

/// Parse the trailing IPv4 part of a little-endian hex address
fn parse_ip(hex: &str) -> Option<IpAddr> {
    let tail = hex.get(hex.len().checked_sub(8)?..)?;
    let raw = u32::from_str_radix(tail, 16).ok()?;
    Some(IpAddr::V4(Ipv4Addr::from(raw.swap_bytes())))
}

fn parse_port(hex: &str) -> Option<u16> {
    u16::from_str_radix(hex, 16).ok()
}
