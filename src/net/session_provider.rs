//! Session registry keyed by local virtual port
//!
//! At most one live session exists per local port. A packet whose remote
//! endpoint no longer matches the registered session replaces it.

use super::session::{Protocol, Session, UID_UNKNOWN};
use super::uid::UidDumper;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Registry statistics
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Sessions created
    pub created: u64,

    /// Sessions replaced because the 4-tuple changed
    pub replaced: u64,

    /// Sessions evicted by `cleanup`
    pub evicted: u64,
}

pub struct SessionProvider {
    sessions: Mutex<HashMap<u16, Arc<Session>>>,
    uid_dumper: Option<Arc<UidDumper>>,
    stats: Mutex<SessionStats>,
}

impl SessionProvider {
    pub fn new(uid_dumper: Option<Arc<UidDumper>>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            uid_dumper,
            stats: Mutex::new(SessionStats::default()),
        }
    }

    /// Look up the session for `local_port`, retrying uid resolution if still unknown
    pub fn query(&self, local_port: u16) -> Option<Arc<Session>> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&local_port)
            .cloned()?;
        if session.uid() == UID_UNKNOWN {
            self.request_uid(&session);
        }
        Some(session)
    }

    /// Look up or create the session for a client packet
    pub fn ensure_query(
        &self,
        protocol: Protocol,
        local_port: u16,
        remote_port: u16,
        remote_ip: IpAddr,
    ) -> Arc<Session> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = sessions.get(&local_port) {
            if existing.matches(protocol, remote_port, remote_ip) {
                return existing.clone();
            }
            debug!(
                local_port,
                old_remote = %existing.remote_ip,
                new_remote = %remote_ip,
                "Local port reused, replacing session"
            );
            self.stats.lock().unwrap_or_else(|e| e.into_inner()).replaced += 1;
        }

        let session = Arc::new(Session::new(protocol, local_port, remote_port, remote_ip));
        sessions.insert(local_port, session.clone());
        drop(sessions);

        self.stats.lock().unwrap_or_else(|e| e.into_inner()).created += 1;
        self.request_uid(&session);
        session
    }

    pub fn remove(&self, local_port: u16) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&local_port)
    }

    /// Drop sessions idle for longer than `idle_timeout`, returning how many went
    pub fn cleanup(&self, idle_timeout: Duration) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - idle_timeout.as_millis() as i64;
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, session| session.last_active() >= cutoff);
        let evicted = before - sessions.len();
        drop(sessions);

        if evicted > 0 {
            debug!(evicted, "Evicted idle sessions");
            self.stats.lock().unwrap_or_else(|e| e.into_inner()).evicted += evicted as u64;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn request_uid(&self, session: &Arc<Session>) {
        if let Some(dumper) = &self.uid_dumper {
            dumper.request(session.clone());
        }
    }
}
