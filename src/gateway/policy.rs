//! Allow/deny resolution in front of the interceptor chain
//!
//! The policy is resolved once per connection from the first non-empty buffer
//! in either direction. Until then buffers are held back from interceptors.

use super::chain::{Direction, Sinks};
use super::VirtualGateway;
use crate::error::Result;
use crate::mitm::ssl_utils;
use crate::net::{Protocol, Session};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Indeterminate,
    /// Buffers flow through the interceptor chain
    Allowed,
    /// Buffers go straight to the sinks
    Disallowed,
}

/// Literal host/IP allow and deny lists
#[derive(Debug, Clone, Default)]
pub struct HostPolicy {
    allowed_hosts: HashSet<String>,
    disallowed_hosts: HashSet<String>,
    exclude_self: bool,
    own_uid: Option<i32>,
}

impl HostPolicy {
    pub fn new<A, D>(allowed_hosts: A, disallowed_hosts: D) -> Self
    where
        A: IntoIterator<Item = String>,
        D: IntoIterator<Item = String>,
    {
        Self {
            allowed_hosts: allowed_hosts.into_iter().collect(),
            disallowed_hosts: disallowed_hosts.into_iter().collect(),
            exclude_self: false,
            own_uid: None,
        }
    }

    /// Skip interception for connections owned by `own_uid`
    pub fn exclude_self(mut self, own_uid: Option<i32>) -> Self {
        self.exclude_self = true;
        self.own_uid = own_uid;
        self
    }

    /// Does a connection from `uid` belong to this process
    pub fn is_self(&self, uid: i32) -> bool {
        self.exclude_self && self.own_uid == Some(uid)
    }

    /// Resolve the policy for a host (if one was extracted) and remote IP.
    ///
    /// The deny list wins over the allow list; a non-empty allow list must match.
    pub fn resolve(&self, host: Option<&str>, remote_ip: &str) -> Policy {
        let host = match host {
            Some(host) => host,
            None => return Policy::Allowed,
        };
        if self.allowed_hosts.is_empty() && self.disallowed_hosts.is_empty() {
            return Policy::Allowed;
        }
        if self.disallowed_hosts.contains(host) || self.disallowed_hosts.contains(remote_ip) {
            return Policy::Disallowed;
        }
        if self.allowed_hosts.is_empty()
            || self.allowed_hosts.contains(host)
            || self.allowed_hosts.contains(remote_ip)
        {
            Policy::Allowed
        } else {
            Policy::Disallowed
        }
    }
}

/// Uid of the running process, where the platform exposes one
pub fn current_uid() -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata("/proc/self")
            .ok()
            .map(|meta| meta.uid() as i32)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Could `data` be the start of a plaintext HTTP request
pub fn looks_like_http(data: &[u8]) -> bool {
    matches!(
        data.first(),
        Some(b'G' | b'H' | b'P' | b'D' | b'O' | b'T' | b'C')
    )
}

/// Value of the first `Host` header of a plaintext request head
pub fn parse_http_host(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    let mut lines = text.split("\r\n");
    lines.next()?;
    for line in lines {
        if line.is_empty() {
            return None;
        }
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("host") {
            return Some(value.trim().to_string());
        }
    }
    None
}

/// Wraps a connection's gateway with policy resolution and finish bookkeeping
pub struct PolicyGateway {
    inner: Box<dyn VirtualGateway>,
    session: Arc<Session>,
    sinks: Sinks,
    hosts: Arc<HostPolicy>,
    policy: Policy,
    request_finished: bool,
    response_finished: bool,
}

impl PolicyGateway {
    pub fn new(
        session: Arc<Session>,
        sinks: Sinks,
        hosts: Arc<HostPolicy>,
        inner: Box<dyn VirtualGateway>,
    ) -> Self {
        let policy = if hosts.is_self(session.uid()) {
            warn!(session = %session.id, "Excluding a connection owned by this process");
            Policy::Disallowed
        } else {
            Policy::Indeterminate
        };
        Self {
            inner,
            session,
            sinks,
            hosts,
            policy,
            request_finished: false,
            response_finished: false,
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    fn resolve_if_necessary(&mut self, buffer: &[u8]) {
        if self.policy != Policy::Indeterminate || buffer.is_empty() {
            return;
        }
        // The uid may have been resolved since construction
        if self.hosts.is_self(self.session.uid()) {
            self.policy = Policy::Disallowed;
            return;
        }
        if self.session.protocol != Protocol::Tcp {
            self.policy = Policy::Allowed;
            return;
        }

        let host = if looks_like_http(buffer) {
            parse_http_host(buffer)
        } else {
            ssl_utils::parse_sni(buffer)
        };
        if let Some(host) = &host {
            self.session.set_host(host.clone());
        }
        self.policy = self
            .hosts
            .resolve(host.as_deref(), &self.session.remote_ip.to_string());
        info!(
            host = ?host,
            remote_ip = %self.session.remote_ip,
            policy = ?self.policy,
            "Resolved gateway policy"
        );
    }

    fn dispatch(&mut self, direction: Direction, buffer: Bytes) -> Result<()> {
        self.resolve_if_necessary(&buffer);
        match (self.policy, direction) {
            (Policy::Allowed, Direction::Request) => self.inner.on_request(buffer),
            (Policy::Allowed, Direction::Response) => self.inner.on_response(buffer),
            (Policy::Disallowed, _) => {
                if buffer.is_empty() {
                    return Ok(());
                }
                self.sinks.sink(direction).write(buffer)
            }
            (Policy::Indeterminate, _) => Ok(()),
        }
    }
}

impl VirtualGateway for PolicyGateway {
    fn on_request(&mut self, buffer: Bytes) -> Result<()> {
        if self.request_finished {
            warn!(session = %self.session.id, "Drop a buffer after the request finished");
            return Ok(());
        }
        self.dispatch(Direction::Request, buffer)
    }

    fn on_response(&mut self, buffer: Bytes) -> Result<()> {
        if self.response_finished {
            warn!(session = %self.session.id, "Drop a buffer after the response finished");
            return Ok(());
        }
        self.dispatch(Direction::Response, buffer)
    }

    fn on_request_finished(&mut self) {
        if self.request_finished {
            return;
        }
        self.request_finished = true;
        if self.policy == Policy::Allowed {
            self.inner.on_request_finished();
        }
    }

    fn on_response_finished(&mut self) {
        if self.response_finished {
            return;
        }
        self.response_finished = true;
        if self.policy == Policy::Allowed {
            self.inner.on_response_finished();
        }
    }
}
