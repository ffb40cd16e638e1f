//! SSL whitelist - peers that must not be intercepted
//!
//! A host or IP lands here when a MITM handshake with it failed, so later
//! connections pass through encrypted instead of failing again. Entries can
//! also be configured up front.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::info;

/// Why an address was whitelisted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BypassReason {
    /// Client or server rejected the MITM handshake
    HandshakeFailure,

    /// Unexpected failure while intercepting
    UnexpectedError,

    /// User-configured bypass
    UserConfigured,
}

impl std::fmt::Display for BypassReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::HandshakeFailure => write!(f, "Handshake Failure"),
            Self::UnexpectedError => write!(f, "Unexpected Error"),
            Self::UserConfigured => write!(f, "User Configured"),
        }
    }
}

/// One whitelisted address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassEntry {
    pub reason: BypassReason,

    /// When the entry was added (Unix timestamp)
    pub added_at: i64,
}

/// Process-wide set of hosts and IPs that skip interception
#[derive(Debug, Default)]
pub struct SslWhiteList {
    entries: RwLock<HashMap<String, BypassEntry>>,
}

impl SslWhiteList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the list with user-configured addresses
    pub fn with_entries<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let list = Self::new();
        for address in addresses {
            list.add(address, BypassReason::UserConfigured);
        }
        list
    }

    /// Add an address. An existing entry keeps its original reason.
    pub fn add(&self, address: impl Into<String>, reason: BypassReason) {
        let address = address.into();
        if address.is_empty() {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&address) {
            return;
        }
        info!(address = %address, reason = %reason, "Added to SSL whitelist");
        entries.insert(
            address,
            BypassEntry {
                reason,
                added_at: chrono::Utc::now().timestamp(),
            },
        );
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(address)
    }

    pub fn reason(&self, address: &str) -> Option<BypassReason> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .map(|entry| entry.reason)
    }

    pub fn remove(&self, address: &str) -> Option<BypassEntry> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
