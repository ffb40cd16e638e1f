use crate::net::Session;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, Span};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. Returns `false` when a
/// subscriber was already installed, which is harmless in tests.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Final accounting of one connection, emitted when its tunnel closes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSummary {
    pub session_id: String,
    pub protocol: String,
    pub remote: String,
    pub host: Option<String>,
    pub uid: i32,
    /// ISO8601 creation time
    pub started_at: String,
    pub duration_ms: i64,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub error_message: Option<String>,
}

/// Per-connection logging context.
///
/// Every codec and interceptor message logged while the tunnel task runs
/// inside `span()` carries the connection's protocol and remote endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionLog {
    span: Span,
}

impl ConnectionLog {
    pub fn new(session: &Session) -> Self {
        let span = tracing::info_span!(
            "connection",
            id = %session.id,
            protocol = %session.protocol,
            remote_ip = %session.remote_ip,
            remote_port = session.remote_port,
            local_port = session.local_port,
        );
        Self { span }
    }

    pub fn span(&self) -> Span {
        self.span.clone()
    }

    pub fn summary(session: &Session, error: Option<String>) -> ConnectionSummary {
        let started_at = Utc
            .timestamp_millis_opt(session.time)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        ConnectionSummary {
            session_id: session.id.clone(),
            protocol: session.protocol.to_string(),
            remote: format!("{}:{}", session.remote_ip, session.remote_port),
            host: session.host(),
            uid: session.uid(),
            started_at,
            duration_ms: Utc::now().timestamp_millis() - session.time,
            sent_bytes: session.send_data_size(),
            received_bytes: session.receive_data_size(),
            error_message: error,
        }
    }

    /// Log the closing summary inside this connection's span
    pub fn closed(&self, session: &Session, error: Option<String>) {
        let summary = Self::summary(session, error);
        let _entered = self.span.enter();
        info!(
            host = ?summary.host,
            uid = summary.uid,
            duration_ms = summary.duration_ms,
            sent = summary.sent_bytes,
            received = summary.received_bytes,
            error = ?summary.error_message,
            "Connection closed"
        );
    }
}
