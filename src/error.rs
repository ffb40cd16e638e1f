//! Error types shared by the packet pipeline

use crate::http2::frame::FrameError;
use crate::http2::hpack::HpackError;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, NetBareError>;

/// Errors raised by tunnels, codecs and interceptors
#[derive(Error, Debug)]
pub enum NetBareError {
    /// Malformed wire data (HTTP/2 frame, padding, stream id misuse)
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// HPACK header block could not be decoded
    #[error("HPACK error: {0}")]
    Hpack(#[from] HpackError),

    /// HTTP/2 frame could not be decoded
    #[error("HTTP/2 frame error: {0}")]
    Frame(#[from] FrameError),

    /// MITM handshake failed on either side
    #[error("TLS handshake failed for {host}: {reason}")]
    Handshake { host: String, reason: String },

    /// Record layer error after the handshake
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer or the service closed the connection
    #[error("Connection shutdown: {0}")]
    ConnectionShutdown(String),

    /// No session registered for an accepted local port
    #[error("No session found for local port {0}")]
    SessionNotFound(u16),

    /// Pending-write queue is over its configured cap
    #[error("Pending write queue full ({0} buffers)")]
    Backpressure(usize),

    /// Leaf certificate generation failed
    #[error("Failed to generate certificate for {host}: {reason}")]
    CertGeneration { host: String, reason: String },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification used at the tunnel boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Abort the connection only
    ProtocolViolation,
    /// Abort and bypass the peer on future connections
    HandshakeFailure,
    /// Connect/reset/EOF, abort and log
    Transport,
    /// Anything unexpected, treated like a handshake failure
    Other,
}

impl NetBareError {
    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a handshake error
    pub fn handshake(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Handshake {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Create a shutdown error
    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::ConnectionShutdown(msg.into())
    }

    /// Create a certificate generation error
    pub fn cert_generation(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertGeneration {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) | Self::Hpack(_) | Self::Frame(_) => ErrorKind::ProtocolViolation,
            Self::Handshake { .. } | Self::Tls(_) => ErrorKind::HandshakeFailure,
            Self::Io(_) | Self::ConnectionShutdown(_) | Self::SessionNotFound(_) => {
                ErrorKind::Transport
            }
            Self::Backpressure(_) => ErrorKind::Transport,
            Self::CertGeneration { .. } | Self::Config(_) => ErrorKind::Other,
        }
    }
}
