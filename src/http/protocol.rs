//! HTTP protocol and method tokens

use std::fmt;

/// Application protocol carried by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HttpProtocol {
    #[default]
    Unknown,
    Http10,
    Http11,
    Spdy3,
    Http2,
    /// HTTP/2 without ALPN, connection preface sent in the clear
    H2PriorKnowledge,
    Quic,
}

impl HttpProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpProtocol::Unknown => "unknown",
            HttpProtocol::Http10 => "HTTP/1.0",
            HttpProtocol::Http11 => "HTTP/1.1",
            HttpProtocol::Spdy3 => "spdy/3.1",
            HttpProtocol::Http2 => "h2",
            HttpProtocol::H2PriorKnowledge => "h2_prior_knowledge",
            HttpProtocol::Quic => "quic",
        }
    }

    /// Case-insensitive parse, `Unknown` for anything unrecognised
    pub fn parse(token: &str) -> Self {
        [
            HttpProtocol::Http10,
            HttpProtocol::Http11,
            HttpProtocol::H2PriorKnowledge,
            HttpProtocol::Http2,
            HttpProtocol::Spdy3,
            HttpProtocol::Quic,
        ]
        .into_iter()
        .find(|p| p.as_str().eq_ignore_ascii_case(token))
        .unwrap_or(HttpProtocol::Unknown)
    }

    /// ALPN identifier, for the protocols negotiated that way
    pub fn from_alpn(alpn: &[u8]) -> Option<Self> {
        match alpn {
            b"h2" => Some(HttpProtocol::Http2),
            b"http/1.1" => Some(HttpProtocol::Http11),
            _ => None,
        }
    }

    pub fn is_http2(&self) -> bool {
        matches!(self, HttpProtocol::Http2)
    }
}

impl fmt::Display for HttpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HttpMethod {
    #[default]
    Unknown,
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Trace,
    Connect,
    Patch,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 9] = [
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Delete,
        HttpMethod::Head,
        HttpMethod::Options,
        HttpMethod::Trace,
        HttpMethod::Connect,
        HttpMethod::Patch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Unknown => "UNKNOWN",
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Patch => "PATCH",
        }
    }

    /// Exact, case-sensitive parse
    pub fn parse(token: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == token)
            .unwrap_or(HttpMethod::Unknown)
    }

    /// Does `data` start with a known method token
    pub fn starts_request(data: &[u8]) -> bool {
        Self::ALL
            .iter()
            .any(|m| data.starts_with(m.as_str().as_bytes()))
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First bytes of every method token
pub fn is_method_letter(byte: u8) -> bool {
    matches!(byte, b'G' | b'H' | b'P' | b'D' | b'O' | b'T' | b'C')
}
