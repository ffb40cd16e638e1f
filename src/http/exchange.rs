//! Request/response view handed to application interceptors

use super::protocol::{HttpMethod, HttpProtocol};
use super::session::{HeaderMap, HttpId, HttpSession};
use super::websocket::WebSocketMessage;
use crate::net::Session;
use std::sync::Arc;

/// One logical HTTP exchange: a keep-alive request/response pair or an
/// HTTP/2 stream.
///
/// Application interceptors run over this context; `chain.process(buf)` is
/// the way to emit bytes toward the tunnel.
#[derive(Debug)]
pub struct HttpExchange {
    pub id: HttpId,
    pub session: HttpSession,
    pub connection: Arc<Session>,
    /// Messages decoded from the current buffer of an upgraded exchange
    pub websocket_messages: Vec<WebSocketMessage>,
}

impl HttpExchange {
    pub fn new(id: HttpId, session: HttpSession, connection: Arc<Session>) -> Self {
        Self {
            id,
            session,
            connection,
            websocket_messages: Vec::new(),
        }
    }

    pub fn id(&self) -> &HttpId {
        &self.id
    }

    /// HTTP/2 stream id, -1 for HTTP/1.x
    pub fn stream_id(&self) -> i32 {
        self.id.stream_id
    }

    pub fn is_https(&self) -> bool {
        self.session.is_https
    }

    pub fn protocol(&self) -> HttpProtocol {
        self.session.protocol
    }

    pub fn method(&self) -> HttpMethod {
        self.session.method
    }

    pub fn path(&self) -> Option<&str> {
        self.session.path.as_deref()
    }

    /// `Host` header, falling back to the SNI/Host seen on the connection
    pub fn host(&self) -> Option<String> {
        self.session
            .request_headers
            .first("Host")
            .map(str::to_string)
            .or_else(|| self.connection.host())
    }

    /// Absolute URL of the request
    pub fn url(&self) -> Option<String> {
        let host = self.host()?;
        let scheme = if self.is_https() { "https" } else { "http" };
        let path = self.path().unwrap_or("/");
        if path.starts_with("http://") || path.starts_with("https://") {
            return Some(path.to_string());
        }
        Some(format!("{}://{}{}", scheme, host, path))
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.session.request_headers
    }

    pub fn request_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.session.request_headers
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.session.response_headers
    }

    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.session.response_headers
    }

    /// Status code, 0 until the response head is parsed
    pub fn code(&self) -> u16 {
        self.session.code
    }

    pub fn message(&self) -> Option<&str> {
        self.session.message.as_deref()
    }

    /// Length of the request head in the first request buffer
    pub fn req_body_offset(&self) -> usize {
        self.session.req_body_offset
    }

    /// Length of the response head in the first response buffer
    pub fn res_body_offset(&self) -> usize {
        self.session.res_body_offset
    }
}
