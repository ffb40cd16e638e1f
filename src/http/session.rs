//! Per-exchange HTTP state
//!
//! One physical connection owns an `HttpZygote`. Its root session describes
//! the connection (https, negotiated protocol, HTTP/2 settings); every
//! keep-alive exchange or HTTP/2 stream gets its own `HttpSession` cloned from
//! the root without headers.

use super::protocol::{HttpMethod, HttpProtocol};
use crate::gateway::Direction;
use crate::http2::Http2Settings;
use crate::net::session::random_id;
use std::collections::HashMap;

/// Identity of one logical exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpId {
    /// HTTP/2 stream id, -1 for HTTP/1.x
    pub stream_id: i32,
    pub id: String,
    /// Creation time, unix millis
    pub time: i64,
}

impl HttpId {
    pub fn new(stream_id: i32) -> Self {
        Self {
            stream_id,
            id: random_id(),
            time: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_stream(&self) -> bool {
        self.stream_id >= 0
    }
}

impl Default for HttpId {
    fn default() -> Self {
        Self::new(-1)
    }
}

/// Ordered multi-value header map.
///
/// Names keep the case they arrived with; lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, grouping it under an identical name already present
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    /// Replace every value of `name`
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, vec![value.into()]));
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)?.first().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        let position = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(position).1)
    }

    /// Distinct names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Every (name, value) pair in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(n, values)| values.iter().map(move |v| (n.as_str(), v.as_str())))
    }

    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.iter().collect()
    }
}

/// Mutable parse state of one exchange
#[derive(Debug, Clone, Default)]
pub struct HttpSession {
    pub is_https: bool,
    pub protocol: HttpProtocol,
    pub method: HttpMethod,
    pub path: Option<String>,
    pub request_headers: HeaderMap,
    pub response_headers: HeaderMap,
    pub code: u16,
    pub message: Option<String>,
    /// Length of the header block in the first request buffer
    pub req_body_offset: usize,
    /// Length of the header block in the first response buffer
    pub res_body_offset: usize,

    pub client_settings: Option<Http2Settings>,
    pub peer_settings: Option<Http2Settings>,
    pub request_stream_end: bool,
    pub response_stream_end: bool,
    /// Switched to WebSocket with a 101 response
    pub websocket: bool,
}

impl HttpSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh session inheriting the connection-level attributes only
    pub fn zygote(&self) -> Self {
        Self {
            is_https: self.is_https,
            protocol: self.protocol,
            client_settings: self.client_settings,
            peer_settings: self.peer_settings,
            ..Self::default()
        }
    }

    pub fn stream_end(&self, direction: Direction) -> bool {
        match direction {
            Direction::Request => self.request_stream_end,
            Direction::Response => self.response_stream_end,
        }
    }

    pub fn set_stream_end(&mut self, direction: Direction) {
        match direction {
            Direction::Request => self.request_stream_end = true,
            Direction::Response => self.response_stream_end = true,
        }
    }

    /// Settings announced by the sender of frames flowing in `direction`
    pub fn sender_settings(&self, direction: Direction) -> Option<&Http2Settings> {
        match direction {
            Direction::Request => self.client_settings.as_ref(),
            Direction::Response => self.peer_settings.as_ref(),
        }
    }

    /// Settings announced by the receiver of frames flowing in `direction`
    pub fn receiver_settings(&self, direction: Direction) -> Option<&Http2Settings> {
        self.sender_settings(direction.opposite())
    }

    pub fn headers(&self, direction: Direction) -> &HeaderMap {
        match direction {
            Direction::Request => &self.request_headers,
            Direction::Response => &self.response_headers,
        }
    }

    pub fn headers_mut(&mut self, direction: Direction) -> &mut HeaderMap {
        match direction {
            Direction::Request => &mut self.request_headers,
            Direction::Response => &mut self.response_headers,
        }
    }

    /// Is this a 101 upgrade to WebSocket
    pub fn is_websocket_upgrade(&self) -> bool {
        self.code == 101
            && self
                .response_headers
                .first("Upgrade")
                .map_or(false, |v| v.eq_ignore_ascii_case("websocket"))
    }
}

/// Owner of every exchange on one connection
#[derive(Debug)]
pub struct HttpZygote {
    root_id: HttpId,
    root: Option<HttpSession>,
    sessions: HashMap<HttpId, HttpSession>,
    streams: HashMap<u32, HttpId>,
    active: [HttpId; 2],
}

impl Default for HttpZygote {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpZygote {
    pub fn new() -> Self {
        let root_id = HttpId::new(-1);
        Self {
            active: [root_id.clone(), root_id.clone()],
            root_id,
            root: Some(HttpSession::new()),
            sessions: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    pub fn root_id(&self) -> &HttpId {
        &self.root_id
    }

    /// Connection-level session.
    ///
    /// While the root session is checked out with `take` an empty default is
    /// installed in its place.
    pub fn root(&self) -> &HttpSession {
        match &self.root {
            Some(root) => root,
            None => &EMPTY_SESSION,
        }
    }

    pub fn root_mut(&mut self) -> &mut HttpSession {
        self.root.get_or_insert_with(HttpSession::new)
    }

    /// Get or create the session for `id`, cloned from the root
    pub fn zygote(&mut self, id: &HttpId) -> &mut HttpSession {
        if *id == self.root_id {
            return self.root_mut();
        }
        if !self.sessions.contains_key(id) {
            let session = self.root().zygote();
            self.sessions.insert(id.clone(), session);
        }
        self.sessions
            .entry(id.clone())
            .or_insert_with(HttpSession::new)
    }

    /// Id for an HTTP/2 stream, minting one on first sight
    pub fn stream(&mut self, stream_id: u32) -> HttpId {
        if let Some(id) = self.streams.get(&stream_id) {
            return id.clone();
        }
        let id = HttpId::new(stream_id as i32);
        self.streams.insert(stream_id, id.clone());
        self.zygote(&id);
        id
    }

    pub fn activate(&mut self, direction: Direction, id: HttpId) {
        self.active[direction.index()] = id;
    }

    pub fn active(&self, direction: Direction) -> &HttpId {
        &self.active[direction.index()]
    }

    pub fn session(&self, id: &HttpId) -> Option<&HttpSession> {
        if *id == self.root_id {
            return self.root.as_ref();
        }
        self.sessions.get(id)
    }

    pub fn session_mut(&mut self, id: &HttpId) -> Option<&mut HttpSession> {
        if *id == self.root_id {
            return self.root.as_mut();
        }
        self.sessions.get_mut(id)
    }

    /// Check a session out for exclusive use; pair with `restore`
    pub fn take(&mut self, id: &HttpId) -> Option<HttpSession> {
        if *id == self.root_id {
            return self.root.take();
        }
        self.sessions.remove(id)
    }

    pub fn restore(&mut self, id: HttpId, session: HttpSession) {
        if id == self.root_id {
            self.root = Some(session);
        } else {
            self.sessions.insert(id, session);
        }
    }

    /// Forget a finished exchange. The root session is never removed.
    pub fn remove(&mut self, id: &HttpId) -> Option<HttpSession> {
        if *id == self.root_id {
            return None;
        }
        if id.is_stream() {
            self.streams.remove(&(id.stream_id as u32));
        }
        self.sessions.remove(id)
    }

    /// Live exchanges besides the root
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

lazy_static::lazy_static! {
    static ref EMPTY_SESSION: HttpSession = HttpSession::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map_order_and_lookup() {
        let mut headers = HeaderMap::new();
        headers.add("Host", "example.com");
        headers.add("Accept", "text/html");
        headers.add("Accept", "application/json");
        headers.add("accept", "*/*");

        assert_eq!(headers.len(), 3);
        assert_eq!(headers.first("HOST"), Some("example.com"));
        assert_eq!(
            headers.get("Accept").unwrap(),
            &["text/html".to_string(), "application/json".to_string()]
        );
        assert_eq!(
            headers.pairs(),
            vec![
                ("Host", "example.com"),
                ("Accept", "text/html"),
                ("Accept", "application/json"),
                ("accept", "*/*"),
            ]
        );

        headers.set("Host", "other.com");
        assert_eq!(headers.names().last(), Some("Host"));
        assert_eq!(headers.first("host"), Some("other.com"));
    }

    #[test]
    fn test_zygote_clones_connection_attributes_only() {
        let mut zygote = HttpZygote::new();
        {
            let root = zygote.root_mut();
            root.is_https = true;
            root.protocol = HttpProtocol::Http2;
            root.method = HttpMethod::Get;
            root.request_headers.add("Host", "example.com");
        }

        let id = zygote.stream(3);
        assert_eq!(id.stream_id, 3);
        assert_eq!(zygote.stream(3), id);

        let session = zygote.session(&id).unwrap();
        assert!(session.is_https);
        assert_eq!(session.protocol, HttpProtocol::Http2);
        assert_eq!(session.method, HttpMethod::Unknown);
        assert!(session.request_headers.is_empty());
        assert_eq!(zygote.len(), 1);

        zygote.remove(&id);
        assert!(zygote.is_empty());
        assert_ne!(zygote.stream(3), id);
    }

    #[test]
    fn test_take_and_restore_root() {
        let mut zygote = HttpZygote::new();
        let root_id = zygote.root_id().clone();
        assert_eq!(zygote.active(Direction::Request), &root_id);

        let mut session = zygote.take(&root_id).unwrap();
        assert!(zygote.session(&root_id).is_none());
        session.path = Some("/".to_string());
        zygote.restore(root_id.clone(), session);
        assert_eq!(zygote.root().path.as_deref(), Some("/"));
        assert!(zygote.remove(&root_id).is_none());
    }

    #[test]
    fn test_websocket_upgrade() {
        let mut session = HttpSession::new();
        session.code = 101;
        session.response_headers.add("Upgrade", "WebSocket");
        assert!(session.is_websocket_upgrade());
        session.code = 200;
        assert!(!session.is_websocket_upgrade());
    }
}
