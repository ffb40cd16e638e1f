//! Plain HTTP/1.1 through the full HTTP gateway

use bytes::Bytes;
use netbare::http::WebSocketMessage;
use netbare::tunnel::MemoryTunnel;
use netbare::{
    BypassReason, Chain, Direction, HostPolicy, HttpExchange, HttpMethod,
    HttpVirtualGatewayFactory, Interceptor, InterceptorFactory, Policy, PolicyGateway, Protocol,
    Result, Session, Sinks, SslWhiteList, VirtualGateway, VirtualGatewayFactory,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

const REMOTE: IpAddr = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));

#[derive(Debug, Clone)]
struct Seen {
    id: String,
    method: HttpMethod,
    path: Option<String>,
    host: Option<String>,
    header_names: Vec<String>,
    code: Option<u16>,
}

/// Records each exchange's parsed request and response heads
struct Recorder {
    log: Arc<Mutex<Vec<Seen>>>,
    slot: Option<usize>,
}

impl Interceptor<HttpExchange> for Recorder {
    fn intercept(&mut self, chain: &mut Chain<'_, HttpExchange>, buffer: Bytes) -> Result<()> {
        let direction = chain.direction();
        let exchange = chain.context();
        let mut log = self.log.lock().unwrap();
        match (direction, self.slot) {
            (Direction::Request, None) => {
                log.push(Seen {
                    id: exchange.id().id.clone(),
                    method: exchange.method(),
                    path: exchange.path().map(str::to_string),
                    host: exchange.host(),
                    header_names: exchange
                        .request_headers()
                        .names()
                        .map(str::to_string)
                        .collect(),
                    code: None,
                });
                self.slot = Some(log.len() - 1);
            }
            (Direction::Response, Some(slot)) if log[slot].code.is_none() => {
                log[slot].code = Some(exchange.code());
            }
            _ => {}
        }
        drop(log);
        chain.process(buffer)
    }
}

struct RecorderFactory {
    log: Arc<Mutex<Vec<Seen>>>,
}

impl InterceptorFactory<HttpExchange> for RecorderFactory {
    fn create(&self) -> Box<dyn Interceptor<HttpExchange>> {
        Box::new(Recorder {
            log: self.log.clone(),
            slot: None,
        })
    }
}

struct Fixture {
    gateway: Box<dyn VirtualGateway>,
    log: Arc<Mutex<Vec<Seen>>>,
    request: Arc<MemoryTunnel>,
    response: Arc<MemoryTunnel>,
}

fn fixture(host: Option<&str>, whitelist: SslWhiteList) -> Fixture {
    let log = Arc::new(Mutex::new(Vec::new()));
    let factory = HttpVirtualGatewayFactory::new(
        None,
        Arc::new(whitelist),
        vec![Arc::new(RecorderFactory { log: log.clone() })],
    );
    let session = Arc::new(Session::new(Protocol::Tcp, 41000, 80, REMOTE));
    if let Some(host) = host {
        session.set_host(host);
    }
    let request = Arc::new(MemoryTunnel::new());
    let response = Arc::new(MemoryTunnel::new());
    let gateway = factory.create(session, Sinks::new(request.clone(), response.clone()));
    Fixture {
        gateway,
        log,
        request,
        response,
    }
}

// ============================================================================
// Single exchange
// ============================================================================

#[test]
fn test_simple_get_is_parsed() {
    let mut f = fixture(Some("example.com"), SslWhiteList::new());
    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    f.gateway.on_request(Bytes::from_static(request)).unwrap();
    f.gateway
        .on_response(Bytes::from_static(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        ))
        .unwrap();

    let log = f.log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].method, HttpMethod::Get);
    assert_eq!(log[0].path.as_deref(), Some("/"));
    assert_eq!(log[0].host.as_deref(), Some("example.com"));
    assert_eq!(log[0].code, Some(200));

    assert_eq!(f.request.concat(), request.to_vec());
    assert_eq!(
        f.response.concat(),
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()
    );
}

#[test]
fn test_policy_gateway_discovers_host_for_http_pipeline() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let factory = HttpVirtualGatewayFactory::new(
        None,
        Arc::new(SslWhiteList::new()),
        vec![Arc::new(RecorderFactory { log: log.clone() })],
    );
    let session = Arc::new(Session::new(Protocol::Tcp, 41001, 80, REMOTE));
    let request = Arc::new(MemoryTunnel::new());
    let response = Arc::new(MemoryTunnel::new());
    let sinks = Sinks::new(request.clone(), response.clone());
    let inner = factory.create(session.clone(), sinks.clone());
    let mut gateway = PolicyGateway::new(
        session.clone(),
        sinks,
        Arc::new(HostPolicy::default()),
        inner,
    );

    gateway
        .on_request(Bytes::from_static(
            b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
        ))
        .unwrap();

    assert_eq!(gateway.policy(), Policy::Allowed);
    assert_eq!(session.host().as_deref(), Some("example.com"));
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].method, HttpMethod::Get);
    assert_eq!(log[0].path.as_deref(), Some("/"));
    assert_eq!(
        request.concat(),
        b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec()
    );
}

// ============================================================================
// Keep-alive demultiplexing
// ============================================================================

#[test]
fn test_keep_alive_pairs_become_separate_exchanges() {
    let mut f = fixture(Some("example.com"), SslWhiteList::new());
    let pairs: [(&[u8], &[u8]); 3] = [
        (
            b"GET /one HTTP/1.1\r\nHost: example.com\r\nX-First: 1\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        ),
        (
            b"GET /two HTTP/1.1\r\nHost: example.com\r\nX-Second: 2\r\n\r\n",
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
        ),
        (
            b"POST /three HTTP/1.1\r\nHost: example.com\r\nX-Third: 3\r\nContent-Length: 0\r\n\r\n",
            b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n",
        ),
    ];
    for (request, response) in pairs {
        f.gateway.on_request(Bytes::copy_from_slice(request)).unwrap();
        f.gateway.on_response(Bytes::copy_from_slice(response)).unwrap();
    }

    let log = f.log.lock().unwrap();
    assert_eq!(log.len(), 3);

    let mut ids: Vec<&str> = log.iter().map(|s| s.id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    assert_eq!(log[0].path.as_deref(), Some("/one"));
    assert_eq!(log[1].path.as_deref(), Some("/two"));
    assert_eq!(log[2].path.as_deref(), Some("/three"));
    assert_eq!(log[2].method, HttpMethod::Post);
    assert_eq!(
        log.iter().map(|s| s.code).collect::<Vec<_>>(),
        vec![Some(200), Some(404), Some(201)]
    );

    // Headers never leak between exchanges
    assert_eq!(log[0].header_names, vec!["Host", "X-First"]);
    assert_eq!(log[1].header_names, vec!["Host", "X-Second"]);
    assert_eq!(
        log[2].header_names,
        vec!["Host", "X-Third", "Content-Length"]
    );

    let upstream = String::from_utf8(f.request.concat()).unwrap();
    let one = upstream.find("GET /one").unwrap();
    let two = upstream.find("GET /two").unwrap();
    let three = upstream.find("POST /three").unwrap();
    assert!(one < two && two < three);
}

// ============================================================================
// WebSocket upgrade
// ============================================================================

/// Records the WebSocket messages decoded for each buffer
struct FrameRecorder {
    log: Arc<Mutex<Vec<(Direction, WebSocketMessage)>>>,
}

impl Interceptor<HttpExchange> for FrameRecorder {
    fn intercept(&mut self, chain: &mut Chain<'_, HttpExchange>, buffer: Bytes) -> Result<()> {
        let direction = chain.direction();
        let mut log = self.log.lock().unwrap();
        for message in &chain.context().websocket_messages {
            log.push((direction, message.clone()));
        }
        drop(log);
        chain.process(buffer)
    }
}

struct FrameRecorderFactory {
    log: Arc<Mutex<Vec<(Direction, WebSocketMessage)>>>,
}

impl InterceptorFactory<HttpExchange> for FrameRecorderFactory {
    fn create(&self) -> Box<dyn Interceptor<HttpExchange>> {
        Box::new(FrameRecorder {
            log: self.log.clone(),
        })
    }
}

const UPGRADE_REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
const UPGRADE_RESPONSE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";

#[test]
fn test_websocket_frames_decoded_after_upgrade() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let factory = HttpVirtualGatewayFactory::new(
        None,
        Arc::new(SslWhiteList::new()),
        vec![Arc::new(FrameRecorderFactory { log: log.clone() })],
    );
    let session = Arc::new(Session::new(Protocol::Tcp, 41002, 80, REMOTE));
    session.set_host("example.com");
    let request = Arc::new(MemoryTunnel::new());
    let response = Arc::new(MemoryTunnel::new());
    let mut gateway = factory.create(session, Sinks::new(request.clone(), response.clone()));

    // Server text "Hi" rides in the same buffer as the 101 head
    let mut upgrade = UPGRADE_RESPONSE.to_vec();
    upgrade.extend_from_slice(&[0x81, 0x02, b'H', b'i']);
    // Masked client "Hello", split mid-frame
    let hello: &[u8] = &[
        0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
    ];
    let close: &[u8] = &[0x88, 0x02, 0x03, 0xe8];

    gateway.on_request(Bytes::from_static(UPGRADE_REQUEST)).unwrap();
    gateway.on_response(Bytes::from(upgrade.clone())).unwrap();
    gateway.on_request(Bytes::copy_from_slice(&hello[..4])).unwrap();
    gateway.on_request(Bytes::copy_from_slice(&hello[4..])).unwrap();
    gateway.on_response(Bytes::copy_from_slice(close)).unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            (Direction::Response, WebSocketMessage::Text("Hi".into())),
            (Direction::Request, WebSocketMessage::Text("Hello".into())),
            (
                Direction::Response,
                WebSocketMessage::Close {
                    code: 1000,
                    reason: String::new()
                }
            ),
        ]
    );

    let mut upstream = UPGRADE_REQUEST.to_vec();
    upstream.extend_from_slice(hello);
    assert_eq!(request.concat(), upstream);
    upgrade.extend_from_slice(close);
    assert_eq!(response.concat(), upgrade);
}

#[test]
fn test_websocket_frames_ignored_without_upgrade() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let factory = HttpVirtualGatewayFactory::new(
        None,
        Arc::new(SslWhiteList::new()),
        vec![Arc::new(FrameRecorderFactory { log: log.clone() })],
    );
    let session = Arc::new(Session::new(Protocol::Tcp, 41003, 80, REMOTE));
    session.set_host("example.com");
    let request = Arc::new(MemoryTunnel::new());
    let response = Arc::new(MemoryTunnel::new());
    let mut gateway = factory.create(session, Sinks::new(request, response.clone()));

    gateway.on_request(Bytes::from_static(UPGRADE_REQUEST)).unwrap();
    // Frame-shaped body on a plain 200 is just body
    let body = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\n\x81\x02Hi";
    gateway.on_response(Bytes::from_static(body)).unwrap();

    assert!(log.lock().unwrap().is_empty());
    assert_eq!(response.concat(), body.to_vec());
}

// ============================================================================
// Connections left alone
// ============================================================================

#[test]
fn test_connection_without_host_is_not_intercepted() {
    let mut f = fixture(None, SslWhiteList::new());
    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    f.gateway.on_request(Bytes::from_static(request)).unwrap();
    assert!(f.log.lock().unwrap().is_empty());
    assert_eq!(f.request.concat(), request.to_vec());
}

#[test]
fn test_whitelisted_peer_is_not_intercepted() {
    let whitelist = SslWhiteList::new();
    whitelist.add(REMOTE.to_string(), BypassReason::UserConfigured);
    let mut f = fixture(Some("example.com"), whitelist);
    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    f.gateway.on_request(Bytes::from_static(request)).unwrap();
    f.gateway
        .on_response(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"))
        .unwrap();
    assert!(f.log.lock().unwrap().is_empty());
    assert_eq!(f.request.concat(), request.to_vec());
    assert_eq!(f.response.concat(), b"HTTP/1.1 200 OK\r\n\r\n".to_vec());
}

#[test]
fn test_non_http_payload_passes_through() {
    let mut f = fixture(Some("example.com"), SslWhiteList::new());
    f.gateway.on_request(Bytes::from_static(b"\x00\x01binary")).unwrap();
    assert!(f.log.lock().unwrap().is_empty());
    assert_eq!(f.request.concat(), b"\x00\x01binary".to_vec());
}
