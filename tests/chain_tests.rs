//! Interceptor chain traversal

use bytes::Bytes;
use netbare::gateway::InterceptorGateway;
use netbare::tunnel::MemoryTunnel;
use netbare::{
    Chain, Direction, Indexed, IndexedInterceptor, Interceptor, Result, Sinks, VirtualGateway,
};
use std::sync::Arc;

/// Records `name:direction` into the shared log and passes the buffer on
struct Stage {
    name: &'static str,
}

impl Interceptor<Vec<String>> for Stage {
    fn intercept(&mut self, chain: &mut Chain<'_, Vec<String>>, buffer: Bytes) -> Result<()> {
        let entry = format!("{}:{}", self.name, chain.direction());
        chain.context().push(entry);
        chain.process(buffer)
    }

    fn on_finished(&mut self, direction: Direction, context: &mut Vec<String>) {
        context.push(format!("{}:finished:{}", self.name, direction));
    }
}

/// Short-circuits straight to the sink
struct Terminal;

impl Interceptor<Vec<String>> for Terminal {
    fn intercept(&mut self, chain: &mut Chain<'_, Vec<String>>, buffer: Bytes) -> Result<()> {
        chain.context().push("terminal".to_string());
        chain.process_final(buffer)
    }
}

/// Holds every buffer back
struct Swallow;

impl Interceptor<Vec<String>> for Swallow {
    fn intercept(&mut self, chain: &mut Chain<'_, Vec<String>>, _buffer: Bytes) -> Result<()> {
        chain.context().push("swallow".to_string());
        Ok(())
    }
}

/// Tags each buffer with its per-direction index
struct Numbered;

impl IndexedInterceptor<Vec<String>> for Numbered {
    fn intercept_indexed(
        &mut self,
        chain: &mut Chain<'_, Vec<String>>,
        buffer: Bytes,
        index: usize,
    ) -> Result<()> {
        let entry = format!("{}#{}", chain.direction(), index);
        chain.context().push(entry);
        chain.process(buffer)
    }
}

fn gateway(
    stages: Vec<Box<dyn Interceptor<Vec<String>>>>,
) -> (InterceptorGateway<Vec<String>>, Arc<MemoryTunnel>, Arc<MemoryTunnel>) {
    let request = Arc::new(MemoryTunnel::new());
    let response = Arc::new(MemoryTunnel::new());
    let sinks = Sinks::new(request.clone(), response.clone());
    (InterceptorGateway::new(Vec::new(), stages, sinks), request, response)
}

// ============================================================================
// Traversal order
// ============================================================================

#[test]
fn test_stages_run_in_order_once() {
    let (mut gateway, request, response) = gateway(vec![
        Box::new(Stage { name: "a" }),
        Box::new(Stage { name: "b" }),
        Box::new(Stage { name: "c" }),
    ]);
    gateway.on_request(Bytes::from_static(b"ping")).unwrap();
    gateway.on_response(Bytes::from_static(b"pong")).unwrap();

    assert_eq!(
        gateway.context(),
        &vec![
            "a:request",
            "b:request",
            "c:request",
            "a:response",
            "b:response",
            "c:response",
        ]
    );
    assert_eq!(request.written(), vec![Bytes::from_static(b"ping")]);
    assert_eq!(response.written(), vec![Bytes::from_static(b"pong")]);
}

#[test]
fn test_process_final_skips_later_stages() {
    let (mut gateway, request, _) = gateway(vec![
        Box::new(Stage { name: "a" }),
        Box::new(Terminal),
        Box::new(Stage { name: "never" }),
    ]);
    gateway.on_request(Bytes::from_static(b"x")).unwrap();

    assert_eq!(gateway.context(), &vec!["a:request", "terminal"]);
    assert_eq!(request.written().len(), 1);
}

#[test]
fn test_pending_stage_keeps_buffer() {
    let (mut gateway, request, _) = gateway(vec![
        Box::new(Swallow),
        Box::new(Stage { name: "never" }),
    ]);
    gateway.on_request(Bytes::from_static(b"x")).unwrap();

    assert_eq!(gateway.context(), &vec!["swallow"]);
    assert!(request.written().is_empty());
}

#[test]
fn test_empty_chain_writes_sink() {
    let (mut gateway, request, response) = gateway(Vec::new());
    gateway.on_request(Bytes::from_static(b"up")).unwrap();
    gateway.on_response(Bytes::from_static(b"down")).unwrap();
    assert_eq!(request.concat(), b"up".to_vec());
    assert_eq!(response.concat(), b"down".to_vec());
}

// ============================================================================
// Indexing and finish
// ============================================================================

#[test]
fn test_indexed_counts_each_direction() {
    let (mut gateway, _, _) = gateway(vec![Box::new(Indexed::new(Numbered))]);
    gateway.on_request(Bytes::from_static(b"1")).unwrap();
    gateway.on_request(Bytes::from_static(b"2")).unwrap();
    gateway.on_response(Bytes::from_static(b"3")).unwrap();
    gateway.on_request(Bytes::from_static(b"4")).unwrap();

    assert_eq!(
        gateway.context(),
        &vec!["request#0", "request#1", "response#0", "request#2"]
    );
}

#[test]
fn test_finish_reaches_every_stage() {
    let (mut gateway, _, _) = gateway(vec![
        Box::new(Stage { name: "a" }),
        Box::new(Swallow),
        Box::new(Stage { name: "b" }),
    ]);
    gateway.on_request_finished();
    gateway.on_response_finished();

    assert_eq!(
        gateway.context(),
        &vec![
            "a:finished:request",
            "b:finished:request",
            "a:finished:response",
            "b:finished:response",
        ]
    );
}
