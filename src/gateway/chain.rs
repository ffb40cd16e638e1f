//! Interceptor chain
//!
//! One generic pipeline serves both directions. A stage receives a `Chain`
//! positioned after itself and must do exactly one of:
//!
//! - `chain.process(buf)` - hand the buffer to the next stage
//! - `chain.process_final(buf)` - skip the remaining stages and hit the sink
//! - nothing - keep the buffer (pending) and return
//!
//! Once every stage has run, the buffer lands in the terminal sink exactly once.

use crate::error::Result;
use crate::tunnel::Tunnel;
use bytes::Bytes;
use std::sync::Arc;

/// Flow direction of a buffer.
///
/// `Request` travels from the virtual interface toward the remote server,
/// `Response` from the remote server back to the virtual interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Request => Direction::Response,
            Direction::Response => Direction::Request,
        }
    }

    /// Stable slot for per-direction arrays
    pub fn index(self) -> usize {
        match self {
            Direction::Request => 0,
            Direction::Response => 1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Request => write!(f, "request"),
            Direction::Response => write!(f, "response"),
        }
    }
}

/// Terminal sinks of a connection
#[derive(Clone)]
pub struct Sinks {
    /// Toward the remote server
    pub request: Arc<dyn Tunnel>,
    /// Toward the virtual interface
    pub response: Arc<dyn Tunnel>,
}

impl Sinks {
    pub fn new(request: Arc<dyn Tunnel>, response: Arc<dyn Tunnel>) -> Self {
        Self { request, response }
    }

    pub fn sink(&self, direction: Direction) -> &Arc<dyn Tunnel> {
        match direction {
            Direction::Request => &self.request,
            Direction::Response => &self.response,
        }
    }
}

/// A pipeline stage over a connection context `C`
pub trait Interceptor<C>: Send {
    fn intercept(&mut self, chain: &mut Chain<'_, C>, buffer: Bytes) -> Result<()>;

    /// No more data will arrive in `direction` for the current exchange
    fn on_finished(&mut self, _direction: Direction, _context: &mut C) {}
}

/// Cursor over the stages that have not yet seen a buffer
pub struct Chain<'a, C> {
    direction: Direction,
    context: &'a mut C,
    stages: &'a mut [Box<dyn Interceptor<C>>],
    sinks: &'a Sinks,
    collect: Option<&'a mut Vec<Bytes>>,
    index: usize,
    tag: Option<&'a str>,
}

impl<'a, C> Chain<'a, C> {
    pub fn new(
        direction: Direction,
        context: &'a mut C,
        stages: &'a mut [Box<dyn Interceptor<C>>],
        sinks: &'a Sinks,
    ) -> Self {
        Self {
            direction,
            context,
            stages,
            sinks,
            collect: None,
            index: 0,
            tag: None,
        }
    }

    /// A chain whose terminal step appends to `out` instead of writing a sink.
    ///
    /// Used for nested chains whose output re-enters an outer chain.
    pub fn collecting(
        direction: Direction,
        context: &'a mut C,
        stages: &'a mut [Box<dyn Interceptor<C>>],
        sinks: &'a Sinks,
        out: &'a mut Vec<Bytes>,
    ) -> Self {
        Self {
            collect: Some(out),
            ..Self::new(direction, context, stages, sinks)
        }
    }

    /// Thread a tag value through every stage of this traversal
    pub fn with_tag(mut self, tag: &'a str) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn context(&mut self) -> &mut C {
        &mut *self.context
    }

    pub fn sinks(&self) -> &'a Sinks {
        self.sinks
    }

    /// Position of the next stage in the full stage list
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tag(&self) -> Option<&'a str> {
        self.tag
    }

    /// Run the next stage, or the terminal step when none remain
    pub fn process(&mut self, buffer: Bytes) -> Result<()> {
        match self.stages.split_first_mut() {
            Some((stage, rest)) => {
                let mut next = Chain {
                    direction: self.direction,
                    context: &mut *self.context,
                    stages: rest,
                    sinks: self.sinks,
                    collect: self.collect.as_deref_mut(),
                    index: self.index + 1,
                    tag: self.tag,
                };
                stage.intercept(&mut next, buffer)
            }
            None => self.process_final(buffer),
        }
    }

    /// Skip the remaining stages
    pub fn process_final(&mut self, buffer: Bytes) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        match self.collect.as_deref_mut() {
            Some(out) => {
                out.push(buffer);
                Ok(())
            }
            None => self.sinks.sink(self.direction).write(buffer),
        }
    }

    /// The remaining stages, reborrowed for buffers travelling in `direction`.
    ///
    /// The turned chain always ends at the sink of `direction`, even when this
    /// one collects.
    pub fn toward(&mut self, direction: Direction) -> Chain<'_, C> {
        Chain {
            direction,
            context: &mut *self.context,
            stages: &mut *self.stages,
            sinks: self.sinks,
            collect: None,
            index: self.index,
            tag: self.tag,
        }
    }

    /// Write straight to one of the connection sinks, bypassing any stage
    pub fn write_sink(&self, direction: Direction, buffer: Bytes) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.sinks.sink(direction).write(buffer)
    }
}

/// Notify every stage, in order, that `direction` has finished
pub fn finish<C>(stages: &mut [Box<dyn Interceptor<C>>], direction: Direction, context: &mut C) {
    for stage in stages.iter_mut() {
        stage.on_finished(direction, context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::MemoryTunnel;

    struct Recorder {
        name: &'static str,
    }

    impl Interceptor<Vec<String>> for Recorder {
        fn intercept(&mut self, chain: &mut Chain<'_, Vec<String>>, buffer: Bytes) -> Result<()> {
            let entry = format!("{}:{}", self.name, chain.direction());
            chain.context().push(entry);
            chain.process(buffer)
        }
    }

    struct Shortcut;

    impl Interceptor<Vec<String>> for Shortcut {
        fn intercept(&mut self, chain: &mut Chain<'_, Vec<String>>, buffer: Bytes) -> Result<()> {
            chain.context().push("shortcut".to_string());
            chain.process_final(buffer)
        }
    }

    fn sinks() -> (Arc<MemoryTunnel>, Arc<MemoryTunnel>, Sinks) {
        let request = Arc::new(MemoryTunnel::new());
        let response = Arc::new(MemoryTunnel::new());
        let sinks = Sinks::new(request.clone(), response.clone());
        (request, response, sinks)
    }

    #[test]
    fn test_stages_run_in_order_then_sink() {
        let (request, response, sinks) = sinks();
        let mut stages: Vec<Box<dyn Interceptor<Vec<String>>>> = vec![
            Box::new(Recorder { name: "a" }),
            Box::new(Recorder { name: "b" }),
        ];
        let mut log = Vec::new();

        Chain::new(Direction::Response, &mut log, &mut stages, &sinks)
            .process(Bytes::from_static(b"data"))
            .unwrap();

        assert_eq!(log, vec!["a:response", "b:response"]);
        assert_eq!(response.written(), vec![Bytes::from_static(b"data")]);
        assert!(request.written().is_empty());
    }

    #[test]
    fn test_process_final_skips_remaining() {
        let (request, _response, sinks) = sinks();
        let mut stages: Vec<Box<dyn Interceptor<Vec<String>>>> = vec![
            Box::new(Shortcut),
            Box::new(Recorder { name: "never" }),
        ];
        let mut log = Vec::new();

        Chain::new(Direction::Request, &mut log, &mut stages, &sinks)
            .process(Bytes::from_static(b"x"))
            .unwrap();

        assert_eq!(log, vec!["shortcut"]);
        assert_eq!(request.written().len(), 1);
    }

    #[test]
    fn test_collecting_terminal() {
        let (request, _response, sinks) = sinks();
        let mut stages: Vec<Box<dyn Interceptor<Vec<String>>>> =
            vec![Box::new(Recorder { name: "a" })];
        let mut log = Vec::new();
        let mut out = Vec::new();

        Chain::collecting(Direction::Request, &mut log, &mut stages, &sinks, &mut out)
            .process(Bytes::from_static(b"y"))
            .unwrap();

        assert_eq!(out, vec![Bytes::from_static(b"y")]);
        assert!(request.written().is_empty());
    }

    #[test]
    fn test_empty_buffer_never_reaches_sink() {
        let (request, _response, sinks) = sinks();
        let mut stages: Vec<Box<dyn Interceptor<Vec<String>>>> = Vec::new();
        let mut log = Vec::new();
        Chain::new(Direction::Request, &mut log, &mut stages, &sinks)
            .process(Bytes::new())
            .unwrap();
        assert!(request.written().is_empty());
    }

    struct Echo;

    impl Interceptor<Vec<String>> for Echo {
        fn intercept(&mut self, chain: &mut Chain<'_, Vec<String>>, buffer: Bytes) -> Result<()> {
            let back = chain.direction().opposite();
            chain.process(buffer)?;
            chain.toward(back).process(Bytes::from_static(b"echo"))
        }
    }

    #[test]
    fn test_turned_chain_runs_remaining_stages_other_way() {
        let (request, response, sinks) = sinks();
        let mut stages: Vec<Box<dyn Interceptor<Vec<String>>>> =
            vec![Box::new(Echo), Box::new(Recorder { name: "b" })];
        let mut log = Vec::new();

        Chain::new(Direction::Response, &mut log, &mut stages, &sinks)
            .process(Bytes::from_static(b"data"))
            .unwrap();

        assert_eq!(log, vec!["b:response", "b:request"]);
        assert_eq!(response.written(), vec![Bytes::from_static(b"data")]);
        assert_eq!(request.written(), vec![Bytes::from_static(b"echo")]);
    }

    #[test]
    fn test_direction_helpers() {
        assert_eq!(Direction::Request.opposite(), Direction::Response);
        assert_eq!(Direction::Response.index(), 1);
    }
}
