//! Per-exchange interceptor container
//!
//! Every logical exchange (keep-alive pair or HTTP/2 stream) gets its own
//! stage list: head separation, head parsing, WebSocket decoding, then one
//! fresh interceptor from each application factory. Buffers that come out of
//! an exchange's chain continue down the connection chain.

use super::exchange::HttpExchange;
use super::gateway::{HttpContext, HttpInterceptorFactory};
use super::header_parse::HeaderParseInterceptor;
use super::header_separate::HeaderSeparateInterceptor;
use super::session::HttpId;
use super::websocket::WebSocketInterceptor;
use crate::error::Result;
use crate::gateway::{finish, Chain, Direction, Indexed, Interceptor, Sinks};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct ExchangeStages {
    stages: Vec<Box<dyn Interceptor<HttpExchange>>>,
    finished: [bool; 2],
}

impl ExchangeStages {
    fn new(factories: &[Arc<HttpInterceptorFactory>]) -> Self {
        let mut stages: Vec<Box<dyn Interceptor<HttpExchange>>> = vec![
            Box::new(HeaderSeparateInterceptor::new()),
            Box::new(Indexed::new(HeaderParseInterceptor)),
            Box::new(WebSocketInterceptor::new()),
        ];
        stages.extend(factories.iter().map(|f| f.create()));
        Self {
            stages,
            finished: [false; 2],
        }
    }
}

/// Routes each buffer to the stage list of the active exchange
pub struct ContainerInterceptor {
    factories: Arc<Vec<Arc<HttpInterceptorFactory>>>,
    exchanges: HashMap<HttpId, ExchangeStages>,
    /// Active HTTP/1 exchange, finished when another one takes over
    current: Option<HttpId>,
}

impl ContainerInterceptor {
    pub fn new(factories: Arc<Vec<Arc<HttpInterceptorFactory>>>) -> Self {
        Self {
            factories,
            exchanges: HashMap::new(),
            current: None,
        }
    }

    /// Exchanges with live interceptor state
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Notify one exchange's stages that `direction` is done
    fn finish_direction(&mut self, context: &mut HttpContext, id: &HttpId, direction: Direction) {
        let stages = match self.exchanges.get_mut(id) {
            Some(stages) if !stages.finished[direction.index()] => stages,
            _ => return,
        };
        stages.finished[direction.index()] = true;
        let session = context.zygote.take(id).unwrap_or_default();
        let mut exchange = HttpExchange::new(id.clone(), session, context.session.clone());
        finish(&mut stages.stages, direction, &mut exchange);
        context.zygote.restore(id.clone(), exchange.session);
    }

    /// Finish an HTTP/2 exchange once both of its streams have ended
    pub fn finish_if_ended(&mut self, context: &mut HttpContext, id: &HttpId) -> bool {
        let ended = context
            .zygote
            .session(id)
            .map_or(false, |s| s.request_stream_end && s.response_stream_end);
        if ended && self.exchanges.contains_key(id) {
            self.finish_exchange(context, id);
            return true;
        }
        false
    }

    /// Finish both directions and forget the exchange
    fn finish_exchange(&mut self, context: &mut HttpContext, id: &HttpId) {
        self.finish_direction(context, id, Direction::Request);
        self.finish_direction(context, id, Direction::Response);
        self.exchanges.remove(id);
        context.zygote.remove(id);
        debug!(
            session = %context.session.id,
            exchange = %id.id,
            stream = id.stream_id,
            "Exchange finished"
        );
    }

    fn run(
        &mut self,
        context: &mut HttpContext,
        sinks: &Sinks,
        direction: Direction,
        id: &HttpId,
        buffer: Bytes,
    ) -> Result<Vec<Bytes>> {
        let factories = &self.factories;
        let stages = self
            .exchanges
            .entry(id.clone())
            .or_insert_with(|| ExchangeStages::new(factories));

        context.zygote.zygote(id);
        let session = context.zygote.take(id).unwrap_or_default();
        let mut exchange = HttpExchange::new(id.clone(), session, context.session.clone());

        let mut out = Vec::new();
        let result =
            Chain::collecting(direction, &mut exchange, &mut stages.stages, sinks, &mut out)
                .process(buffer);
        context.zygote.restore(id.clone(), exchange.session);
        result.map(|_| out)
    }
}

impl Interceptor<HttpContext> for ContainerInterceptor {
    fn intercept(&mut self, chain: &mut Chain<'_, HttpContext>, buffer: Bytes) -> Result<()> {
        let direction = chain.direction();
        if buffer.is_empty() {
            // A stream that ended on a refluxed frame
            chain.process(buffer)?;
            let context = chain.context();
            if context.zygote.root().protocol.is_http2() {
                let id = context.zygote.active(direction).clone();
                self.finish_if_ended(context, &id);
            }
            return Ok(());
        }
        let sinks = chain.sinks();
        let context = chain.context();
        let id = context.zygote.active(direction).clone();
        let http2 = context.zygote.root().protocol.is_http2();

        if !http2 {
            if let Some(previous) = self.current.take() {
                if previous != id {
                    self.finish_exchange(context, &previous);
                }
            }
            self.current = Some(id.clone());
        }

        let out = self.run(context, sinks, direction, &id, buffer)?;
        for buffer in out {
            chain.process(buffer)?;
        }

        if http2 {
            self.finish_if_ended(chain.context(), &id);
        }
        Ok(())
    }

    fn on_finished(&mut self, direction: Direction, context: &mut HttpContext) {
        let ids: Vec<HttpId> = self.exchanges.keys().cloned().collect();
        for id in &ids {
            self.finish_direction(context, id, direction);
        }
        if direction == Direction::Response {
            for id in &ids {
                self.finish_exchange(context, id);
            }
            self.current = None;
        }
    }
}
