//! Indexed and merge-capable stage helpers

use super::chain::{Chain, Direction, Interceptor};
use crate::error::Result;
use bytes::{Bytes, BytesMut};

/// A stage that wants the zero-based sequence number of each buffer.
///
/// The number counts non-empty buffers per direction and restarts at 0 after
/// a finished callback for that direction.
pub trait IndexedInterceptor<C>: Send {
    fn intercept_indexed(
        &mut self,
        chain: &mut Chain<'_, C>,
        buffer: Bytes,
        index: usize,
    ) -> Result<()>;

    fn on_indexed_finished(&mut self, _direction: Direction, _context: &mut C) {}
}

/// Adapter turning an `IndexedInterceptor` into a plain `Interceptor`
#[derive(Debug, Default)]
pub struct Indexed<T> {
    inner: T,
    counters: [usize; 2],
}

impl<T> Indexed<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            counters: [0; 2],
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<C, T> Interceptor<C> for Indexed<T>
where
    T: IndexedInterceptor<C>,
{
    fn intercept(&mut self, chain: &mut Chain<'_, C>, buffer: Bytes) -> Result<()> {
        let slot = chain.direction().index();
        let index = self.counters[slot];
        if !buffer.is_empty() {
            self.counters[slot] += 1;
        }
        self.inner.intercept_indexed(chain, buffer, index)
    }

    fn on_finished(&mut self, direction: Direction, context: &mut C) {
        self.counters[direction.index()] = 0;
        self.inner.on_indexed_finished(direction, context);
    }
}

/// Per-direction holding area for partial data (TLS records, HTTP/2 frames)
#[derive(Debug, Default)]
pub struct PendingBuffers {
    buffers: [Vec<Bytes>; 2],
}

impl PendingBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pend(&mut self, direction: Direction, buffer: Bytes) {
        if !buffer.is_empty() {
            self.buffers[direction.index()].push(buffer);
        }
    }

    pub fn is_empty(&self, direction: Direction) -> bool {
        self.buffers[direction.index()].is_empty()
    }

    /// Concatenate everything pended for `direction` with `buffer`, then clear
    pub fn merge(&mut self, direction: Direction, buffer: Bytes) -> Bytes {
        let queued = std::mem::take(&mut self.buffers[direction.index()]);
        if queued.is_empty() {
            return buffer;
        }
        let total = queued.iter().map(Bytes::len).sum::<usize>() + buffer.len();
        let mut merged = BytesMut::with_capacity(total);
        for part in &queued {
            merged.extend_from_slice(part);
        }
        merged.extend_from_slice(&buffer);
        merged.freeze()
    }

    pub fn clear(&mut self, direction: Direction) {
        self.buffers[direction.index()].clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::chain::Sinks;
    use crate::tunnel::MemoryTunnel;
    use std::sync::Arc;

    struct Seen;

    impl IndexedInterceptor<Vec<usize>> for Seen {
        fn intercept_indexed(
            &mut self,
            chain: &mut Chain<'_, Vec<usize>>,
            buffer: Bytes,
            index: usize,
        ) -> Result<()> {
            chain.context().push(index);
            chain.process(buffer)
        }
    }

    #[test]
    fn test_index_resets_on_finish() {
        let tunnel = Arc::new(MemoryTunnel::new());
        let sinks = Sinks::new(tunnel.clone(), tunnel.clone());
        let mut stages: Vec<Box<dyn Interceptor<Vec<usize>>>> =
            vec![Box::new(Indexed::new(Seen))];
        let mut seen = Vec::new();

        for _ in 0..3 {
            Chain::new(Direction::Request, &mut seen, &mut stages, &sinks)
                .process(Bytes::from_static(b"a"))
                .unwrap();
        }
        // Empty buffers are not counted
        Chain::new(Direction::Request, &mut seen, &mut stages, &sinks)
            .process(Bytes::new())
            .unwrap();
        super::super::chain::finish(&mut stages, Direction::Request, &mut seen);
        Chain::new(Direction::Request, &mut seen, &mut stages, &sinks)
            .process(Bytes::from_static(b"b"))
            .unwrap();

        assert_eq!(seen, vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_pending_merge_clears_queue() {
        let mut pending = PendingBuffers::new();
        pending.pend(Direction::Request, Bytes::from_static(b"ab"));
        pending.pend(Direction::Request, Bytes::from_static(b"cd"));
        assert!(pending.is_empty(Direction::Response));

        let merged = pending.merge(Direction::Request, Bytes::from_static(b"ef"));
        assert_eq!(&merged[..], b"abcdef");
        assert!(pending.is_empty(Direction::Request));

        let untouched = pending.merge(Direction::Request, Bytes::from_static(b"g"));
        assert_eq!(&untouched[..], b"g");
    }
}
