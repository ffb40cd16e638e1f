//! Split the first buffer of an exchange into head and body

use super::exchange::HttpExchange;
use crate::error::Result;
use crate::gateway::{Chain, Direction, Interceptor, PendingBuffers};
use bytes::Bytes;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Holds bytes until the head is complete, then hands the head and the rest
/// of the buffer to the next stage as separate buffers.
#[derive(Debug, Default)]
pub struct HeaderSeparateInterceptor {
    pending: PendingBuffers,
    head_done: [bool; 2],
}

impl HeaderSeparateInterceptor {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Offset just past the blank line ending the head
pub fn head_length(data: &[u8]) -> Option<usize> {
    data.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|p| p + HEAD_TERMINATOR.len())
}

impl Interceptor<HttpExchange> for HeaderSeparateInterceptor {
    fn intercept(&mut self, chain: &mut Chain<'_, HttpExchange>, buffer: Bytes) -> Result<()> {
        let direction = chain.direction();
        let slot = direction.index();
        if self.head_done[slot] {
            return chain.process(buffer);
        }

        let data = self.pending.merge(direction, buffer);
        match head_length(&data) {
            Some(end) => {
                self.head_done[slot] = true;
                chain.process(data.slice(..end))?;
                if end < data.len() {
                    chain.process(data.slice(end..))?;
                }
                Ok(())
            }
            None => {
                self.pending.pend(direction, data);
                Ok(())
            }
        }
    }

    fn on_finished(&mut self, direction: Direction, _context: &mut HttpExchange) {
        self.head_done[direction.index()] = false;
        self.pending.clear(direction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_length() {
        assert_eq!(head_length(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(head_length(b"GET / HTTP/1.1\r\nHost: a"), None);
        assert_eq!(head_length(b"\r\n\r\n"), Some(4));
    }
}
