//! Byte tunnels
//!
//! A `Tunnel` is the write half of one side of a connection: the proxy side
//! (toward the virtual interface) or the remote side (toward the real server).
//! Writes are queued and drained by the connection task; a closed tunnel
//! silently drops further writes.

pub mod tcp;
pub mod udp;

use crate::error::{NetBareError, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use tcp::TcpVirtualTunnel;
pub use udp::UdpVirtualTunnel;

/// Keeps outbound sockets off the virtual interface.
///
/// Remote sockets created by the tunnels must bypass the VPN route they are
/// serving, or their packets would loop back into the forwarders. A `false`
/// return aborts the connection.
pub trait SocketProtector: Send + Sync {
    fn protect_tcp(&self, socket: &tokio::net::TcpSocket) -> bool;

    fn protect_udp(&self, socket: &tokio::net::UdpSocket) -> bool;
}

/// Write half of a connection side
pub trait Tunnel: Send + Sync {
    /// Queue `buffer` for writing. A no-op once the tunnel is closed.
    fn write(&self, buffer: Bytes) -> Result<()>;

    /// Close the tunnel. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Queue-backed tunnel drained by an async connection task
pub struct ChannelTunnel {
    tx: mpsc::UnboundedSender<Bytes>,
    depth: Arc<AtomicUsize>,
    max_pending: Option<usize>,
    closed: CancellationToken,
}

/// Receiving end of a `ChannelTunnel`
pub struct TunnelReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
    depth: Arc<AtomicUsize>,
    closed: CancellationToken,
}

impl ChannelTunnel {
    /// Create a tunnel and its receiver.
    ///
    /// `max_pending` caps the number of queued buffers; `None` is unbounded.
    pub fn pair(max_pending: Option<usize>) -> (Arc<Self>, TunnelReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let closed = CancellationToken::new();
        let tunnel = Arc::new(Self {
            tx,
            depth: depth.clone(),
            max_pending,
            closed: closed.clone(),
        });
        (tunnel, TunnelReceiver { rx, depth, closed })
    }

    /// Buffers written but not yet drained
    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

impl Tunnel for ChannelTunnel {
    fn write(&self, buffer: Bytes) -> Result<()> {
        if self.closed.is_cancelled() || buffer.is_empty() {
            return Ok(());
        }
        if let Some(cap) = self.max_pending {
            if self.depth.load(Ordering::Acquire) >= cap {
                return Err(NetBareError::Backpressure(cap));
            }
        }
        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(buffer).is_err() {
            // Receiver is gone, the connection task has exited
            self.depth.fetch_sub(1, Ordering::AcqRel);
            self.closed.cancel();
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl TunnelReceiver {
    /// Next queued buffer, `None` once the tunnel is closed and drained
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            buffer = self.rx.recv() => {
                if buffer.is_some() {
                    self.depth.fetch_sub(1, Ordering::AcqRel);
                }
                buffer
            }
            _ = self.closed.cancelled() => self.try_recv(),
        }
    }

    /// Drain without waiting
    pub fn try_recv(&mut self) -> Option<Bytes> {
        let buffer = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(buffer)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the tunnel closes
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// In-memory tunnel that records every write
#[derive(Debug, Default)]
pub struct MemoryTunnel {
    written: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl MemoryTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every buffer written so far
    pub fn written(&self) -> Vec<Bytes> {
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Remove and return everything written so far
    pub fn take(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.written.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// All writes joined into one buffer
    pub fn concat(&self) -> Vec<u8> {
        self.written().iter().flat_map(|b| b.iter().copied()).collect()
    }
}

impl Tunnel for MemoryTunnel {
    fn write(&self, buffer: Bytes) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(buffer);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_tunnel_fifo() {
        let (tunnel, mut rx) = ChannelTunnel::pair(None);
        tunnel.write(Bytes::from_static(b"one")).unwrap();
        tunnel.write(Bytes::from_static(b"two")).unwrap();
        assert_eq!(tunnel.pending(), 2);

        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"one")));
        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"two")));
        assert_eq!(tunnel.pending(), 0);
    }

    #[tokio::test]
    async fn test_closed_tunnel_drops_writes() {
        let (tunnel, mut rx) = ChannelTunnel::pair(None);
        tunnel.write(Bytes::from_static(b"kept")).unwrap();
        tunnel.close();
        tunnel.close();
        tunnel.write(Bytes::from_static(b"dropped")).unwrap();

        assert!(tunnel.is_closed());
        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"kept")));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_backpressure_cap() {
        let (tunnel, _rx) = ChannelTunnel::pair(Some(2));
        tunnel.write(Bytes::from_static(b"a")).unwrap();
        tunnel.write(Bytes::from_static(b"b")).unwrap();
        match tunnel.write(Bytes::from_static(b"c")) {
            Err(NetBareError::Backpressure(2)) => {}
            other => panic!("Expected Backpressure, got {:?}", other),
        }
    }

    #[test]
    fn test_memory_tunnel_records() {
        let tunnel = MemoryTunnel::new();
        tunnel.write(Bytes::from_static(b"ab")).unwrap();
        tunnel.write(Bytes::from_static(b"c")).unwrap();
        assert_eq!(tunnel.concat(), b"abc");
        tunnel.close();
        tunnel.write(Bytes::from_static(b"d")).unwrap();
        assert_eq!(tunnel.take().len(), 2);
        assert!(tunnel.written().is_empty());
    }
}
