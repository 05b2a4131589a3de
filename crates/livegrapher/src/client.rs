//! Per-connection state: the subscription bitset, the outbound write queue,
//! and the non-blocking read/write primitives the reactor drives.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
};

use mio::net::TcpStream;
use tracing::debug;

use crate::protocol::{DatasetId, MAX_DATASETS};

/// Outcome of a single best-effort, non-blocking write attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Some (possibly all) queued bytes were accepted by the kernel.
    Progressed,
    /// The socket isn't writable right now; not an error.
    WouldBlock,
    /// The connection is dead and should be dropped.
    Failed,
}

/// Outcome of a single non-blocking 1-byte read attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadByteOutcome {
    Got(u8),
    WouldBlock,
    Closed,
    Failed,
}

/// A connected client: its socket, which dataset ids it wants pushed to it,
/// and the bytes still waiting to be flushed to the kernel.
pub struct ClientConn {
    stream: TcpStream,
    peer_addr: SocketAddr,
    subscriptions: u64,
    write_queue: VecDeque<u8>,
    /// 0 means unbounded. See `EngineOptions::max_queue_bytes_per_client`.
    max_queue_bytes: usize,
    /// True while we're in the middle of a contiguous run of dropped
    /// frames, so we log once per episode instead of once per frame.
    dropping: bool,
    /// True while WRITABLE interest is currently registered with the
    /// reactor's `Poll`. Invariant: `write_armed == has_pending_write()`
    /// right after `sync_write_interest` runs; it can lag by up to one
    /// reactor iteration in between.
    write_armed: bool,
}

impl ClientConn {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, max_queue_bytes: usize) -> Self {
        Self {
            stream,
            peer_addr,
            subscriptions: 0,
            write_queue: VecDeque::new(),
            max_queue_bytes,
            dropping: false,
            write_armed: false,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    #[inline]
    pub fn is_subscribed(&self, id: DatasetId) -> bool {
        self.subscriptions & Self::bit(id) != 0
    }

    /// Idempotent: subscribing twice or unsubscribing an unsubscribed id is
    /// a no-op.
    #[inline]
    pub fn set_subscribed(&mut self, id: DatasetId, subscribed: bool) {
        if subscribed {
            self.subscriptions |= Self::bit(id);
        } else {
            self.subscriptions &= !Self::bit(id);
        }
    }

    #[inline]
    fn bit(id: DatasetId) -> u64 {
        debug_assert!((id.get() as usize) < MAX_DATASETS);
        1u64 << id.get()
    }

    pub fn has_pending_write(&self) -> bool {
        !self.write_queue.is_empty()
    }

    pub fn write_armed(&self) -> bool {
        self.write_armed
    }

    pub fn set_write_armed(&mut self, armed: bool) {
        self.write_armed = armed;
    }

    /// Appends one whole encoded frame to the write queue.
    ///
    /// If `max_queue_bytes` is non-zero and appending `frame` would exceed
    /// it, the frame is dropped in its entirety (never partially) and the
    /// drop is logged once per contiguous episode rather than once per
    /// frame, to avoid a stuck client causing a log storm.
    pub fn push_outbound(&mut self, frame: &[u8]) {
        let bounded = self.max_queue_bytes != 0;
        if bounded && self.write_queue.len() + frame.len() > self.max_queue_bytes {
            if !self.dropping {
                debug!(peer = %self.peer_addr, "client write queue full, dropping frames at boundary");
                self.dropping = true;
            }
            return;
        }
        self.dropping = false;
        self.write_queue.extend(frame.iter().copied());
    }

    /// A single best-effort non-blocking write of the contiguous front of
    /// the queue. Advances the queue head by however many bytes the kernel
    /// accepted.
    pub fn try_write(&mut self) -> WriteOutcome {
        if self.write_queue.is_empty() {
            return WriteOutcome::Progressed;
        }
        let front = self.write_queue.make_contiguous();
        match self.stream.write(front) {
            Ok(0) => WriteOutcome::Failed,
            Ok(n) => {
                self.write_queue.drain(..n);
                WriteOutcome::Progressed
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => WriteOutcome::WouldBlock,
            Err(e) => {
                debug!(peer = %self.peer_addr, error = %e, "write failed");
                WriteOutcome::Failed
            }
        }
    }

    /// A single non-blocking 1-byte read. Every client-to-host frame is
    /// exactly one octet, so this always yields a complete frame.
    pub fn try_read_header_byte(&mut self) -> ReadByteOutcome {
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => ReadByteOutcome::Closed,
            Ok(_) => ReadByteOutcome::Got(byte[0]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadByteOutcome::WouldBlock,
            Err(e) => {
                debug!(peer = %self.peer_addr, error = %e, "read failed");
                ReadByteOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    fn connected_pair() -> (ClientConn, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, peer_addr) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(server);
        (ClientConn::new(stream, peer_addr, 0), client)
    }

    #[test]
    fn subscription_bitset_is_idempotent() {
        let (mut conn, _peer) = connected_pair();
        let id = DatasetId::new(5).unwrap();
        assert!(!conn.is_subscribed(id));
        conn.set_subscribed(id, true);
        conn.set_subscribed(id, true);
        assert!(conn.is_subscribed(id));
        conn.set_subscribed(id, false);
        assert!(!conn.is_subscribed(id));
        // Unsubscribing twice is also a no-op, not an error.
        conn.set_subscribed(id, false);
        assert!(!conn.is_subscribed(id));
    }

    #[test]
    fn bounded_queue_drops_whole_frames_at_boundary() {
        let (mut conn, _peer) = connected_pair();
        conn.max_queue_bytes = 10;
        conn.push_outbound(&[1; 8]);
        assert!(conn.has_pending_write());
        // This frame would push us to 16 bytes; must be dropped whole, not
        // partially appended.
        conn.push_outbound(&[2; 8]);
        assert_eq!(conn.write_queue.len(), 8);
        assert!(conn.write_queue.iter().all(|&b| b == 1));
    }

    #[test]
    fn push_then_write_drains_queue() {
        let (mut conn, mut peer) = connected_pair();
        conn.push_outbound(b"hello");
        assert!(conn.has_pending_write());
        assert_eq!(conn.try_write(), WriteOutcome::Progressed);
        assert!(!conn.has_pending_write());
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
