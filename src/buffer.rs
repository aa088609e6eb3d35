// src/buffer.rs
//! Bounded receive buffer for non-STUN traffic.
//!
//! Frames that arrive on a candidate and are not connectivity checks belong
//! to the upper layer. Reader tasks push them here; the application drains
//! them with [`PacketBuffer::recv`]. The buffer is bounded: a full or closed
//! buffer drops frames, matching datagram semantics.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{IceError, IceResult};

/// Default byte limit for buffered packets
pub const DEFAULT_BUFFER_LIMIT: usize = 1024 * 1024;

#[derive(Debug)]
struct Inner {
    queue: VecDeque<Vec<u8>>,
    bytes: usize,
    limit: usize,
    closed: bool,
    dropped: u64,
}

/// Bounded FIFO of received packets
#[derive(Debug)]
pub struct PacketBuffer {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_BUFFER_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                bytes: 0,
                limit,
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a packet. Returns false when the packet was dropped because
    /// the buffer is full or closed.
    pub fn push(&self, data: &[u8]) -> bool {
        let mut inner = self.inner.lock();

        if inner.closed || inner.bytes + data.len() > inner.limit {
            inner.dropped += 1;
            return false;
        }

        inner.bytes += data.len();
        inner.queue.push_back(data.to_vec());
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// Wait for the next packet. Returns `IceError::Closed` once the buffer
    /// is closed and drained.
    pub async fn recv(&self) -> IceResult<Vec<u8>> {
        loop {
            let notified = self.notify.notified();

            {
                let mut inner = self.inner.lock();
                if let Some(data) = inner.queue.pop_front() {
                    inner.bytes -= data.len();
                    return Ok(data);
                }
                if inner.closed {
                    return Err(IceError::Closed);
                }
            }

            notified.await;
        }
    }

    /// Number of packets dropped so far
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Close the buffer and wake all pending readers
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}
