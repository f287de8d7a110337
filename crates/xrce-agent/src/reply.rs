// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Asynchronous reply pipeline.
//
// Handlers push replies into a FIFO queue; a dedicated worker thread pops
// them, serializes into a fixed buffer and hands the bytes to the
// transport. The queue is the only point where the run loop and the
// worker meet.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::error::XrceError;
use crate::protocol::{self, XrceMessage};
use crate::transport::{TransportAddr, XrceTransport};

/// A message waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub destination: TransportAddr,
    pub message: XrceMessage,
}

/// Result of [`ReplyQueue::pop_blocking`].
#[derive(Debug)]
pub enum Pop {
    Reply(Reply),
    /// Queue shut down; the consumer must exit.
    Stop,
}

// ---------------------------------------------------------------------------
// Reply queue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Reply>,
    closed: bool,
}

/// Multi-producer, single-consumer FIFO with a stop sentinel.
#[derive(Debug, Default)]
pub struct ReplyQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reply. Returns `false` (reply discarded) once shut down.
    pub fn push(&self, reply: Reply) -> bool {
        self.push_with(reply, |_| {})
    }

    /// Like [`ReplyQueue::push`], but `stamp` edits the message under the
    /// queue lock, so whatever it assigns follows enqueue order. Not called
    /// once the queue is shut down.
    pub fn push_with(&self, mut reply: Reply, stamp: impl FnOnce(&mut XrceMessage)) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        stamp(&mut reply.message);
        state.items.push_back(reply);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Block until a reply is available or the queue is shut down.
    /// Shutdown takes precedence over pending replies.
    pub fn pop_blocking(&self) -> Pop {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Pop::Stop;
            }
            if let Some(reply) = state.items.pop_front() {
                return Pop::Reply(reply);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Close the queue and wake the consumer.
    pub fn shutdown(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    /// Take every pending reply.
    pub fn drain(&self) -> Vec<Reply> {
        self.state.lock().items.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Delivery statistics
// ---------------------------------------------------------------------------

/// Counters updated by the reply worker.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    /// Replies handed to the transport successfully.
    pub sent: AtomicU64,

    /// Bytes handed to the transport.
    pub bytes_sent: AtomicU64,

    /// Transport send errors (not retried).
    pub send_failures: AtomicU64,

    /// Replies larger than the output buffer.
    pub oversize_drops: AtomicU64,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            oversize_drops: self.oversize_drops.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryStatsSnapshot {
    pub sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub oversize_drops: u64,
}

// ---------------------------------------------------------------------------
// Reply dispatcher (worker thread)
// ---------------------------------------------------------------------------

/// Owns the worker thread that drains a [`ReplyQueue`] into a transport.
pub struct ReplyDispatcher {
    queue: Arc<ReplyQueue>,
    handle: Option<JoinHandle<()>>,
}

impl ReplyDispatcher {
    /// Start the worker. `buffer_size` bounds every serialized reply.
    pub fn spawn(
        queue: Arc<ReplyQueue>,
        transport: Arc<dyn XrceTransport>,
        buffer_size: usize,
        stats: Arc<DeliveryStats>,
    ) -> Result<Self, XrceError> {
        let worker_queue = Arc::clone(&queue);
        let handle = thread::Builder::new()
            .name("xrce-reply".into())
            .spawn(move || worker_loop(&worker_queue, transport.as_ref(), buffer_size, &stats))?;
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Shut the queue down and join the worker.
    pub fn stop(&mut self) {
        self.queue.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Reply worker panicked");
            }
        }
    }
}

impl Drop for ReplyDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    queue: &ReplyQueue,
    transport: &dyn XrceTransport,
    buffer_size: usize,
    stats: &DeliveryStats,
) {
    let mut buf = vec![0u8; buffer_size];
    log::debug!("Reply worker started ({} byte buffer)", buffer_size);

    while let Pop::Reply(reply) = queue.pop_blocking() {
        let len = match protocol::serialize_message_into(&reply.message, &mut buf) {
            Ok(len) => len,
            Err(e) => {
                stats.oversize_drops.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Dropping reply to {} for client {}: {}",
                    reply.destination,
                    reply.message.header.client_key,
                    e
                );
                continue;
            }
        };
        match transport.send(&reply.destination, &buf[..len]) {
            Ok(()) => {
                stats.sent.fetch_add(1, Ordering::Relaxed);
                stats.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
            }
            Err(e) => {
                stats.send_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Failed to send reply to {}: {}", reply.destination, e);
            }
        }
    }

    log::debug!("Reply worker stopped");
}
