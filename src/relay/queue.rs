//! Bounded per-client outbound packet queues
//!
//! Enqueue never blocks: a full or shut-down queue rejects the packet and the
//! caller counts it as a drop. Dequeue never blocks either; the sender loop
//! waits on a shared [`Wakeup`] with a short timeout instead.

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::RelayError;
use crate::protocol::Packet;

/// Wake signal shared by the queues feeding one sender loop
#[derive(Debug, Default)]
pub struct Wakeup {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Wakeup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Wait until notified or `timeout` elapses. Returns whether a
    /// notification was consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

/// Counters for one queue
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub shut_down: bool,
}

/// Bounded FIFO of outbound packets owned by one session
pub struct RelayQueue {
    name: &'static str,
    queue: ArrayQueue<Packet>,
    shut_down: AtomicBool,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
    wake: Arc<Wakeup>,
}

impl RelayQueue {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self::with_wakeup(name, capacity, Wakeup::new())
    }

    pub fn with_wakeup(name: &'static str, capacity: usize, wake: Arc<Wakeup>) -> Self {
        Self {
            name,
            queue: ArrayQueue::new(capacity.max(1)),
            shut_down: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            wake,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Non-blocking enqueue. Failures are counted as drops.
    pub fn enqueue(&self, packet: Packet) -> Result<(), RelayError> {
        if self.shut_down.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(RelayError::QueueShutDown);
        }
        match self.queue.push(packet) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                self.wake.notify();
                Ok(())
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(RelayError::QueueFull)
            }
        }
    }

    /// Non-blocking dequeue. Keeps returning packets after shutdown until empty.
    pub fn try_dequeue(&self) -> Option<Packet> {
        let packet = self.queue.pop()?;
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(packet)
    }

    /// Reject further enqueues; queued packets stay available to dequeue.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::debug!(queue = self.name, depth = self.queue.len(), "Relay queue draining");
        }
        self.wake.notify();
    }

    /// Drop everything still queued. Returns how many packets were discarded.
    pub fn clear(&self) -> usize {
        let mut cleared = 0;
        while self.queue.pop().is_some() {
            cleared += 1;
        }
        cleared
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.queue.len(),
            capacity: self.queue.capacity(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            shut_down: self.is_shut_down(),
        }
    }
}

impl std::fmt::Debug for RelayQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayQueue")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

/// The audio and video queues of one session, sharing one wake signal
#[derive(Debug)]
pub struct OutboundQueues {
    pub audio: RelayQueue,
    pub video: RelayQueue,
    wake: Arc<Wakeup>,
}

impl OutboundQueues {
    pub fn new(audio_capacity: usize, video_capacity: usize) -> Self {
        let wake = Wakeup::new();
        Self {
            audio: RelayQueue::with_wakeup("audio", audio_capacity, wake.clone()),
            video: RelayQueue::with_wakeup("video", video_capacity, wake.clone()),
            wake,
        }
    }

    /// Audio first, then video/control.
    pub fn next(&self) -> Option<Packet> {
        self.audio.try_dequeue().or_else(|| self.video.try_dequeue())
    }

    /// Bounded wait for either queue to receive something.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.wake.wait(timeout)
    }

    pub fn shutdown(&self) {
        self.audio.shutdown();
        self.video.shutdown();
    }

    pub fn is_drained(&self) -> bool {
        self.audio.is_empty() && self.video.is_empty()
    }

    /// Enqueue on the queue matching the packet's media type.
    pub fn route(&self, packet: Packet) -> Result<(), RelayError> {
        if packet.packet_type.is_audio() {
            self.audio.enqueue(packet)
        } else {
            self.video.enqueue(packet)
        }
    }
}
