//! Inbound video frame ring buffer with the occupancy-adaptive drain policy

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::{DRAIN_OCCUPANCY_RATIO, MAX_FRAMES_DRAINED_PER_TICK};

/// One buffered frame and its provenance
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedFrame<T> {
    pub source_id: u32,
    pub sequence: u64,
    /// Microseconds, producer clock
    pub timestamp: u64,
    pub payload: T,
}

/// Result of one composition-tick read
#[derive(Debug, Clone, PartialEq)]
pub struct Drained<T> {
    pub frame: TaggedFrame<T>,
    /// Frames removed from the buffer this tick, including `frame`
    pub consumed: usize,
}

/// How many frames one tick should consume.
///
/// Below the drain ratio a tick reads exactly one frame. At or above it the
/// tick reads every buffered frame up to the per-tick bound and keeps only
/// the newest; frames past the bound are evicted.
pub fn drain_count(occupancy: usize, capacity: usize) -> usize {
    if occupancy == 0 || capacity == 0 {
        return 0;
    }
    let ratio = occupancy as f64 / capacity as f64;
    if ratio < DRAIN_OCCUPANCY_RATIO {
        1
    } else {
        occupancy.min(MAX_FRAMES_DRAINED_PER_TICK).max(1)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FrameBufferStats {
    pub occupancy: usize,
    pub capacity: usize,
    pub written: u64,
    pub evicted: u64,
    pub consumed: u64,
    /// Consumed frames discarded by the drain policy
    pub skipped: u64,
}

/// Fixed-capacity FIFO of frames; the oldest frame is evicted on overflow.
///
/// Each session owns one, holding that client's own contributed video.
/// Sequence numbers are assigned per producer on write.
pub struct MultiSourceFrameRingBuffer<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    written: AtomicU64,
    evicted: AtomicU64,
    consumed: AtomicU64,
    skipped: AtomicU64,
}

struct Inner<T> {
    frames: VecDeque<TaggedFrame<T>>,
    next_sequence: std::collections::HashMap<u32, u64>,
}

impl<T> MultiSourceFrameRingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                next_sequence: std::collections::HashMap::new(),
            }),
            capacity,
            written: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Append a frame, evicting the oldest when full. Returns the sequence
    /// number assigned to the frame.
    pub fn write(&self, source_id: u32, timestamp: u64, payload: T) -> u64 {
        let mut inner = self.inner.lock();
        let sequence = {
            let next = inner.next_sequence.entry(source_id).or_insert(0);
            let seq = *next;
            *next += 1;
            seq
        };
        if inner.frames.len() == self.capacity {
            inner.frames.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        inner.frames.push_back(TaggedFrame {
            source_id,
            sequence,
            timestamp,
            payload,
        });
        self.written.fetch_add(1, Ordering::Relaxed);
        sequence
    }

    /// Plain FIFO read of the oldest frame.
    pub fn read_oldest(&self) -> Option<TaggedFrame<T>> {
        let frame = self.inner.lock().frames.pop_front()?;
        self.consumed.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Composition read applying [`drain_count`].
    pub fn read_for_composition(&self) -> Option<Drained<T>> {
        let mut inner = self.inner.lock();
        let count = drain_count(inner.frames.len(), self.capacity);
        if count == 0 {
            return None;
        }

        if count == 1 {
            let frame = inner.frames.pop_front()?;
            drop(inner);
            self.consumed.fetch_add(1, Ordering::Relaxed);
            return Some(Drained { frame, consumed: 1 });
        }

        // Skip the oldest, show the newest, evict whatever older frames the
        // per-tick bound left behind.
        inner.frames.drain(..count - 1);
        let newest = inner.frames.pop_back();
        let stale = inner.frames.len();
        inner.frames.clear();
        drop(inner);

        self.consumed.fetch_add(count as u64, Ordering::Relaxed);
        self.skipped.fetch_add(count as u64 - 1, Ordering::Relaxed);
        self.evicted.fetch_add(stale as u64, Ordering::Relaxed);
        tracing::trace!(count, stale, "Drained backlogged video frames");
        newest.map(|frame| Drained {
            frame,
            consumed: count,
        })
    }

    pub fn occupancy(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn occupancy_ratio(&self) -> f64 {
        self.occupancy() as f64 / self.capacity as f64
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// Drop every buffered frame. Returns how many were released.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.frames.len();
        inner.frames.clear();
        n
    }

    pub fn stats(&self) -> FrameBufferStats {
        FrameBufferStats {
            occupancy: self.occupancy(),
            capacity: self.capacity,
            written: self.written.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Last successfully read frame, substituted while the buffer is briefly empty
#[derive(Debug)]
pub struct LastFrameCache<T> {
    slot: Mutex<Option<T>>,
}

impl<T: Clone> LastFrameCache<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn update(&self, frame: T) {
        *self.slot.lock() = Some(frame);
    }

    pub fn get(&self) -> Option<T> {
        self.slot.lock().clone()
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }

    /// Fresh frame from `buffer` if any (refreshing the cache), else the cached one.
    pub fn fresh_or_cached(&self, buffer: &MultiSourceFrameRingBuffer<T>) -> Option<T> {
        match buffer.read_for_composition() {
            Some(drained) => {
                self.update(drained.frame.payload.clone());
                Some(drained.frame.payload)
            }
            None => self.get(),
        }
    }
}

impl<T: Clone> Default for LastFrameCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_drain_count_thresholds() {
        assert_eq!(drain_count(0, 16), 0);
        assert_eq!(drain_count(1, 16), 1);
        assert_eq!(drain_count(4, 16), 1);
        // 5/16 = 0.3125
        assert_eq!(drain_count(5, 16), 5);
        assert_eq!(drain_count(16, 16), 16);
        assert_eq!(drain_count(64, 64), MAX_FRAMES_DRAINED_PER_TICK);
    }

    #[test]
    fn test_fifo_below_threshold() {
        let buffer = MultiSourceFrameRingBuffer::new(16);
        buffer.write(1, 10, "a");
        buffer.write(1, 20, "b");

        let drained = buffer.read_for_composition().unwrap();
        assert_eq!(drained.consumed, 1);
        assert_eq!(drained.frame.payload, "a");
        assert_eq!(buffer.occupancy(), 1);
    }

    #[test]
    fn test_backlog_uses_newest() {
        let buffer = MultiSourceFrameRingBuffer::new(10);
        for i in 0..6u64 {
            buffer.write(1, i, i);
        }

        let drained = buffer.read_for_composition().unwrap();
        assert!(drained.consumed > 1);
        assert_eq!(drained.frame.payload, 5);
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().skipped, 5);
    }

    #[test]
    fn test_backlog_beyond_drain_bound_uses_newest() {
        let buffer = MultiSourceFrameRingBuffer::new(64);
        for i in 0..40u64 {
            buffer.write(1, i, i);
        }

        let drained = buffer.read_for_composition().unwrap();
        assert_eq!(drained.frame.payload, 39);
        assert_eq!(drained.consumed, MAX_FRAMES_DRAINED_PER_TICK);
        assert!(buffer.is_empty());

        let stats = buffer.stats();
        assert_eq!(stats.skipped, MAX_FRAMES_DRAINED_PER_TICK as u64 - 1);
        assert_eq!(stats.evicted, 40 - MAX_FRAMES_DRAINED_PER_TICK as u64);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let buffer = MultiSourceFrameRingBuffer::new(3);
        for i in 0..5u32 {
            buffer.write(7, 0, i);
        }
        assert_eq!(buffer.occupancy(), 3);
        assert_eq!(buffer.stats().evicted, 2);
        assert_eq!(buffer.read_oldest().unwrap().payload, 2);
    }

    #[test]
    fn test_sequences_are_per_source() {
        let buffer = MultiSourceFrameRingBuffer::new(8);
        assert_eq!(buffer.write(1, 0, ()), 0);
        assert_eq!(buffer.write(2, 0, ()), 0);
        assert_eq!(buffer.write(1, 0, ()), 1);
    }

    #[test]
    fn test_last_frame_cache_substitutes() {
        let buffer = MultiSourceFrameRingBuffer::new(8);
        let cache = LastFrameCache::new();
        assert_eq!(cache.fresh_or_cached(&buffer), None);

        buffer.write(1, 0, 42);
        assert_eq!(cache.fresh_or_cached(&buffer), Some(42));
        assert_eq!(cache.fresh_or_cached(&buffer), Some(42));

        buffer.write(1, 1, 43);
        assert_eq!(cache.fresh_or_cached(&buffer), Some(43));

        cache.clear();
        assert_eq!(cache.get(), None);
    }

    proptest! {
        #[test]
        fn prop_backlog_never_returns_stale(capacity in 2usize..32, writes in 1usize..64) {
            let buffer = MultiSourceFrameRingBuffer::new(capacity);
            for i in 0..writes {
                buffer.write(1, i as u64, i);
            }
            let occupancy = buffer.occupancy();
            let drained = buffer.read_for_composition().unwrap();
            prop_assert!(drained.consumed <= MAX_FRAMES_DRAINED_PER_TICK);
            if occupancy as f64 / capacity as f64 >= DRAIN_OCCUPANCY_RATIO {
                prop_assert_eq!(drained.frame.payload, writes - 1);
                prop_assert!(buffer.is_empty());
            }
        }
    }
}
