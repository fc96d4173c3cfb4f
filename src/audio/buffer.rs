//! Lock-free ring buffer for audio samples
//!
//! Single-producer single-consumer. Each side owns one cursor; the producer
//! publishes its cursor with release ordering after storing samples, the
//! consumer loads it with acquire ordering before reading them (and the
//! reverse for the read cursor). Samples are stored as `f32` bit patterns in
//! `AtomicU32` slots so neither side ever needs `unsafe` or a lock.
//!
//! Playback buffers are jitter-gated: reads produce silence until the backlog
//! first reaches the jitter threshold, then play forever after. Underflow
//! pads with silence and bumps the underrun counter but never re-gates.
//! Capture buffers skip gating entirely.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::AudioConfig;

/// Buffer geometry and policy thresholds, all in samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    pub capacity: usize,
    /// 0 disables gating
    pub jitter_threshold: usize,
    pub low_water_mark: usize,
    pub high_water_mark: usize,
    pub target_occupancy: usize,
    pub crossfade_samples: usize,
}

impl RingConfig {
    /// Ungated buffer that only truncates when physically full.
    pub fn capture(capacity: usize) -> Self {
        Self {
            capacity,
            jitter_threshold: 0,
            low_water_mark: 0,
            high_water_mark: capacity,
            target_occupancy: capacity,
            crossfade_samples: 0,
        }
    }

    /// Jitter-gated buffer using the configured thresholds.
    pub fn playback(config: &AudioConfig) -> Self {
        Self {
            capacity: config.ring_capacity,
            jitter_threshold: config.jitter_threshold,
            low_water_mark: config.low_water_mark,
            high_water_mark: config.high_water_mark,
            target_occupancy: config.target_occupancy,
            crossfade_samples: config.crossfade_samples,
        }
    }

    fn gated(&self) -> bool {
        self.jitter_threshold > 0
    }
}

/// Snapshot of a buffer's counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RingStats {
    pub occupancy: usize,
    pub capacity: usize,
    pub filled: bool,
    pub written: u64,
    pub read: u64,
    pub dropped: u64,
    pub underruns: u64,
    pub low_water_reads: u64,
}

struct Shared {
    slots: Box<[AtomicU32]>,
    config: RingConfig,
    /// Monotonic (wrapping) sample counts; slot index is `pos % capacity`
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    filled: AtomicBool,
    written: AtomicU64,
    read: AtomicU64,
    dropped: AtomicU64,
    underruns: AtomicU64,
    low_water_reads: AtomicU64,
}

impl Shared {
    fn occupancy(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    fn stats(&self) -> RingStats {
        RingStats {
            occupancy: self.occupancy(),
            capacity: self.config.capacity,
            filled: self.filled.load(Ordering::Acquire),
            written: self.written.load(Ordering::Relaxed),
            read: self.read.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            low_water_reads: self.low_water_reads.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn slot(&self, pos: usize) -> &AtomicU32 {
        &self.slots[pos % self.config.capacity]
    }
}

/// Constructor namespace for the producer/consumer pair
pub struct AudioRingBuffer;

impl AudioRingBuffer {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(config: RingConfig) -> (AudioProducer, AudioConsumer) {
        let capacity = config.capacity.max(1);
        let config = RingConfig { capacity, ..config };
        let slots = (0..capacity).map(|_| AtomicU32::new(0)).collect();
        let shared = Arc::new(Shared {
            slots,
            config,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            // Capture buffers start out playing
            filled: AtomicBool::new(!config.gated()),
            written: AtomicU64::new(0),
            read: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            low_water_reads: AtomicU64::new(0),
        });
        (
            AudioProducer {
                shared: shared.clone(),
            },
            AudioConsumer {
                shared,
                fade_position: 0,
                fade_remaining: 0,
            },
        )
    }

    pub fn capture(capacity: usize) -> (AudioProducer, AudioConsumer) {
        Self::new(RingConfig::capture(capacity))
    }

    pub fn playback(config: &AudioConfig) -> (AudioProducer, AudioConsumer) {
        Self::new(RingConfig::playback(config))
    }
}

/// Writing half. Not `Clone`: there is exactly one producer.
pub struct AudioProducer {
    shared: Arc<Shared>,
}

impl AudioProducer {
    /// Append samples. Returns how many were accepted; the remainder is
    /// dropped (newest first) by the high-water-mark policy or a full buffer.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        if samples.is_empty() {
            return 0;
        }
        let shared = &*self.shared;
        let config = &shared.config;

        let w = shared.write_pos.load(Ordering::Relaxed);
        let r = shared.read_pos.load(Ordering::Acquire);
        let occupancy = w.wrapping_sub(r);
        let free = config.capacity - occupancy.min(config.capacity);

        let mut accept = samples.len().min(free);
        if occupancy + samples.len() > config.high_water_mark {
            accept = accept.min(config.target_occupancy.saturating_sub(occupancy));
        }

        for (i, &sample) in samples[..accept].iter().enumerate() {
            shared
                .slot(w.wrapping_add(i))
                .store(sample.to_bits(), Ordering::Relaxed);
        }
        shared
            .write_pos
            .store(w.wrapping_add(accept), Ordering::Release);

        shared
            .written
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        let dropped = samples.len() - accept;
        if dropped > 0 {
            shared.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        accept
    }

    pub fn occupancy(&self) -> usize {
        self.shared.occupancy()
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            shared: self.shared.clone(),
        }
    }
}

/// Reading half. Owns the crossfade state.
pub struct AudioConsumer {
    shared: Arc<Shared>,
    fade_position: usize,
    fade_remaining: usize,
}

impl AudioConsumer {
    /// Fill `out`, returning the number of buffered samples consumed.
    ///
    /// `out` is always fully written: any shortfall is padded with silence.
    /// While gated the result is 0 and `out` is all silence.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let shared = Arc::clone(&self.shared);
        let config = shared.config;

        let r = shared.read_pos.load(Ordering::Relaxed);
        let w = shared.write_pos.load(Ordering::Acquire);
        let available = w.wrapping_sub(r);

        if !shared.filled.load(Ordering::Acquire) {
            if available < config.jitter_threshold {
                out.fill(0.0);
                return 0;
            }
            shared.filled.store(true, Ordering::Release);
            self.fade_position = 0;
            self.fade_remaining = config.crossfade_samples;
            tracing::debug!(available, "Jitter buffer filled, starting playback");
        }

        if config.low_water_mark > 0 && available < config.low_water_mark {
            shared.low_water_reads.fetch_add(1, Ordering::Relaxed);
        }

        let n = available.min(out.len());
        for (i, sample) in out[..n].iter_mut().enumerate() {
            *sample = f32::from_bits(shared.slot(r.wrapping_add(i)).load(Ordering::Relaxed));
        }
        shared.read_pos.store(r.wrapping_add(n), Ordering::Release);

        self.apply_fade(&mut out[..n]);

        if n < out.len() {
            out[n..].fill(0.0);
            shared.underruns.fetch_add(1, Ordering::Relaxed);
        }
        shared.read.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    fn apply_fade(&mut self, samples: &mut [f32]) {
        if self.fade_remaining == 0 {
            return;
        }
        let total = self.shared.config.crossfade_samples as f32;
        for sample in samples.iter_mut() {
            if self.fade_remaining == 0 {
                break;
            }
            *sample *= (self.fade_position + 1) as f32 / total;
            self.fade_position += 1;
            self.fade_remaining -= 1;
        }
    }

    /// Copy up to `out.len()` buffered samples without consuming them.
    /// Ignores gating and crossfade.
    pub fn peek(&self, out: &mut [f32]) -> usize {
        let shared = &*self.shared;
        let r = shared.read_pos.load(Ordering::Relaxed);
        let w = shared.write_pos.load(Ordering::Acquire);
        let n = w.wrapping_sub(r).min(out.len());
        for (i, sample) in out[..n].iter_mut().enumerate() {
            *sample = f32::from_bits(shared.slot(r.wrapping_add(i)).load(Ordering::Relaxed));
        }
        n
    }

    /// Discard buffered samples and, for playback buffers, re-arm the jitter
    /// gate. Only for an explicit stream restart.
    pub fn reset(&mut self) {
        let shared = &*self.shared;
        let w = shared.write_pos.load(Ordering::Acquire);
        shared.read_pos.store(w, Ordering::Release);
        if shared.config.gated() {
            shared.filled.store(false, Ordering::Release);
        }
        self.fade_position = 0;
        self.fade_remaining = 0;
    }

    pub fn available(&self) -> usize {
        self.shared.occupancy()
    }

    pub fn is_filled(&self) -> bool {
        self.shared.filled.load(Ordering::Acquire)
    }

    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            shared: self.shared.clone(),
        }
    }
}

/// Read-only view for statistics, shareable across threads
#[derive(Clone)]
pub struct RingMonitor {
    shared: Arc<Shared>,
}

impl RingMonitor {
    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }

    pub fn occupancy(&self) -> usize {
        self.shared.occupancy()
    }
}

impl std::fmt::Debug for RingMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingMonitor")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn playback(capacity: usize, threshold: usize, crossfade: usize) -> (AudioProducer, AudioConsumer) {
        AudioRingBuffer::new(RingConfig {
            capacity,
            jitter_threshold: threshold,
            low_water_mark: threshold / 4,
            high_water_mark: capacity * 3 / 4,
            target_occupancy: capacity / 2,
            crossfade_samples: crossfade,
        })
    }

    #[test]
    fn test_capture_buffer_is_ungated() {
        let (mut tx, mut rx) = AudioRingBuffer::capture(64);
        assert!(rx.is_filled());
        assert_eq!(tx.write(&[0.5; 10]), 10);

        let mut out = [0.0; 10];
        assert_eq!(rx.read(&mut out), 10);
        assert_eq!(out, [0.5; 10]);
    }

    #[test]
    fn test_jitter_gate_holds_until_threshold() {
        let (mut tx, mut rx) = playback(1024, 100, 0);
        let mut out = [1.0; 32];

        tx.write(&[0.25; 99]);
        assert_eq!(rx.read(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(!rx.is_filled());

        tx.write(&[0.25; 1]);
        assert_eq!(rx.read(&mut out), 32);
        assert!(rx.is_filled());
    }

    #[test]
    fn test_gate_never_reopens() {
        let (mut tx, mut rx) = playback(1024, 64, 0);
        tx.write(&[0.1; 64]);
        let mut out = [0.0; 64];
        assert_eq!(rx.read(&mut out), 64);

        for _ in 0..10 {
            assert_eq!(rx.read(&mut out), 0);
            assert!(rx.is_filled());
        }
        assert_eq!(rx.underruns(), 10);

        tx.write(&[0.1; 3]);
        assert_eq!(rx.read(&mut out), 3);
        assert!(out[3..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_crossfade_ramps_in() {
        let (mut tx, mut rx) = playback(1024, 8, 4);
        tx.write(&[1.0; 8]);
        let mut out = [0.0; 8];
        rx.read(&mut out);
        assert_eq!(&out[..4], &[0.25, 0.5, 0.75, 1.0]);
        assert_eq!(&out[4..], &[1.0; 4]);
    }

    #[test]
    fn test_high_water_truncates_newest() {
        let (mut tx, rx) = playback(100, 10, 0);
        // hwm 75, target 50
        assert_eq!(tx.write(&[1.0; 60]), 60);
        assert_eq!(tx.write(&[2.0; 20]), 0);
        assert_eq!(rx.available(), 60);

        let stats = rx.monitor().stats();
        assert_eq!(stats.dropped, 20);
        assert_eq!(stats.written, 80);
    }

    #[test]
    fn test_high_water_partial_accept() {
        let (mut tx, rx) = playback(100, 10, 0);
        assert_eq!(tx.write(&[1.0; 40]), 40);
        // 40 + 40 > 75, keep up to target 50
        assert_eq!(tx.write(&[2.0; 40]), 10);
        assert_eq!(rx.available(), 50);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (mut tx, mut rx) = AudioRingBuffer::capture(16);
        tx.write(&[1.0, 2.0, 3.0]);

        let mut out = [0.0; 8];
        assert_eq!(rx.peek(&mut out), 3);
        assert_eq!(&out[..3], &[1.0, 2.0, 3.0]);
        assert_eq!(rx.available(), 3);

        let mut out = [0.0; 2];
        assert_eq!(rx.read(&mut out), 2);
        assert_eq!(rx.available(), 1);
    }

    #[test]
    fn test_wraparound() {
        let (mut tx, mut rx) = AudioRingBuffer::capture(8);
        let mut out = [0.0; 5];
        for round in 0..10 {
            let value = round as f32;
            assert_eq!(tx.write(&[value; 5]), 5);
            assert_eq!(rx.read(&mut out), 5);
            assert_eq!(out, [value; 5]);
        }
    }

    #[test]
    fn test_reset_regates_playback() {
        let (mut tx, mut rx) = playback(256, 16, 0);
        tx.write(&[0.5; 32]);
        let mut out = [0.0; 4];
        rx.read(&mut out);
        assert!(rx.is_filled());

        rx.reset();
        assert!(!rx.is_filled());
        assert_eq!(rx.available(), 0);
    }

    #[test]
    fn test_concurrent_spsc() {
        let (mut tx, mut rx) = AudioRingBuffer::capture(512);
        let total = 100_000usize;

        let producer = std::thread::spawn(move || {
            let mut next = 0usize;
            while next < total {
                let chunk: Vec<f32> = (next..(next + 64).min(total)).map(|v| v as f32).collect();
                let accepted = tx.write(&chunk);
                next += accepted;
                if accepted == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0usize;
        let mut out = [0.0f32; 100];
        while expected < total {
            let n = rx.read(&mut out);
            for &sample in &out[..n] {
                assert_eq!(sample, expected as f32);
                expected += 1;
            }
        }
        producer.join().unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(usize),
        Read(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(1usize..300).prop_map(Op::Write), (1usize..300).prop_map(Op::Read)]
    }

    proptest! {
        #[test]
        fn prop_conservation(ops in proptest::collection::vec(op(), 1..200)) {
            let (mut tx, mut rx) = playback(512, 128, 16);
            let mut scratch = vec![0.0f32; 300];
            let mut total_read = 0u64;

            for op in ops {
                match op {
                    Op::Write(n) => { tx.write(&vec![0.5; n]); }
                    Op::Read(n) => { total_read += rx.read(&mut scratch[..n]) as u64; }
                }
            }
            // drain what is left
            loop {
                let n = rx.read(&mut scratch);
                if n == 0 { break; }
                total_read += n as u64;
            }

            let stats = rx.monitor().stats();
            if stats.filled {
                prop_assert_eq!(total_read, stats.written - stats.dropped);
            } else {
                prop_assert_eq!(total_read, 0);
                prop_assert_eq!(stats.occupancy as u64, stats.written - stats.dropped);
            }
        }
    }
}
