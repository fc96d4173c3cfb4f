//! Exclude-self audio mixer
//!
//! Each registered source owns the consumer half of one playback ring
//! buffer. A mixing tick reads every source exactly once, then derives each
//! participant's mix as the sum of everyone else's samples. Reading once per
//! tick keeps the buffers strictly single-consumer even though every source
//! contributes to many mixes.

use parking_lot::Mutex;
use serde::Serialize;

use super::buffer::AudioConsumer;

struct Source {
    id: u32,
    consumer: AudioConsumer,
    /// Samples read this tick
    scratch: Vec<f32>,
    /// Buffered samples actually consumed this tick
    produced: usize,
    muted: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MixerStats {
    pub sources: usize,
    pub ticks: u64,
    pub active_last_tick: usize,
}

/// Result of one mixing tick
#[derive(Debug, Clone, Default)]
pub struct MixTick {
    frame_len: usize,
    contributions: Vec<(u32, Vec<f32>, usize)>,
}

impl MixTick {
    /// Sources that produced at least one real sample this tick
    pub fn active_sources(&self) -> usize {
        self.contributions.iter().filter(|(_, _, n)| *n > 0).count()
    }

    pub fn source_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.contributions.iter().map(|(id, _, _)| *id)
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Sum of every other source's samples, clamped to [-1, 1].
    ///
    /// Silence when `id` is the only source with audio this tick.
    pub fn excluding(&self, id: u32) -> Vec<f32> {
        let mut out = vec![0.0f32; self.frame_len];
        for (source_id, samples, produced) in &self.contributions {
            if *source_id == id || *produced == 0 {
                continue;
            }
            for (o, s) in out.iter_mut().zip(samples) {
                *o += *s;
            }
        }
        for o in out.iter_mut() {
            *o = o.clamp(-1.0, 1.0);
        }
        out
    }
}

/// Registry of per-client audio sources
pub struct Mixer {
    sources: Mutex<Vec<Source>>,
    max_sources: usize,
    ticks: std::sync::atomic::AtomicU64,
    active_last_tick: std::sync::atomic::AtomicUsize,
}

impl Mixer {
    pub fn new(max_sources: usize) -> Self {
        Self {
            sources: Mutex::new(Vec::with_capacity(max_sources)),
            max_sources,
            ticks: Default::default(),
            active_last_tick: Default::default(),
        }
    }

    /// Register a source, replacing any previous one with the same id.
    /// Returns false when the mixer is full.
    pub fn add_source(&self, id: u32, consumer: AudioConsumer) -> bool {
        let mut sources = self.sources.lock();
        sources.retain(|s| s.id != id);
        if sources.len() >= self.max_sources {
            tracing::warn!(client_id = id, "Mixer full, audio source not registered");
            return false;
        }
        sources.push(Source {
            id,
            consumer,
            scratch: Vec::new(),
            produced: 0,
            muted: false,
        });
        tracing::debug!(client_id = id, sources = sources.len(), "Mixer source added");
        true
    }

    /// Deregister and drop a source. Returns whether it existed.
    pub fn remove_source(&self, id: u32) -> bool {
        let mut sources = self.sources.lock();
        let before = sources.len();
        sources.retain(|s| s.id != id);
        let removed = sources.len() != before;
        if removed {
            tracing::debug!(client_id = id, sources = sources.len(), "Mixer source removed");
        }
        removed
    }

    /// Stop a source contributing without dropping its buffer.
    pub fn set_muted(&self, id: u32, muted: bool) {
        if let Some(source) = self.sources.lock().iter_mut().find(|s| s.id == id) {
            source.muted = muted;
        }
    }

    pub fn has_source(&self, id: u32) -> bool {
        self.sources.lock().iter().any(|s| s.id == id)
    }

    pub fn source_count(&self) -> usize {
        self.sources.lock().len()
    }

    /// Read `frame_len` samples from every source once.
    pub fn tick(&self, frame_len: usize) -> MixTick {
        use std::sync::atomic::Ordering;

        let mut sources = self.sources.lock();
        let mut contributions = Vec::with_capacity(sources.len());
        for source in sources.iter_mut() {
            source.scratch.resize(frame_len, 0.0);
            source.produced = source.consumer.read(&mut source.scratch);
            let produced = if source.muted { 0 } else { source.produced };
            contributions.push((source.id, source.scratch.clone(), produced));
        }
        drop(sources);

        let tick = MixTick {
            frame_len,
            contributions,
        };
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.active_last_tick
            .store(tick.active_sources(), Ordering::Relaxed);
        tick
    }

    pub fn stats(&self) -> MixerStats {
        use std::sync::atomic::Ordering;
        MixerStats {
            sources: self.source_count(),
            ticks: self.ticks.load(Ordering::Relaxed),
            active_last_tick: self.active_last_tick.load(Ordering::Relaxed),
        }
    }
}
