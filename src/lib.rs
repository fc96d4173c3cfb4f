//! # Terminal Relay
//!
//! Real-time multi-participant terminal video/audio chat relay over TCP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────┐                ┌──────────────────────────────────────────────┐
//! │           CLIENT             │                │                   SERVER                     │
//! │                              │                │                                              │
//! │  ┌────────┐   ┌───────────┐  │   packets      │  ┌──────────────┐   ┌─────────────────────┐  │
//! │  │ Video  │   │   Audio   │  │ ─────────────▶ │  │ recv thread  │──▶│ ClientSession       │  │
//! │  │ Source │   │  Engine   │  │  (protocol)    │  │ per client   │   │  video ring buffer  │  │
//! │  └───┬────┘   └─────┬─────┘  │                │  └──────────────┘   │  audio ring buffer  │  │
//! │      │   callback ──┤        │                │                     └─────────┬───────────┘  │
//! │      │   worker  ◀──┘        │                │                               │              │
//! │      ▼                       │                │  ┌────────────────────────────▼───────────┐  │
//! │  ┌──────────────────────┐    │                │  │ broadcast loop   (compose, render)     │  │
//! │  │ Connection state     │    │                │  │ mix loop         (exclude-self mix)    │  │
//! │  │ machine + keepalive  │    │                │  └────────────────────────────┬───────────┘  │
//! │  └──────────┬───────────┘    │                │                               ▼              │
//! │             │                │   packets      │  ┌──────────────┐   ┌─────────────────────┐  │
//! │  terminal ◀─┘                │ ◀───────────── │  │ send thread  │◀──│ relay queues        │  │
//! │                              │                │  │ per client   │   │  audio / video      │  │
//! └──────────────────────────────┘                │  └──────────────┘   └─────────────────────┘  │
//!                                                 └──────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod ui;
pub mod util;
pub mod video;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Accepted sample rates on the wire
    pub const MIN_SAMPLE_RATE: u32 = 8_000;
    pub const MAX_SAMPLE_RATE: u32 = 192_000;

    /// Default channel count (mono voice)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Frames per device callback
    pub const FRAMES_PER_BUFFER: usize = 256;

    /// Samples carried by one audio packet
    pub const AUDIO_SAMPLES_PER_PACKET: usize = 256;

    /// Audio packets aggregated into one batch
    pub const AUDIO_BATCH_COUNT: usize = 4;

    /// Samples per audio batch
    pub const AUDIO_BATCH_SAMPLES: usize = AUDIO_SAMPLES_PER_PACKET * AUDIO_BATCH_COUNT;

    /// Default TCP port for the relay
    pub const DEFAULT_PORT: u16 = 27224;

    /// Default HTTP port for the status API
    pub const DEFAULT_UI_PORT: u16 = 8080;

    /// Default client capacity
    pub const DEFAULT_MAX_CLIENTS: usize = 9;

    /// Display name field width on the wire
    pub const DISPLAY_NAME_FIELD_LEN: usize = 32;

    /// Largest grid the compositor builds (3x3)
    pub const MAX_GRID_SOURCES: usize = 9;

    /// Video ring buffer occupancy ratio at which the drain policy kicks in
    pub const DRAIN_OCCUPANCY_RATIO: f64 = 0.3;

    /// Upper bound of frames discarded in one composition tick
    pub const MAX_FRAMES_DRAINED_PER_TICK: usize = 20;

    /// Audio ring buffer capacity in samples
    pub const AUDIO_RING_BUFFER_SIZE: usize = 8192;

    /// Samples required before playback starts
    pub const AUDIO_JITTER_THRESHOLD: usize = 2048;

    /// Below this occupancy the consumer pads with silence
    pub const AUDIO_LOW_WATER_MARK: usize = 512;

    /// Above this occupancy incoming writes are truncated
    pub const AUDIO_HIGH_WATER_MARK: usize = 6144;

    /// Occupancy the high-water truncation aims for
    pub const AUDIO_TARGET_OCCUPANCY: usize = 4096;

    /// Fade-in length at playback start
    pub const AUDIO_CROSSFADE_SAMPLES: usize = 256;
}
