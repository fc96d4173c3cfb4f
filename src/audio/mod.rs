//! Audio subsystem module

pub mod backend;
pub mod buffer;
pub mod device;
pub mod engine;
pub mod mixer;
pub mod processing;
pub mod source;

pub use backend::{AudioBackend, CpalBackend, MemoryBackend, MemoryDriver};
pub use buffer::{AudioConsumer, AudioProducer, AudioRingBuffer, RingConfig, RingMonitor, RingStats};
pub use device::{list_devices, probe_default_devices, DeviceFormat, DeviceProbe};
pub use engine::{negotiate, AudioEngine, EngineStats, StreamMode, StreamPlan};
pub use mixer::{MixTick, Mixer, MixerStats};
pub use source::{BufferSource, MediaSource, ToneSource};
