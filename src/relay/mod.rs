//! Per-client relay buffering
//!
//! Outbound: two bounded [`RelayQueue`]s per session (audio, video/control)
//! with best-effort drop semantics. Inbound: one
//! [`MultiSourceFrameRingBuffer`] per session holding the client's own
//! video until the compositor consumes it.

pub mod frame_buffer;
pub mod queue;

pub use frame_buffer::{
    drain_count, Drained, FrameBufferStats, LastFrameCache, MultiSourceFrameRingBuffer, TaggedFrame,
};
pub use queue::{OutboundQueues, QueueStats, RelayQueue, Wakeup};
