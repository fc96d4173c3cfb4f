//! Per-client session state
//!
//! Lifecycle: `Connecting → Joined → Active → Disconnecting → Removed`.
//! States only move forward.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::audio::{RingMonitor, RingStats};
use crate::network::PacketWriter;
use crate::protocol::{CapabilityFlags, RenderMode, TerminalCapabilities, TerminalSize};
use crate::relay::{FrameBufferStats, LastFrameCache, MultiSourceFrameRingBuffer, OutboundQueues, QueueStats};
use crate::video::{RenderOptions, RgbImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Joined = 1,
    Active = 2,
    Disconnecting = 3,
    Removed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Joined,
            2 => SessionState::Active,
            3 => SessionState::Disconnecting,
            _ => SessionState::Removed,
        }
    }

    /// Joined or streaming
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Joined | SessionState::Active)
    }
}

/// Negotiated client description
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionInfo {
    pub display_name: String,
    pub capabilities: CapabilityFlags,
    pub terminal: Option<TerminalCapabilities>,
    /// Cell dimensions; the client receives no frames until this is known
    pub size: Option<TerminalSize>,
    pub video_enabled: bool,
    pub audio_enabled: bool,
}

impl SessionInfo {
    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            color: self.capabilities.color()
                || self.terminal.map(|t| t.color_level > 0).unwrap_or(false),
            mode: self.terminal.map(|t| t.render_mode).unwrap_or(RenderMode::Foreground),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionCounters {
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub audio_samples_received: AtomicU64,
    pub frames_composed: AtomicU64,
    pub blank_frames_suppressed: AtomicU64,
}

/// Serialisable snapshot for logs and the status API
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub client_id: u32,
    pub peer: Option<String>,
    pub state: SessionState,
    pub display_name: String,
    pub video: bool,
    pub audio: bool,
    pub color: bool,
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub connected_at: DateTime<Utc>,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub frames_composed: u64,
    pub blank_frames_suppressed: u64,
    pub audio_samples_received: u64,
    pub audio_queue: QueueStats,
    pub video_queue: QueueStats,
    pub video_buffer: FrameBufferStats,
    pub audio_buffer: Option<RingStats>,
}

impl SessionStats {
    pub fn dropped(&self) -> u64 {
        self.audio_queue.dropped + self.video_queue.dropped
    }
}

/// One connected client
pub struct ClientSession {
    id: u32,
    peer: Option<SocketAddr>,
    writer: Arc<PacketWriter>,
    state: AtomicU8,
    info: RwLock<SessionInfo>,
    pub video_in: MultiSourceFrameRingBuffer<RgbImage>,
    pub last_frame: LastFrameCache<RgbImage>,
    pub outbound: OutboundQueues,
    audio_monitor: Mutex<Option<RingMonitor>>,
    pub counters: SessionCounters,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    pub fn new(
        id: u32,
        writer: Arc<PacketWriter>,
        audio_queue_capacity: usize,
        video_queue_capacity: usize,
        video_ring_capacity: usize,
    ) -> Self {
        Self {
            id,
            peer: writer.peer_addr(),
            writer,
            state: AtomicU8::new(SessionState::Connecting as u8),
            info: RwLock::new(SessionInfo::default()),
            video_in: MultiSourceFrameRingBuffer::new(video_ring_capacity),
            last_frame: LastFrameCache::new(),
            outbound: OutboundQueues::new(audio_queue_capacity, video_queue_capacity),
            audio_monitor: Mutex::new(None),
            counters: SessionCounters::default(),
            connected_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            recv_thread: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn writer(&self) -> &Arc<PacketWriter> {
        &self.writer
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move forward to `next`. Returns false (and changes nothing) if the
    /// session is already at or past it.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= next as u8 {
                return false;
            }
            match self
                .state
                .compare_exchange(current, next as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    tracing::debug!(
                        client_id = self.id,
                        from = ?SessionState::from_u8(current),
                        to = ?next,
                        "Session state change"
                    );
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn info(&self) -> SessionInfo {
        self.info.read().clone()
    }

    pub fn update_info<R>(&self, f: impl FnOnce(&mut SessionInfo) -> R) -> R {
        f(&mut self.info.write())
    }

    pub fn display_name(&self) -> String {
        self.info.read().display_name.clone()
    }

    /// Ready to receive composed frames
    pub fn has_size(&self) -> bool {
        self.info.read().size.is_some()
    }

    pub fn set_audio_monitor(&self, monitor: Option<RingMonitor>) {
        *self.audio_monitor.lock() = monitor;
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn set_recv_thread(&self, handle: JoinHandle<()>) {
        *self.recv_thread.lock() = Some(handle);
    }

    pub fn take_recv_thread(&self) -> Option<JoinHandle<()>> {
        self.recv_thread.lock().take()
    }

    /// Ask the session to end: the receive side sees end-of-stream and runs
    /// the teardown sequence.
    pub fn request_close(&self) {
        self.writer.shutdown_read();
    }

    /// Release buffered media. Part of teardown.
    pub fn release_buffers(&self) -> usize {
        let frames = self.video_in.clear();
        self.last_frame.clear();
        let packets = self.outbound.audio.clear() + self.outbound.video.clear();
        self.set_audio_monitor(None);
        frames + packets
    }

    pub fn stats(&self) -> SessionStats {
        let info = self.info.read().clone();
        let c = &self.counters;
        SessionStats {
            client_id: self.id,
            peer: self.peer.map(|p| p.to_string()),
            state: self.state(),
            display_name: info.display_name.clone(),
            video: info.capabilities.video(),
            audio: info.capabilities.audio(),
            color: info.render_options().color,
            width: info.size.map(|s| s.width),
            height: info.size.map(|s| s.height),
            connected_at: self.connected_at,
            packets_received: c.packets_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            frames_composed: c.frames_composed.load(Ordering::Relaxed),
            blank_frames_suppressed: c.blank_frames_suppressed.load(Ordering::Relaxed),
            audio_samples_received: c.audio_samples_received.load(Ordering::Relaxed),
            audio_queue: self.outbound.audio.stats(),
            video_queue: self.outbound.video.stats(),
            video_buffer: self.video_in.stats(),
            audio_buffer: self.audio_monitor.lock().as_ref().map(|m| m.stats()),
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
