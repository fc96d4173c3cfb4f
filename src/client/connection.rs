//! Client connection state and reconnect policy
//!
//! ```text
//! Disconnected ──▶ Connecting ──▶ Connected ──▶ Streaming
//!      ▲                │              │             │
//!      └──── backoff ◀──┴──────────────┴─────────────┘  (I/O failure)
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::{NetworkError, Result};
use crate::network::PacketWriter;
use crate::protocol::{
    CapabilityFlags, ClientJoin, Packet, PacketType, RenderMode, TerminalCapabilities, TerminalSize,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    /// Joined, no media sent yet
    Connected = 2,
    Streaming = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Streaming,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Wait before the next attempt after `attempt` consecutive failures:
/// `min(base * 2^(attempt-1), cap)`.
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Exponential backoff over consecutive failures
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempt: 0,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_max_ms),
        )
    }

    /// Record a failure and return how long to wait.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        reconnect_delay(self.attempt, self.base, self.cap)
    }

    /// Called on a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

struct Shared {
    state: AtomicU8,
    writer: Mutex<Option<Arc<PacketWriter>>>,
    size: Mutex<TerminalSize>,
    connects: AtomicU32,
}

/// Cloneable view of the live connection, for resize watchers and status.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn new(size: TerminalSize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                writer: Mutex::new(None),
                size: Mutex::new(size),
                connects: AtomicU32::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.shared.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            tracing::debug!(from = ?ConnectionState::from_u8(previous), to = ?state, "Connection state");
        }
    }

    pub fn terminal_size(&self) -> TerminalSize {
        *self.shared.size.lock()
    }

    /// Successful connects over the handle's lifetime
    pub fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::Relaxed)
    }

    pub(crate) fn attach(&self, writer: Arc<PacketWriter>) {
        *self.shared.writer.lock() = Some(writer);
        self.shared.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn detach(&self) {
        if let Some(writer) = self.shared.writer.lock().take() {
            writer.shutdown();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Send on the live connection, if any.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        let writer = self.shared.writer.lock().clone();
        match writer {
            Some(writer) => writer.send(packet),
            None => Err(NetworkError::Closed.into()),
        }
    }

    /// Record a new terminal size and push it to the server immediately.
    /// Returns whether an update was sent.
    pub fn notify_resize(&self, size: TerminalSize) -> bool {
        {
            let mut current = self.shared.size.lock();
            if *current == size {
                return false;
            }
            *current = size;
        }
        match self.send(&Packet::new(PacketType::SizeUpdate, 0, size.encode())) {
            Ok(()) => {
                tracing::debug!(width = size.width, height = size.height, "Sent size update");
                true
            }
            Err(e) => {
                tracing::debug!("Size update deferred until reconnect: {}", e);
                false
            }
        }
    }

    /// Force the live connection closed; the runtime reconnects.
    pub fn disconnect(&self) {
        if let Some(writer) = self.shared.writer.lock().as_ref() {
            writer.shutdown();
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &self.state())
            .field("size", &self.terminal_size())
            .finish()
    }
}

pub fn capabilities(config: &ClientConfig) -> CapabilityFlags {
    CapabilityFlags::new(config.send_video, config.send_audio, config.color, config.stretch)
}

/// Join, describe the terminal, then report its size.
pub fn handshake(writer: &PacketWriter, config: &ClientConfig, size: TerminalSize) -> Result<()> {
    let flags = capabilities(config);
    let join = ClientJoin {
        client_id: 0,
        display_name: config.display_name.clone(),
        capabilities: flags,
    };
    writer.send(&Packet::new(PacketType::ClientJoin, 0, join.encode()))?;

    let terminal = TerminalCapabilities {
        flags,
        width: size.width,
        height: size.height,
        color_level: if config.color { 3 } else { 0 },
        render_mode: RenderMode::Foreground,
        utf8: true,
        desired_fps: config.desired_fps,
    };
    writer.send(&Packet::new(PacketType::ClientCapabilities, 0, terminal.encode()))?;
    writer.send(&Packet::new(PacketType::SizeUpdate, 0, size.encode()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_doubles_to_cap() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);
        let waits: Vec<u64> = (1..=6).map(|k| reconnect_delay(k, base, cap).as_secs()).collect();
        assert_eq!(waits, vec![1, 2, 4, 8, 16, 30]);
        assert_eq!(reconnect_delay(40, base, cap), cap);
    }

    #[test]
    fn test_backoff_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.attempt(), 3);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_resize_without_connection() {
        let handle = ConnectionHandle::new(TerminalSize { width: 80, height: 24 });
        assert!(!handle.notify_resize(TerminalSize { width: 80, height: 24 }));
        assert!(!handle.notify_resize(TerminalSize { width: 100, height: 30 }));
        assert_eq!(handle.terminal_size(), TerminalSize { width: 100, height: 30 });
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_resize_sends_immediately() {
        use crate::network::PacketReader;
        use std::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let handle = ConnectionHandle::new(TerminalSize { width: 80, height: 24 });
        handle.attach(Arc::new(PacketWriter::new(client, Duration::from_secs(1))));
        assert!(handle.notify_resize(TerminalSize { width: 120, height: 40 }));

        let mut reader = PacketReader::new(server, Duration::from_secs(1));
        let packet = reader.recv().unwrap().unwrap();
        assert_eq!(packet.packet_type, PacketType::SizeUpdate);
        assert_eq!(
            TerminalSize::parse(&packet.payload).unwrap(),
            TerminalSize { width: 120, height: 40 }
        );
    }
}
