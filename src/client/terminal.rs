//! Terminal output for received frames

use std::io::{self, Write};

use crate::protocol::{AsciiFrame, ServerState, TerminalSize};

const CURSOR_HOME: &[u8] = b"\x1b[H";
const CLEAR_SCREEN: &[u8] = b"\x1b[2J\x1b[H";

/// Fallback when the environment does not describe the terminal
pub const FALLBACK_SIZE: TerminalSize = TerminalSize { width: 80, height: 24 };

/// Terminal size from `COLUMNS`/`LINES`, falling back to 80x24.
pub fn terminal_size() -> TerminalSize {
    size_from(std::env::var("COLUMNS").ok(), std::env::var("LINES").ok())
}

fn size_from(columns: Option<String>, lines: Option<String>) -> TerminalSize {
    let parse = |v: Option<String>| v.and_then(|s| s.trim().parse::<u16>().ok()).filter(|&n| n > 0);
    TerminalSize {
        width: parse(columns).unwrap_or(FALLBACK_SIZE.width),
        height: parse(lines).unwrap_or(FALLBACK_SIZE.height),
    }
}

/// Receives whatever the server sends for display.
pub trait FrameSink: Send {
    fn show_frame(&mut self, frame: &AsciiFrame) -> io::Result<()>;

    fn clear(&mut self) -> io::Result<()>;

    fn server_state(&mut self, _state: ServerState) {}
}

/// Draws frames over the previous one on any writer (stdout by default).
pub struct TerminalSink<W: Write + Send> {
    out: W,
}

impl TerminalSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write + Send> TerminalSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> FrameSink for TerminalSink<W> {
    fn show_frame(&mut self, frame: &AsciiFrame) -> io::Result<()> {
        self.out.write_all(CURSOR_HOME)?;
        self.out.write_all(&frame.data)?;
        self.out.flush()
    }

    fn clear(&mut self) -> io::Result<()> {
        self.out.write_all(CLEAR_SCREEN)?;
        self.out.flush()
    }

    fn server_state(&mut self, state: ServerState) {
        tracing::debug!(
            connected = state.connected_clients,
            active = state.active_clients,
            "Server state"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_size_from_env_values() {
        assert_eq!(size_from(Some("132".into()), Some("43".into())), TerminalSize { width: 132, height: 43 });
        assert_eq!(size_from(None, Some("x".into())), FALLBACK_SIZE);
        assert_eq!(size_from(Some("0".into()), None), FALLBACK_SIZE);
    }

    #[test]
    fn test_frame_drawn_from_home() {
        let mut sink = TerminalSink::new(Vec::new());
        let frame = AsciiFrame {
            width: 2,
            height: 1,
            flags: 0,
            data: Bytes::from_static(b"MM"),
        };
        sink.show_frame(&frame).unwrap();
        sink.clear().unwrap();
        assert_eq!(sink.into_inner(), b"\x1b[HMM\x1b[2J\x1b[H".to_vec());
    }
}
