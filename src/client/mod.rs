//! Relay client
//!
//! [`connection`] holds the state machine and reconnect policy, [`runtime`]
//! drives one connection at a time, [`terminal`] draws what arrives.

pub mod connection;
pub mod runtime;
pub mod terminal;

pub use connection::{reconnect_delay, Backoff, ConnectionHandle, ConnectionState};
pub use runtime::{Client, Media};
pub use terminal::{terminal_size, FrameSink, TerminalSink};
