//! Error types for the relay

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error must terminate the peer connection it occurred on.
    ///
    /// Resource pressure (full queues) is a best-effort drop and never fatal;
    /// device errors only degrade the audio subsystem.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Error::Protocol(_) => true,
            Error::Network(_) => true,
            Error::Io(_) => true,
            Error::Relay(_) | Error::Audio(_) | Error::Config(_) => false,
        }
    }
}

/// Wire protocol violations. All of them are connection-fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet magic: {found:#010x} (expected {expected:#010x})")]
    BadMagic { found: u32, expected: u32 },

    #[error("Unknown packet type: {0}")]
    UnknownType(u16),

    #[error("Packet too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },

    #[error("Invalid {packet} packet length: {len} ({rule})")]
    InvalidLength {
        packet: &'static str,
        len: usize,
        rule: String,
    },

    #[error("Checksum mismatch: calculated {calculated:#010x}, expected {expected:#010x}")]
    ChecksumMismatch { calculated: u32, expected: u32 },

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Every protocol violation ends the connection; the peer's framing can
    /// no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection rejected: {0}")]
    Rejected(String),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio subsystem disabled")]
    Disabled,

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Relay and session management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Queue full")]
    QueueFull,

    #[error("Queue shut down")]
    QueueShutDown,

    #[error("Server at capacity ({0} clients)")]
    CapacityReached(usize),

    #[error("Session not found: {0}")]
    UnknownSession(u32),

    #[error("Failed to spawn {0} task")]
    SpawnFailed(String),
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;
