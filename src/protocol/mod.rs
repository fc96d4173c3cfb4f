//! Binary wire protocol
//!
//! Fixed 18-byte header (magic, type, length, checksum, origin id) followed by
//! a payload whose size is checked against a global maximum and a per-type
//! rule. See [`packet`] for framing and [`messages`] for payload layouts.

pub mod compress;
pub mod crc32;
pub mod messages;
pub mod packet;

pub use messages::{
    AsciiFrame, AudioBatch, CapabilityFlags, ClientJoin, ImageFrame, RenderMode, ServerState,
    StreamTypes, TerminalCapabilities, TerminalSize,
};
pub use packet::{
    Packet, PacketHeader, PacketType, HEADER_SIZE, MAX_PACKET_SIZE, PACKET_MAGIC, SERVER_ID,
};
