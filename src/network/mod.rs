//! Network subsystem for the TCP packet transport

pub mod transport;

pub use transport::{configure_stream, connect, packet_timeout, split, PacketReader, PacketWriter};
