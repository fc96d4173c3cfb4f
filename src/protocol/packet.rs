//! Packet header and framing
//!
//! Wire layout (18 bytes, network byte order), payload follows immediately:
//!
//! ```text
//! +--------+------+--------+----------+-----------+
//! | magic  | type | length | checksum | client_id |
//! |   4B   |  2B  |   4B   |    4B    |    4B     |
//! +--------+------+--------+----------+-----------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::crc32::crc32;
use crate::error::ProtocolError;

/// Sentinel at the start of every packet
pub const PACKET_MAGIC: u32 = 0xDEAD_BEEF;

/// Encoded header length
pub const HEADER_SIZE: usize = 18;

/// Largest payload accepted in either direction
pub const MAX_PACKET_SIZE: usize = 5 * 1024 * 1024;

/// Origin id used for packets produced by the server
pub const SERVER_ID: u32 = 0;

/// Closed set of packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    /// Rendered character frame, server to client
    AsciiFrame = 2,
    /// Raw RGB camera frame, client to server
    ImageFrame = 3,
    Audio = 4,
    ClientCapabilities = 5,
    Ping = 6,
    Pong = 7,
    ClientJoin = 8,
    ClientLeave = 9,
    StreamStart = 10,
    StreamStop = 11,
    ClearConsole = 12,
    ServerState = 13,
    AudioBatch = 25,
    /// Terminal size in the legacy `SIZE:w,h` text form
    SizeUpdate = 26,
}

/// Payload length constraint for one packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthRule {
    Exact(usize),
    Range { min: usize, max: usize },
}

impl LengthRule {
    pub fn allows(&self, len: usize) -> bool {
        match *self {
            LengthRule::Exact(n) => len == n,
            LengthRule::Range { min, max } => len >= min && len <= max,
        }
    }
}

impl std::fmt::Display for LengthRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LengthRule::Exact(n) => write!(f, "expected exactly {}", n),
            LengthRule::Range { min, max } => write!(f, "expected {}..={}", min, max),
        }
    }
}

impl PacketType {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::AsciiFrame => "ascii-frame",
            PacketType::ImageFrame => "image-frame",
            PacketType::Audio => "audio",
            PacketType::ClientCapabilities => "client-capabilities",
            PacketType::Ping => "ping",
            PacketType::Pong => "pong",
            PacketType::ClientJoin => "client-join",
            PacketType::ClientLeave => "client-leave",
            PacketType::StreamStart => "stream-start",
            PacketType::StreamStop => "stream-stop",
            PacketType::ClearConsole => "clear-console",
            PacketType::ServerState => "server-state",
            PacketType::AudioBatch => "audio-batch",
            PacketType::SizeUpdate => "size-update",
        }
    }

    /// Per-type payload size rule enforced on receive
    pub fn length_rule(self) -> LengthRule {
        use super::messages::{
            AUDIO_BATCH_HEADER_SIZE, CLIENT_JOIN_SIZE, FRAME_HEADER_SIZE, SERVER_STATE_SIZE,
        };
        use crate::constants::AUDIO_SAMPLES_PER_PACKET;

        match self {
            PacketType::AsciiFrame | PacketType::ImageFrame => LengthRule::Range {
                min: FRAME_HEADER_SIZE,
                max: MAX_PACKET_SIZE,
            },
            PacketType::Audio => LengthRule::Range {
                min: 1,
                max: AUDIO_SAMPLES_PER_PACKET * 4 * 2,
            },
            PacketType::ClientCapabilities => LengthRule::Range { min: 0, max: 1024 },
            PacketType::Ping | PacketType::Pong => LengthRule::Range { min: 0, max: 64 },
            PacketType::ClientJoin => LengthRule::Exact(CLIENT_JOIN_SIZE),
            PacketType::ClientLeave => LengthRule::Range { min: 0, max: 256 },
            PacketType::StreamStart | PacketType::StreamStop => LengthRule::Exact(4),
            PacketType::ClearConsole => LengthRule::Exact(0),
            PacketType::ServerState => LengthRule::Exact(SERVER_STATE_SIZE),
            PacketType::AudioBatch => LengthRule::Range {
                min: AUDIO_BATCH_HEADER_SIZE + 4,
                max: MAX_PACKET_SIZE,
            },
            PacketType::SizeUpdate => LengthRule::Range { min: 1, max: 32 },
        }
    }

    /// Audio goes through the latency-critical relay queue
    pub fn is_audio(self) -> bool {
        matches!(self, PacketType::Audio | PacketType::AudioBatch)
    }
}

impl TryFrom<u16> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            2 => PacketType::AsciiFrame,
            3 => PacketType::ImageFrame,
            4 => PacketType::Audio,
            5 => PacketType::ClientCapabilities,
            6 => PacketType::Ping,
            7 => PacketType::Pong,
            8 => PacketType::ClientJoin,
            9 => PacketType::ClientLeave,
            10 => PacketType::StreamStart,
            11 => PacketType::StreamStop,
            12 => PacketType::ClearConsole,
            13 => PacketType::ServerState,
            25 => PacketType::AudioBatch,
            26 => PacketType::SizeUpdate,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// Decoded but unvalidated header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u32,
    pub packet_type: u16,
    pub length: u32,
    pub checksum: u32,
    pub client_id: u32,
}

impl PacketHeader {
    pub fn for_payload(packet_type: PacketType, client_id: u32, payload: &[u8]) -> Self {
        Self {
            magic: PACKET_MAGIC,
            packet_type: packet_type.as_u16(),
            length: payload.len() as u32,
            checksum: payload_checksum(payload),
            client_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32(self.magic);
        buf.put_u16(self.packet_type);
        buf.put_u32(self.length);
        buf.put_u32(self.checksum);
        buf.put_u32(self.client_id);
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut buf = &bytes[..];
        Self {
            magic: buf.get_u32(),
            packet_type: buf.get_u16(),
            length: buf.get_u32(),
            checksum: buf.get_u32(),
            client_id: buf.get_u32(),
        }
    }

    /// Check magic first (desync), then the global maximum, then the
    /// per-type rule. Returns the typed packet kind and payload length.
    pub fn validate(&self) -> Result<(PacketType, usize), ProtocolError> {
        if self.magic != PACKET_MAGIC {
            return Err(ProtocolError::BadMagic {
                found: self.magic,
                expected: PACKET_MAGIC,
            });
        }

        let len = self.length as usize;
        if len > MAX_PACKET_SIZE {
            return Err(ProtocolError::TooLarge {
                len,
                max: MAX_PACKET_SIZE,
            });
        }

        let packet_type = PacketType::try_from(self.packet_type)?;
        let rule = packet_type.length_rule();
        if !rule.allows(len) {
            return Err(ProtocolError::InvalidLength {
                packet: packet_type.name(),
                len,
                rule: rule.to_string(),
            });
        }

        Ok((packet_type, len))
    }
}

/// Checksum carried in the header; empty payloads carry zero.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        0
    } else {
        crc32(payload)
    }
}

/// Compare a received payload against the header checksum.
pub fn verify_checksum(payload: &[u8], expected: u32) -> Result<(), ProtocolError> {
    let calculated = payload_checksum(payload);
    if calculated != expected {
        return Err(ProtocolError::ChecksumMismatch {
            calculated,
            expected,
        });
    }
    Ok(())
}

/// One framed, checksummed unit of the protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    /// Origin client, 0 for the server
    pub client_id: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, client_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            client_id,
            payload: payload.into(),
        }
    }

    /// Payload-less packet from the server
    pub fn control(packet_type: PacketType) -> Self {
        Self::new(packet_type, SERVER_ID, Bytes::new())
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader::for_payload(self.packet_type, self.client_id, &self.payload)
    }

    /// Header followed by payload in one contiguous buffer.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if self.payload.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::TooLarge {
                len: self.payload.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header().to_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode one complete packet from a buffer, applying every receive-side check.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "buffer of {} bytes is shorter than the header",
                data.len()
            )));
        }
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&data[..HEADER_SIZE]);
        let header = PacketHeader::from_bytes(&raw);
        let (packet_type, len) = header.validate()?;

        let body = &data[HEADER_SIZE..];
        if body.len() != len {
            return Err(ProtocolError::Malformed(format!(
                "payload is {} bytes, header says {}",
                body.len(),
                len
            )));
        }
        verify_checksum(body, header.checksum)?;

        Ok(Self {
            packet_type,
            client_id: header.client_id,
            payload: Bytes::copy_from_slice(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_TYPES: [PacketType; 14] = [
        PacketType::AsciiFrame,
        PacketType::ImageFrame,
        PacketType::Audio,
        PacketType::ClientCapabilities,
        PacketType::Ping,
        PacketType::Pong,
        PacketType::ClientJoin,
        PacketType::ClientLeave,
        PacketType::StreamStart,
        PacketType::StreamStop,
        PacketType::ClearConsole,
        PacketType::ServerState,
        PacketType::AudioBatch,
        PacketType::SizeUpdate,
    ];

    /// A payload length that satisfies the type's rule, derived from `seed`.
    fn valid_len(packet_type: PacketType, seed: usize) -> usize {
        match packet_type.length_rule() {
            LengthRule::Exact(n) => n,
            LengthRule::Range { min, max } => min + seed % (max.min(min + 512) - min + 1),
        }
    }

    #[test]
    fn test_header_layout() {
        let header = PacketHeader {
            magic: PACKET_MAGIC,
            packet_type: 6,
            length: 0,
            checksum: 0,
            client_id: 7,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&bytes[4..6], &[0, 6]);
        assert_eq!(&bytes[14..18], &[0, 0, 0, 7]);
        assert_eq!(PacketHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn test_bad_magic_is_checked_first() {
        let header = PacketHeader {
            magic: 0xCAFEBABE,
            packet_type: 999,
            length: u32::MAX,
            checksum: 0,
            client_id: 0,
        };
        assert!(matches!(header.validate(), Err(ProtocolError::BadMagic { .. })));
    }

    #[test]
    fn test_length_rules() {
        let check = |t: PacketType, len: u32| {
            PacketHeader {
                magic: PACKET_MAGIC,
                packet_type: t.as_u16(),
                length: len,
                checksum: 0,
                client_id: 0,
            }
            .validate()
        };

        assert!(check(PacketType::Ping, 64).is_ok());
        assert!(check(PacketType::Ping, 65).is_err());
        assert!(check(PacketType::ClearConsole, 0).is_ok());
        assert!(check(PacketType::ClearConsole, 1).is_err());
        assert!(check(PacketType::ClientJoin, 40).is_ok());
        assert!(check(PacketType::ClientJoin, 39).is_err());
        assert!(check(PacketType::AudioBatch, 19).is_err());
        assert!(check(PacketType::AudioBatch, 20).is_ok());
        assert!(matches!(
            check(PacketType::ImageFrame, (MAX_PACKET_SIZE + 1) as u32),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let header = PacketHeader {
            magic: PACKET_MAGIC,
            packet_type: 14,
            length: 0,
            checksum: 0,
            client_id: 0,
        };
        assert_eq!(header.validate(), Err(ProtocolError::UnknownType(14)));
    }

    #[test]
    fn test_empty_payload_requires_zero_checksum() {
        assert!(verify_checksum(&[], 0).is_ok());
        assert!(verify_checksum(&[], 1).is_err());
    }

    proptest! {
        #[test]
        fn prop_round_trip(type_index in 0usize..ALL_TYPES.len(), seed in any::<usize>(), fill in any::<u8>(), client_id in any::<u32>()) {
            let packet_type = ALL_TYPES[type_index];
            let len = valid_len(packet_type, seed);
            let payload: Vec<u8> = (0..len).map(|i| fill.wrapping_add(i as u8)).collect();
            let packet = Packet::new(packet_type, client_id, payload.clone());

            let encoded = packet.encode().unwrap();
            prop_assert_eq!(encoded.len(), HEADER_SIZE + len);

            let decoded = Packet::decode(&encoded).unwrap();
            prop_assert_eq!(decoded.packet_type, packet_type);
            prop_assert_eq!(decoded.client_id, client_id);
            prop_assert_eq!(&decoded.payload[..], &payload[..]);
            prop_assert_eq!(decoded.header().checksum, payload_checksum(&payload));
        }

        #[test]
        fn prop_single_byte_corruption_rejected(payload in proptest::collection::vec(any::<u8>(), 1..512), index in any::<usize>(), flip in 1u8..=255) {
            let packet = Packet::new(PacketType::ImageFrame, 3, {
                let mut p = vec![0u8; 24];
                p.extend_from_slice(&payload);
                p
            });
            let mut encoded = packet.encode().unwrap().to_vec();
            let target = HEADER_SIZE + index % (encoded.len() - HEADER_SIZE);
            encoded[target] ^= flip;

            let result = Packet::decode(&encoded);
            let is_checksum_mismatch = matches!(result, Err(ProtocolError::ChecksumMismatch { .. }));
            prop_assert!(is_checksum_mismatch);
        }
    }
}
