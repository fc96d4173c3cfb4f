//! Typed payloads for each packet type
//!
//! Every payload is decoded field by field from a byte slice and validated
//! before a typed value is built. Nothing here reinterprets a received buffer
//! as a record.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::compress;
use super::crc32::crc32;
use super::packet::{Packet, PacketType, SERVER_ID};
use crate::constants::{DISPLAY_NAME_FIELD_LEN, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};
use crate::error::ProtocolError;

/// client-join payload size: id + name field + capabilities
pub const CLIENT_JOIN_SIZE: usize = 4 + DISPLAY_NAME_FIELD_LEN + 4;

/// server-state payload size: two counters + six reserved words
pub const SERVER_STATE_SIZE: usize = 32;

/// Shared header size of image and ascii frame payloads
pub const FRAME_HEADER_SIZE: usize = 24;

/// audio-batch header: batch_count, total_samples, sample_rate, channels
pub const AUDIO_BATCH_HEADER_SIZE: usize = 16;

/// Fixed size of the capabilities record emitted by this implementation
pub const CAPABILITIES_SIZE: usize = 12;

/// Largest accepted image dimension
pub const MAX_IMAGE_DIMENSION: u32 = 4096;

/// Bytes per RGB24 pixel
pub const RGB_BYTES: usize = 3;

fn need(buf: &[u8], n: usize, what: &str) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        return Err(ProtocolError::Malformed(format!(
            "{} needs {} bytes, got {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Client capability bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct CapabilityFlags(pub u32);

impl CapabilityFlags {
    pub const VIDEO: u32 = 0x01;
    pub const AUDIO: u32 = 0x02;
    pub const COLOR: u32 = 0x04;
    pub const STRETCH: u32 = 0x08;

    pub fn new(video: bool, audio: bool, color: bool, stretch: bool) -> Self {
        let mut flags = 0;
        if video {
            flags |= Self::VIDEO;
        }
        if audio {
            flags |= Self::AUDIO;
        }
        if color {
            flags |= Self::COLOR;
        }
        if stretch {
            flags |= Self::STRETCH;
        }
        Self(flags)
    }

    pub fn video(&self) -> bool {
        self.0 & Self::VIDEO != 0
    }

    pub fn audio(&self) -> bool {
        self.0 & Self::AUDIO != 0
    }

    pub fn color(&self) -> bool {
        self.0 & Self::COLOR != 0
    }

    pub fn stretch(&self) -> bool {
        self.0 & Self::STRETCH != 0
    }
}

/// Media stream bitmask used by stream-start/stream-stop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamTypes(pub u32);

impl StreamTypes {
    pub const VIDEO: u32 = 0x01;
    pub const AUDIO: u32 = 0x02;

    pub fn video(&self) -> bool {
        self.0 & Self::VIDEO != 0
    }

    pub fn audio(&self) -> bool {
        self.0 & Self::AUDIO != 0
    }

    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_be_bytes())
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        need(payload, 4, "stream control")?;
        Ok(Self(payload.get_u32()))
    }
}

/// client-join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientJoin {
    pub client_id: u32,
    pub display_name: String,
    pub capabilities: CapabilityFlags,
}

impl ClientJoin {
    /// Names longer than the wire field are cut at a character boundary.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CLIENT_JOIN_SIZE);
        buf.put_u32(self.client_id);

        let name = truncate_utf8(&self.display_name, DISPLAY_NAME_FIELD_LEN);
        let mut field = [0u8; DISPLAY_NAME_FIELD_LEN];
        field[..name.len()].copy_from_slice(name.as_bytes());
        buf.put_slice(&field);

        buf.put_u32(self.capabilities.0);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != CLIENT_JOIN_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "client-join must be {} bytes, got {}",
                CLIENT_JOIN_SIZE,
                payload.len()
            )));
        }
        let client_id = payload.get_u32();
        let mut field = [0u8; DISPLAY_NAME_FIELD_LEN];
        payload.copy_to_slice(&mut field);
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let display_name = String::from_utf8_lossy(&field[..end]).into_owned();
        let capabilities = CapabilityFlags(payload.get_u32());

        Ok(Self {
            client_id,
            display_name,
            capabilities,
        })
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// How the client's terminal wants frames rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum RenderMode {
    #[default]
    Foreground = 0,
    Background = 1,
    HalfBlock = 2,
}

impl From<u8> for RenderMode {
    fn from(value: u8) -> Self {
        match value {
            1 => RenderMode::Background,
            2 => RenderMode::HalfBlock,
            _ => RenderMode::Foreground,
        }
    }
}

/// client-capabilities: terminal description plus capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminalCapabilities {
    pub flags: CapabilityFlags,
    pub width: u16,
    pub height: u16,
    pub color_level: u8,
    pub render_mode: RenderMode,
    pub utf8: bool,
    pub desired_fps: u8,
}

impl TerminalCapabilities {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CAPABILITIES_SIZE);
        buf.put_u32(self.flags.0);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u8(self.color_level);
        buf.put_u8(self.render_mode as u8);
        buf.put_u8(u8::from(self.utf8));
        buf.put_u8(self.desired_fps);
        buf.freeze()
    }

    /// Trailing bytes beyond the known record are ignored for forward compatibility.
    pub fn decode(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        need(payload, CAPABILITIES_SIZE, "client-capabilities")?;
        Ok(Self {
            flags: CapabilityFlags(payload.get_u32()),
            width: payload.get_u16(),
            height: payload.get_u16(),
            color_level: payload.get_u8(),
            render_mode: RenderMode::from(payload.get_u8()),
            utf8: payload.get_u8() != 0,
            desired_fps: payload.get_u8(),
        })
    }
}

/// server-state: broadcast when connected/active counts change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerState {
    pub connected_clients: u32,
    pub active_clients: u32,
}

impl ServerState {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SERVER_STATE_SIZE);
        buf.put_u32(self.connected_clients);
        buf.put_u32(self.active_clients);
        buf.put_bytes(0, SERVER_STATE_SIZE - 8);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        need(payload, 8, "server-state")?;
        Ok(Self {
            connected_clients: payload.get_u32(),
            active_clients: payload.get_u32(),
        })
    }

    pub fn to_packet(&self) -> Packet {
        Packet::new(PacketType::ServerState, SERVER_ID, self.encode())
    }
}

/// audio-batch: several packets' worth of f32 samples in one payload
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBatch {
    pub batch_count: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub samples: Vec<f32>,
}

impl AudioBatch {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(AUDIO_BATCH_HEADER_SIZE + self.samples.len() * 4);
        buf.put_u32(self.batch_count);
        buf.put_u32(self.samples.len() as u32);
        buf.put_u32(self.sample_rate);
        buf.put_u32(self.channels);
        for &sample in &self.samples {
            buf.put_f32(sample);
        }
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        need(payload, AUDIO_BATCH_HEADER_SIZE, "audio-batch header")?;
        let batch_count = payload.get_u32();
        let total_samples = payload.get_u32() as usize;
        let sample_rate = payload.get_u32();
        let channels = payload.get_u32();

        if total_samples == 0 || payload.remaining() != total_samples * 4 {
            return Err(ProtocolError::Malformed(format!(
                "audio-batch declares {} samples but carries {} bytes",
                total_samples,
                payload.remaining()
            )));
        }
        if channels == 0 || channels > 8 || !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
            return Err(ProtocolError::Malformed(format!(
                "audio-batch format {} Hz x {} channels",
                sample_rate, channels
            )));
        }

        let samples = (0..total_samples).map(|_| payload.get_f32()).collect();
        Ok(Self {
            batch_count,
            sample_rate,
            channels,
            samples,
        })
    }
}

/// Raw f32 samples carried by an audio packet
pub fn encode_samples(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 4);
    for &sample in samples {
        buf.put_f32(sample);
    }
    buf.freeze()
}

pub fn decode_samples(mut payload: &[u8]) -> Result<Vec<f32>, ProtocolError> {
    if payload.len() % 4 != 0 {
        return Err(ProtocolError::Malformed(format!(
            "audio payload of {} bytes is not a whole number of samples",
            payload.len()
        )));
    }
    let mut samples = Vec::with_capacity(payload.len() / 4);
    while payload.has_remaining() {
        samples.push(payload.get_f32());
    }
    Ok(samples)
}

/// Frame payload header flag: frame bytes carry ANSI colour
pub const FRAME_FLAG_COLOR: u32 = 0x01;

/// Frame bytes as carried on the wire: compressed when that pays off.
/// Returns the body and the compressed size (0 when sent raw).
fn frame_body(data: &[u8]) -> (Bytes, u32) {
    match compress::maybe_compress(data) {
        Some(compressed) => {
            let size = compressed.len() as u32;
            (Bytes::from(compressed), size)
        }
        None => (Bytes::copy_from_slice(data), 0),
    }
}

fn decode_body(body: Bytes, compressed_size: u32, original_size: usize, checksum: u32) -> Result<Bytes, ProtocolError> {
    let data = if compressed_size > 0 {
        if body.len() != compressed_size as usize {
            return Err(ProtocolError::Malformed(format!(
                "compressed frame declares {} bytes, carries {}",
                compressed_size,
                body.len()
            )));
        }
        Bytes::from(compress::decompress(&body, original_size)?)
    } else {
        body
    };

    if data.len() != original_size {
        return Err(ProtocolError::Malformed(format!(
            "frame data is {} bytes, expected {}",
            data.len(),
            original_size
        )));
    }
    let calculated = crc32(&data);
    if calculated != checksum {
        return Err(ProtocolError::ChecksumMismatch {
            calculated,
            expected: checksum,
        });
    }
    Ok(data)
}

/// image-frame: a raw RGB24 camera frame submitted by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFrame {
    pub width: u32,
    pub height: u32,
    pub timestamp: u32,
    pub pixels: Bytes,
}

impl ImageFrame {
    pub const PIXEL_FORMAT_RGB24: u32 = 0;

    pub fn encode(&self) -> Bytes {
        let (body, compressed_size) = frame_body(&self.pixels);
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
        buf.put_u32(self.width);
        buf.put_u32(self.height);
        buf.put_u32(Self::PIXEL_FORMAT_RGB24);
        buf.put_u32(compressed_size);
        buf.put_u32(crc32(&self.pixels));
        buf.put_u32(self.timestamp);
        buf.put_slice(&body);
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        Self::decode_limited(payload, MAX_IMAGE_DIMENSION as usize * MAX_IMAGE_DIMENSION as usize)
    }

    /// Decode, rejecting frames that declare more than `max_pixels` before
    /// anything is decompressed.
    pub fn decode_limited(payload: Bytes, max_pixels: usize) -> Result<Self, ProtocolError> {
        need(&payload, FRAME_HEADER_SIZE, "image-frame header")?;
        let mut header = &payload[..FRAME_HEADER_SIZE];
        let width = header.get_u32();
        let height = header.get_u32();
        let pixel_format = header.get_u32();
        let compressed_size = header.get_u32();
        let checksum = header.get_u32();
        let timestamp = header.get_u32();

        if width == 0 || height == 0 || width > MAX_IMAGE_DIMENSION || height > MAX_IMAGE_DIMENSION {
            return Err(ProtocolError::Malformed(format!(
                "image dimensions {}x{} out of range",
                width, height
            )));
        }
        if width as usize * height as usize > max_pixels {
            return Err(ProtocolError::Malformed(format!(
                "image {}x{} exceeds the {} pixel limit",
                width, height, max_pixels
            )));
        }
        if pixel_format != Self::PIXEL_FORMAT_RGB24 {
            return Err(ProtocolError::Malformed(format!(
                "unsupported pixel format {}",
                pixel_format
            )));
        }

        let expected = width as usize * height as usize * RGB_BYTES;
        let pixels = decode_body(payload.slice(FRAME_HEADER_SIZE..), compressed_size, expected, checksum)?;
        Ok(Self {
            width,
            height,
            timestamp,
            pixels,
        })
    }
}

/// ascii-frame: a rendered character frame for one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiFrame {
    pub width: u32,
    pub height: u32,
    pub flags: u32,
    pub data: Bytes,
}

impl AsciiFrame {
    pub fn encode(&self) -> Bytes {
        let (body, compressed_size) = frame_body(&self.data);
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
        buf.put_u32(self.width);
        buf.put_u32(self.height);
        buf.put_u32(self.data.len() as u32);
        buf.put_u32(compressed_size);
        buf.put_u32(crc32(&self.data));
        buf.put_u32(self.flags);
        buf.put_slice(&body);
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        need(&payload, FRAME_HEADER_SIZE, "ascii-frame header")?;
        let mut header = &payload[..FRAME_HEADER_SIZE];
        let width = header.get_u32();
        let height = header.get_u32();
        let original_size = header.get_u32() as usize;
        let compressed_size = header.get_u32();
        let checksum = header.get_u32();
        let flags = header.get_u32();

        if original_size > super::packet::MAX_PACKET_SIZE {
            return Err(ProtocolError::TooLarge {
                len: original_size,
                max: super::packet::MAX_PACKET_SIZE,
            });
        }

        let data = decode_body(payload.slice(FRAME_HEADER_SIZE..), compressed_size, original_size, checksum)?;
        Ok(Self {
            width,
            height,
            flags,
            data,
        })
    }

    pub fn to_packet(&self) -> Packet {
        Packet::new(PacketType::AsciiFrame, SERVER_ID, self.encode())
    }
}

/// Legacy text size negotiation: `SIZE:<width>,<height>\n`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

impl TerminalSize {
    const PREFIX: &'static [u8] = b"SIZE:";

    pub fn encode(&self) -> Bytes {
        Bytes::from(format!("SIZE:{},{}\n", self.width, self.height))
    }

    /// Defensive parse: prefix match, bounded digit runs, no overflow,
    /// optional trailing newline and nothing else.
    pub fn parse(message: &[u8]) -> Result<Self, ProtocolError> {
        let bad = |why: &str| ProtocolError::Malformed(format!("size message: {}", why));

        let rest = message
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| bad("missing SIZE: prefix"))?;
        let rest = rest.strip_suffix(b"\n").unwrap_or(rest);

        let comma = rest
            .iter()
            .position(|&b| b == b',')
            .ok_or_else(|| bad("missing comma"))?;
        let width = parse_u16(&rest[..comma]).ok_or_else(|| bad("invalid width"))?;
        let height = parse_u16(&rest[comma + 1..]).ok_or_else(|| bad("invalid height"))?;

        if width == 0 || height == 0 {
            return Err(bad("zero dimension"));
        }
        Ok(Self { width, height })
    }
}

fn parse_u16(digits: &[u8]) -> Option<u16> {
    if digits.is_empty() || digits.len() > 5 || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let value = digits
        .iter()
        .try_fold(0u32, |acc, &d| acc.checked_mul(10)?.checked_add(u32::from(d - b'0')))?;
    u16::try_from(value).ok()
}
