//! Blocking packet transport over TCP
//!
//! Every socket operation runs against a deadline, so a stalled peer can
//! never park a relay thread indefinitely. Writes from several threads are
//! serialised by one lock held across header and payload, so packets never
//! interleave on the wire.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use crate::error::{NetworkError, Result};
use crate::protocol::packet::{verify_checksum, Packet, PacketHeader, HEADER_SIZE};
use crate::util::hex_preview;

/// Payloads above this size get extra time
const LARGE_PACKET_THRESHOLD: usize = 100 * 1024;

/// Extra seconds granted per MB above the threshold
const LARGE_PACKET_EXTRA_SECS_PER_MB: f64 = 0.8;

const MIN_LARGE_PACKET_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LARGE_PACKET_TIMEOUT: Duration = Duration::from_secs(60);

/// Scale a base timeout for large payloads.
pub fn packet_timeout(base: Duration, payload_len: usize) -> Duration {
    if payload_len <= LARGE_PACKET_THRESHOLD {
        return base;
    }
    let extra_mb = (payload_len - LARGE_PACKET_THRESHOLD) as f64 / 1_000_000.0;
    let extra = Duration::from_secs_f64(extra_mb * LARGE_PACKET_EXTRA_SECS_PER_MB + 1.0);
    (base + extra).clamp(MIN_LARGE_PACKET_TIMEOUT, MAX_LARGE_PACKET_TIMEOUT)
}

fn map_io(err: io::Error, op: &'static str) -> NetworkError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => NetworkError::Timeout(op),
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => NetworkError::Closed,
        _ if op == "send" => NetworkError::SendFailed(err.to_string()),
        _ => NetworkError::ReceiveFailed(err.to_string()),
    }
}

fn remaining(deadline: Instant, op: &'static str) -> std::result::Result<Duration, NetworkError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(NetworkError::Timeout(op));
    }
    Ok(left)
}

/// Write all of `data` before `deadline`.
fn write_all_deadline(stream: &mut TcpStream, mut data: &[u8], deadline: Instant) -> std::result::Result<(), NetworkError> {
    while !data.is_empty() {
        let left = remaining(deadline, "send")?;
        stream
            .set_write_timeout(Some(left))
            .map_err(|e| map_io(e, "send"))?;
        match stream.write(data) {
            Ok(0) => return Err(NetworkError::Closed),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(map_io(e, "send")),
        }
    }
    Ok(())
}

/// Fill `buf` before `deadline`. Returns the number of bytes read, which is
/// short only when the peer closed the stream.
fn read_full_deadline(stream: &mut TcpStream, buf: &mut [u8], deadline: Instant) -> std::result::Result<usize, NetworkError> {
    let mut filled = 0;
    while filled < buf.len() {
        let left = remaining(deadline, "receive")?;
        stream
            .set_read_timeout(Some(left))
            .map_err(|e| map_io(e, "receive"))?;
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(map_io(e, "receive")),
        }
    }
    Ok(filled)
}

/// Apply the socket options every relay connection uses.
pub fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let socket = socket2::SockRef::from(stream);
    socket.set_keepalive(true)?;
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    socket.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Connect with a bounded timeout.
pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let domain = socket2::Domain::for_address(addr);
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket
        .connect_timeout(&addr.into(), timeout)
        .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))?;
    let stream: TcpStream = socket.into();
    configure_stream(&stream)?;
    Ok(stream)
}

/// Sending half. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct PacketWriter {
    stream: Mutex<TcpStream>,
    /// Second handle so shutdown never waits behind a blocked send
    control: Option<TcpStream>,
    timeout: Duration,
}

impl PacketWriter {
    pub fn new(stream: TcpStream, timeout: Duration) -> Self {
        Self {
            control: stream.try_clone().ok(),
            stream: Mutex::new(stream),
            timeout,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.control.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Send header then payload as two deadline-bounded writes under one lock.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        let header = packet.header();
        if packet.payload.len() > crate::protocol::MAX_PACKET_SIZE {
            return Err(crate::error::ProtocolError::TooLarge {
                len: packet.payload.len(),
                max: crate::protocol::MAX_PACKET_SIZE,
            }
            .into());
        }
        let timeout = packet_timeout(self.timeout, packet.payload.len());

        let mut stream = self.stream.lock();
        write_all_deadline(&mut stream, &header.to_bytes(), Instant::now() + timeout)?;
        if !packet.payload.is_empty() {
            write_all_deadline(&mut stream, &packet.payload, Instant::now() + timeout)?;
        }
        Ok(())
    }

    /// Force-close both directions, unblocking any thread mid-receive.
    pub fn shutdown(&self) {
        self.shutdown_how(Shutdown::Both);
    }

    /// Close the read side only: a blocked receiver sees end-of-stream while
    /// queued packets can still be written.
    pub fn shutdown_read(&self) {
        self.shutdown_how(Shutdown::Read);
    }

    fn shutdown_how(&self, how: Shutdown) {
        match &self.control {
            Some(stream) => {
                let _ = stream.shutdown(how);
            }
            None => {
                let _ = self.stream.lock().shutdown(how);
            }
        }
    }
}

/// Receiving half, owned by exactly one thread.
#[derive(Debug)]
pub struct PacketReader {
    stream: TcpStream,
    timeout: Duration,
    /// Reused payload storage; split-off payloads return their space once dropped
    buf: BytesMut,
}

impl PacketReader {
    pub fn new(stream: TcpStream, timeout: Duration) -> Self {
        Self {
            stream,
            timeout,
            buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Receive one packet. `Ok(None)` means the peer closed cleanly between packets.
    pub fn recv(&mut self) -> Result<Option<Packet>> {
        let mut raw = [0u8; HEADER_SIZE];
        let got = read_full_deadline(&mut self.stream, &mut raw, Instant::now() + self.timeout)?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_SIZE {
            return Err(NetworkError::ReceiveFailed(format!(
                "partial packet header: {}/{} bytes",
                got, HEADER_SIZE
            ))
            .into());
        }

        let header = PacketHeader::from_bytes(&raw);
        let (packet_type, len) = header.validate().map_err(|e| {
            tracing::warn!("Rejecting packet header: {} (raw: {})", e, hex_preview(&raw, HEADER_SIZE));
            e
        })?;

        let payload = if len == 0 {
            crate::protocol::packet::verify_checksum(&[], header.checksum)?;
            Bytes::new()
        } else {
            self.buf.clear();
            self.buf.resize(len, 0);
            let deadline = Instant::now() + packet_timeout(self.timeout, len);
            let got = read_full_deadline(&mut self.stream, &mut self.buf[..], deadline)?;
            if got < len {
                return Err(NetworkError::ReceiveFailed(format!(
                    "partial {} payload: {}/{} bytes",
                    packet_type.name(),
                    got,
                    len
                ))
                .into());
            }
            if let Err(e) = verify_checksum(&self.buf, header.checksum) {
                tracing::error!(
                    packet_type = packet_type.name(),
                    len,
                    "Checksum mismatch, possible stream desync; first bytes: {}",
                    hex_preview(&self.buf, 16)
                );
                return Err(e.into());
            }
            self.buf.split().freeze()
        };

        Ok(Some(Packet {
            packet_type,
            client_id: header.client_id,
            payload,
        }))
    }
}

/// Split a connected stream into independently owned halves.
pub fn split(stream: TcpStream, recv_timeout: Duration, send_timeout: Duration) -> io::Result<(PacketReader, PacketWriter)> {
    let read_half = stream.try_clone()?;
    Ok((
        PacketReader::new(read_half, recv_timeout),
        PacketWriter::new(stream, send_timeout),
    ))
}
