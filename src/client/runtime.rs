//! Client runtime: reconnect loop, media pump and receive dispatch
//!
//! Each connection gets one receive loop (on the caller's thread) and one
//! pump thread that sends media and keepalives. Local media sources outlive
//! connections: the pump thread hands them back when it exits.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::connection::{handshake, Backoff, ConnectionHandle, ConnectionState};
use super::terminal::FrameSink;
use crate::audio::processing::resample_linear;
use crate::audio::{AudioConsumer, AudioProducer};
use crate::config::{AudioConfig, ClientConfig};
use crate::constants::{AUDIO_BATCH_COUNT, AUDIO_BATCH_SAMPLES};
use crate::error::{Error, NetworkError, Result};
use crate::network::{connect, split, PacketReader, PacketWriter};
use crate::protocol::messages::decode_samples;
use crate::protocol::{AsciiFrame, AudioBatch, ImageFrame, Packet, PacketType, ServerState};
use crate::util::Shutdown;
use crate::video::VideoSource;

/// Pump thread cadence
const PUMP_INTERVAL: Duration = Duration::from_millis(5);

/// Local media, moved into the pump thread for the life of a connection
#[derive(Default)]
pub struct Media {
    pub video: Option<Box<dyn VideoSource>>,
    /// Processed capture samples to send
    pub audio_out: Option<AudioConsumer>,
}

/// Why a connection ended
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(Error),
}

pub struct Client {
    config: ClientConfig,
    sample_rate: u32,
    handle: ConnectionHandle,
    media: Option<Media>,
    /// Network mix into local playback
    playback: Option<AudioProducer>,
    sink: Box<dyn FrameSink>,
    shutdown: Arc<Shutdown>,
    last_state: Option<ServerState>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        audio: &AudioConfig,
        handle: ConnectionHandle,
        sink: Box<dyn FrameSink>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            config,
            sample_rate: audio.sample_rate,
            handle,
            media: Some(Media::default()),
            playback: None,
            sink,
            shutdown,
            last_state: None,
        }
    }

    pub fn with_video(mut self, source: Box<dyn VideoSource>) -> Self {
        if let Some(media) = self.media.as_mut() {
            media.video = Some(source);
        }
        self
    }

    pub fn with_audio(mut self, outbound: Option<AudioConsumer>, playback: Option<AudioProducer>) -> Self {
        if let Some(media) = self.media.as_mut() {
            media.audio_out = outbound;
        }
        self.playback = playback;
        self
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    fn server_addr(&self) -> Result<SocketAddr> {
        (self.config.server_address.as_str(), self.config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                NetworkError::ConnectionFailed(format!(
                    "{}:{} did not resolve",
                    self.config.server_address, self.config.port
                ))
                .into()
            })
    }

    /// Connect, stream, and reconnect with backoff until shutdown or until
    /// `max_reconnect_attempts` consecutive failures.
    pub fn run(&mut self) -> Result<()> {
        let mut backoff = Backoff::from_config(&self.config);
        while !self.shutdown.is_triggered() {
            self.handle.set_state(ConnectionState::Connecting);
            let end = match self.open() {
                Ok((reader, writer)) => {
                    backoff.reset();
                    self.run_connection(reader, writer)
                }
                Err(e) => SessionEnd::Lost(e),
            };
            self.handle.detach();

            let error = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(e) => e,
            };
            if self.shutdown.is_triggered() {
                break;
            }

            let delay = backoff.next_delay();
            let limit = self.config.max_reconnect_attempts;
            if limit > 0 && backoff.attempt() >= limit {
                tracing::error!(attempts = backoff.attempt(), "Giving up: {}", error);
                return Err(NetworkError::ConnectionFailed(format!(
                    "giving up after {} attempts: {}",
                    backoff.attempt(),
                    error
                ))
                .into());
            }
            tracing::warn!(
                attempt = backoff.attempt(),
                "Connection lost ({}), reconnecting in {:.1}s",
                error,
                delay.as_secs_f32()
            );
            if self.shutdown.sleep(delay) {
                break;
            }
        }
        tracing::info!("Client stopped");
        Ok(())
    }

    fn open(&mut self) -> Result<(PacketReader, Arc<PacketWriter>)> {
        let addr = self.server_addr()?;
        let stream = connect(addr, Duration::from_millis(self.config.connect_timeout_ms))?;
        let (reader, writer) = split(
            stream,
            Duration::from_millis(self.config.idle_timeout_ms),
            Duration::from_millis(self.config.connect_timeout_ms),
        )?;
        let writer = Arc::new(writer);
        handshake(&writer, &self.config, self.handle.terminal_size())?;

        self.handle.attach(Arc::clone(&writer));
        self.handle.set_state(ConnectionState::Connected);
        self.last_state = None;
        tracing::info!(%addr, name = %self.config.display_name, "Connected to relay");
        Ok((reader, writer))
    }

    fn run_connection(&mut self, mut reader: PacketReader, writer: Arc<PacketWriter>) -> SessionEnd {
        let stop = Shutdown::new();
        let media = self.media.take().unwrap_or_default();
        let pump = {
            let writer = Arc::clone(&writer);
            let stop = Arc::clone(&stop);
            let shutdown = Arc::clone(&self.shutdown);
            let handle = self.handle.clone();
            let keepalive = Duration::from_millis(self.config.keepalive_interval_ms);
            let sample_rate = self.sample_rate;
            thread::Builder::new()
                .name("client-pump".into())
                .spawn(move || pump(media, &writer, &stop, &shutdown, &handle, keepalive, sample_rate))
        };
        let pump = match pump {
            Ok(pump) => pump,
            Err(e) => {
                // media went down with the failed closure
                self.media = Some(Media::default());
                return SessionEnd::Lost(e.into());
            }
        };

        let end = loop {
            if self.shutdown.is_triggered() {
                break SessionEnd::Shutdown;
            }
            match reader.recv() {
                Ok(Some(packet)) => {
                    if let Err(e) = self.dispatch(packet, &writer) {
                        break SessionEnd::Lost(e);
                    }
                }
                Ok(None) => break SessionEnd::Lost(NetworkError::Closed.into()),
                Err(e) => break SessionEnd::Lost(e),
            }
        };
        let end = if self.shutdown.is_triggered() { SessionEnd::Shutdown } else { end };

        stop.trigger();
        writer.shutdown();
        self.media = Some(pump.join().unwrap_or_else(|_| {
            tracing::error!("Media pump panicked");
            Media::default()
        }));
        end
    }

    fn dispatch(&mut self, packet: Packet, writer: &PacketWriter) -> Result<()> {
        match packet.packet_type {
            PacketType::AsciiFrame => {
                let frame = AsciiFrame::decode(packet.payload)?;
                self.sink.show_frame(&frame)?;
            }
            PacketType::AudioBatch => {
                let batch = AudioBatch::decode(&packet.payload)?;
                self.play(batch.samples, batch.sample_rate);
            }
            PacketType::Audio => {
                let samples = decode_samples(&packet.payload)?;
                self.play(samples, self.sample_rate);
            }
            PacketType::ServerState => {
                let state = ServerState::decode(&packet.payload)?;
                if self
                    .last_state
                    .map_or(true, |s| s.connected_clients != state.connected_clients)
                {
                    self.sink.clear()?;
                }
                self.last_state = Some(state);
                self.sink.server_state(state);
            }
            PacketType::ClearConsole => self.sink.clear()?,
            PacketType::Ping => writer.send(&Packet::new(PacketType::Pong, 0, bytes::Bytes::new()))?,
            PacketType::Pong => {}
            PacketType::ClientLeave => {
                let reason = String::from_utf8_lossy(&packet.payload).into_owned();
                return Err(NetworkError::Rejected(reason).into());
            }
            other => {
                tracing::debug!(packet_type = other.name(), "Ignoring unexpected packet");
            }
        }
        Ok(())
    }

    fn play(&mut self, samples: Vec<f32>, rate: u32) {
        let Some(playback) = self.playback.as_mut() else {
            return;
        };
        if rate != self.sample_rate {
            playback.write(&resample_linear(&samples, rate, self.sample_rate));
        } else {
            playback.write(&samples);
        }
    }
}

/// Send local media and keepalives until `stop` or shutdown. A send failure
/// closes the socket so the receive loop notices.
fn pump(
    mut media: Media,
    writer: &PacketWriter,
    stop: &Shutdown,
    shutdown: &Shutdown,
    handle: &ConnectionHandle,
    keepalive: Duration,
    sample_rate: u32,
) -> Media {
    let started = Instant::now();
    let mut last_ping = Instant::now();
    let mut batch = vec![0.0f32; AUDIO_BATCH_SAMPLES];

    let result: Result<()> = (|| {
        while !stop.is_triggered() {
            if shutdown.is_triggered() {
                let leave = Packet::new(PacketType::ClientLeave, 0, &b"client shutting down"[..]);
                let _ = writer.send(&leave);
                return Ok(());
            }

            if let Some(video) = media.video.as_mut() {
                if let Some(image) = video.next_frame() {
                    let frame = ImageFrame {
                        width: image.width(),
                        height: image.height(),
                        timestamp: started.elapsed().as_millis() as u32,
                        pixels: image.data().clone(),
                    };
                    writer.send(&Packet::new(PacketType::ImageFrame, 0, frame.encode()))?;
                    handle.set_state(ConnectionState::Streaming);
                }
            }

            if let Some(audio) = media.audio_out.as_mut() {
                while audio.available() >= AUDIO_BATCH_SAMPLES {
                    audio.read(&mut batch);
                    let packet = AudioBatch {
                        batch_count: AUDIO_BATCH_COUNT as u32,
                        sample_rate,
                        channels: 1,
                        samples: batch.clone(),
                    };
                    writer.send(&Packet::new(PacketType::AudioBatch, 0, packet.encode()))?;
                    handle.set_state(ConnectionState::Streaming);
                }
            }

            if last_ping.elapsed() >= keepalive {
                writer.send(&Packet::new(PacketType::Ping, 0, bytes::Bytes::new()))?;
                last_ping = Instant::now();
            }

            stop.sleep(PUMP_INTERVAL);
        }
        Ok(())
    })();

    if let Err(e) = result {
        tracing::warn!("Media pump stopped: {}", e);
    }
    writer.shutdown();
    media
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::terminal::TerminalSink;
    use crate::network::PacketReader;
    use crate::protocol::{ClientJoin, TerminalSize};
    use std::net::TcpListener;

    #[test]
    fn test_gives_up_after_max_attempts_with_backoff() {
        // Reserve a port, then close it so every connect is refused.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let config = ClientConfig {
            server_address: "127.0.0.1".into(),
            port,
            reconnect_base_ms: 20,
            reconnect_max_ms: 1_000,
            max_reconnect_attempts: 4,
            connect_timeout_ms: 200,
            ..ClientConfig::default()
        };
        let handle = ConnectionHandle::new(TerminalSize { width: 80, height: 24 });
        let mut client = Client::new(
            config,
            &AudioConfig::default(),
            handle.clone(),
            Box::new(TerminalSink::new(Vec::new())),
            Shutdown::new(),
        );

        let started = Instant::now();
        assert!(client.run().is_err());
        let elapsed = started.elapsed();
        // waits of 20 + 40 + 80 ms between the four attempts
        assert!(elapsed >= Duration::from_millis(140), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1_500), "{:?}", elapsed);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(handle.connect_count(), 0);
    }

    #[test]
    fn test_handshake_then_server_leave_triggers_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = Shutdown::new();

        let server = {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = PacketReader::new(stream.try_clone().unwrap(), Duration::from_secs(2));
                let join = reader.recv().unwrap().unwrap();
                assert_eq!(join.packet_type, PacketType::ClientJoin);
                let join = ClientJoin::decode(&join.payload).unwrap();
                assert_eq!(join.display_name, "tester");

                let writer = PacketWriter::new(stream, Duration::from_secs(1));
                writer
                    .send(&Packet::new(PacketType::ClientLeave, 0, &b"server full"[..]))
                    .unwrap();
                // second connection proves the client came back
                let _ = listener.accept().unwrap();
                shutdown.trigger();
            })
        };

        let config = ClientConfig {
            server_address: "127.0.0.1".into(),
            port,
            display_name: "tester".into(),
            send_video: false,
            send_audio: false,
            reconnect_base_ms: 10,
            reconnect_max_ms: 50,
            ..ClientConfig::default()
        };
        let handle = ConnectionHandle::new(TerminalSize { width: 80, height: 24 });
        let mut client = Client::new(
            config,
            &AudioConfig::default(),
            handle.clone(),
            Box::new(TerminalSink::new(Vec::new())),
            shutdown,
        );
        client.run().unwrap();
        server.join().unwrap();
        assert!(handle.connect_count() >= 1);
    }
}
