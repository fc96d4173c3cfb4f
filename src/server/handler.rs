//! Per-connection receive/send threads
//!
//! The receive thread owns the session's lifetime: whatever ends it (peer
//! close, protocol error, timeout, explicit leave, server shutdown), it runs
//! the same teardown sequence:
//!
//! 1. mark the session `Disconnecting`
//! 2. shut the outbound queues down and join the send thread once drained
//! 3. force-close the socket
//! 4. release buffered media and the mixer source
//! 5. drop the session from the registry, mark it `Removed`, publish `Left`

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::events::SessionEvent;
use super::session::{ClientSession, SessionState};
use super::ServerContext;
use crate::audio::processing::{downmix_to_mono, resample_linear};
use crate::audio::{AudioProducer, AudioRingBuffer};
use crate::error::{Error, NetworkError, ProtocolError, RelayError, Result};
use crate::network::{configure_stream, split, PacketReader, PacketWriter};
use crate::protocol::messages::{decode_samples, truncate_utf8};
use crate::protocol::{
    AudioBatch, ClientJoin, ImageFrame, Packet, PacketType, StreamTypes, TerminalCapabilities,
    TerminalSize, SERVER_ID,
};
use crate::util::LogThrottle;
use crate::video::RgbImage;

/// Bounded wait of the send thread between queue polls
const SEND_POLL: Duration = Duration::from_millis(10);

static EARLY_MEDIA: LogThrottle = LogThrottle::new(100);

/// Set up a freshly accepted connection: admission control, then one
/// receive and one send thread.
pub fn accept(ctx: &Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    stream.set_nonblocking(false)?;
    configure_stream(&stream)?;
    let (reader, writer) = split(stream, ctx.config.recv_timeout(), ctx.config.send_timeout())?;
    let writer = Arc::new(writer);

    let session = match ctx.registry.admit(Arc::clone(&writer)) {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(%peer, "Rejecting connection: {}", e);
            reject(&writer, &e.to_string());
            return Err(e.into());
        }
    };
    let id = session.id();
    tracing::info!(client_id = id, %peer, "Client connected");

    let send_thread = {
        let session = Arc::clone(&session);
        thread::Builder::new()
            .name(format!("send-{}", id))
            .spawn(move || send_loop(&session))
    };
    let send_thread = match send_thread {
        Ok(handle) => handle,
        Err(e) => {
            abandon(ctx, &session);
            return Err(RelayError::SpawnFailed(format!("send-{}: {}", id, e)).into());
        }
    };

    let recv_thread = {
        let ctx = Arc::clone(ctx);
        let session = Arc::clone(&session);
        thread::Builder::new()
            .name(format!("recv-{}", id))
            .spawn(move || {
                let reason = recv_loop(&ctx, &session, reader);
                teardown(&ctx, &session, send_thread, &reason);
            })
    };
    match recv_thread {
        Ok(handle) => {
            session.set_recv_thread(handle);
            Ok(())
        }
        Err(e) => {
            // the send thread exits once its queues are shut down and empty
            abandon(ctx, &session);
            Err(RelayError::SpawnFailed(format!("recv-{}: {}", id, e)).into())
        }
    }
}

/// Tell a rejected peer why, then close.
fn reject(writer: &PacketWriter, reason: &str) {
    let leave = Packet::new(PacketType::ClientLeave, SERVER_ID, reason.as_bytes().to_vec());
    if let Err(e) = writer.send(&leave) {
        tracing::debug!("Could not deliver rejection: {}", e);
    }
    writer.shutdown();
}

/// Undo an admission whose threads could not be started.
fn abandon(ctx: &ServerContext, session: &ClientSession) {
    session.advance(SessionState::Disconnecting);
    session.outbound.shutdown();
    session.writer().shutdown();
    ctx.registry.remove(session.id());
    session.advance(SessionState::Removed);
}

/// Drain the outbound queues onto the socket, audio first. Exits once the
/// queues are shut down and empty, or on the first write failure.
fn send_loop(session: &ClientSession) {
    let writer = session.writer();
    loop {
        if let Some(packet) = session.outbound.next() {
            let len = packet.payload.len();
            match writer.send(&packet) {
                Ok(()) => {
                    session.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                    session
                        .counters
                        .bytes_sent
                        .fetch_add((crate::protocol::HEADER_SIZE + len) as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(
                        client_id = session.id(),
                        packet_type = packet.packet_type.name(),
                        "Send failed: {}",
                        e
                    );
                    session.request_close();
                    break;
                }
            }
            continue;
        }
        if session.outbound.audio.is_shut_down() && session.outbound.is_drained() {
            break;
        }
        session.outbound.wait(SEND_POLL);
    }
    tracing::debug!(client_id = session.id(), "Send thread exiting");
}

/// Per-connection receive-side state, owned by the receive thread.
#[derive(Default)]
struct Inbound {
    /// Producer half of this client's mixer input
    audio: Option<AudioProducer>,
}

enum Flow {
    Continue,
    Leave(String),
}

/// Receive and dispatch until the connection ends. Returns the reason.
fn recv_loop(ctx: &ServerContext, session: &ClientSession, mut reader: PacketReader) -> String {
    let mut inbound = Inbound::default();
    loop {
        if ctx.shutdown.is_triggered() {
            return "server shutting down".into();
        }
        let packet = match reader.recv() {
            Ok(Some(packet)) => packet,
            Ok(None) => return "connection closed".into(),
            Err(Error::Network(NetworkError::Timeout(_))) => return "receive timeout".into(),
            Err(e) => {
                tracing::warn!(client_id = session.id(), "Dropping connection: {}", e);
                return e.to_string();
            }
        };

        session.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        session.counters.bytes_received.fetch_add(
            (crate::protocol::HEADER_SIZE + packet.payload.len()) as u64,
            Ordering::Relaxed,
        );
        session.touch();

        let packet_type = packet.packet_type;
        match dispatch(ctx, session, &mut inbound, packet) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Leave(reason)) => return reason,
            Err(e) if e.is_connection_fatal() => {
                tracing::warn!(
                    client_id = session.id(),
                    packet_type = packet_type.name(),
                    "Dropping connection: {}",
                    e
                );
                return e.to_string();
            }
            Err(e) => {
                tracing::debug!(client_id = session.id(), packet_type = packet_type.name(), "{}", e);
            }
        }
    }
}

fn dispatch(ctx: &ServerContext, session: &ClientSession, inbound: &mut Inbound, packet: Packet) -> Result<Flow> {
    let id = session.id();
    let joined = session.state() >= SessionState::Joined;

    match packet.packet_type {
        PacketType::ClientJoin => handle_join(ctx, session, inbound, &packet.payload)?,

        PacketType::ImageFrame | PacketType::Audio | PacketType::AudioBatch
        | PacketType::StreamStart | PacketType::StreamStop
            if !joined =>
        {
            if EARLY_MEDIA.should_log() {
                tracing::warn!(
                    client_id = id,
                    packet_type = packet.packet_type.name(),
                    "Media before client-join dropped ({} total)",
                    EARLY_MEDIA.count()
                );
            }
        }

        PacketType::ImageFrame => {
            if !session.info().video_enabled {
                return Ok(Flow::Continue);
            }
            let frame = ImageFrame::decode_limited(packet.payload, ctx.config.max_image_pixels)?;
            let timestamp = frame.timestamp as u64;
            session.video_in.write(id, timestamp, RgbImage::from(frame));
            session.counters.frames_received.fetch_add(1, Ordering::Relaxed);
            session.advance(SessionState::Active);
        }

        PacketType::Audio => {
            let samples = decode_samples(&packet.payload)?;
            write_audio(session, inbound, &samples);
        }

        PacketType::AudioBatch => {
            let batch = AudioBatch::decode(&packet.payload)?;
            let mut samples = if batch.channels > 1 {
                downmix_to_mono(&batch.samples, batch.channels as u16)
            } else {
                batch.samples
            };
            if batch.sample_rate != ctx.audio.sample_rate {
                samples = resample_linear(&samples, batch.sample_rate, ctx.audio.sample_rate);
            }
            write_audio(session, inbound, &samples);
        }

        PacketType::SizeUpdate => {
            let size = TerminalSize::parse(&packet.payload)?;
            session.update_info(|info| info.size = Some(size));
            tracing::debug!(client_id = id, width = size.width, height = size.height, "Terminal size");
            publish_capabilities(ctx, session);
        }

        PacketType::ClientCapabilities => {
            let caps = TerminalCapabilities::decode(&packet.payload)?;
            session.update_info(|info| {
                info.capabilities = caps.flags;
                info.terminal = Some(caps);
                if caps.width > 0 && caps.height > 0 {
                    info.size = Some(TerminalSize {
                        width: caps.width,
                        height: caps.height,
                    });
                }
            });
            publish_capabilities(ctx, session);
        }

        PacketType::StreamStart | PacketType::StreamStop => {
            let streams = StreamTypes::decode(&packet.payload)?;
            let on = packet.packet_type == PacketType::StreamStart;
            let (video, audio) = session.update_info(|info| {
                if streams.video() {
                    info.video_enabled = on;
                }
                if streams.audio() {
                    info.audio_enabled = on;
                }
                (info.video_enabled, info.audio_enabled)
            });
            ctx.mixer.set_muted(id, !audio);
            if !video {
                session.last_frame.clear();
            }
            ctx.events.publish(SessionEvent::StreamChanged {
                client_id: id,
                video,
                audio,
            });
        }

        PacketType::Ping => {
            let _ = session.outbound.route(Packet::control(PacketType::Pong));
        }
        PacketType::Pong => {}

        PacketType::ClientLeave => {
            let reason = String::from_utf8_lossy(&packet.payload).trim().to_string();
            let reason = if reason.is_empty() { "client left".to_string() } else { reason };
            return Ok(Flow::Leave(reason));
        }

        PacketType::AsciiFrame | PacketType::ServerState | PacketType::ClearConsole => {
            tracing::debug!(
                client_id = id,
                packet_type = packet.packet_type.name(),
                "Ignoring server-to-client packet"
            );
        }
    }
    Ok(Flow::Continue)
}

fn handle_join(ctx: &ServerContext, session: &ClientSession, inbound: &mut Inbound, payload: &[u8]) -> Result<()> {
    let join = ClientJoin::decode(payload)?;
    if session.state() != SessionState::Connecting {
        tracing::warn!(client_id = session.id(), "Duplicate client-join ignored");
        return Ok(());
    }
    if join.display_name.trim().is_empty() {
        return Err(ProtocolError::Malformed("empty display name".into()).into());
    }

    let id = session.id();
    let name = truncate_utf8(&join.display_name, ctx.config.max_display_name_len).to_string();
    let caps = join.capabilities;
    session.update_info(|info| {
        info.display_name = name.clone();
        info.capabilities = caps;
        info.video_enabled = caps.video();
        info.audio_enabled = caps.audio();
    });

    if caps.audio() {
        let (producer, consumer) = AudioRingBuffer::playback(&ctx.audio);
        session.set_audio_monitor(Some(consumer.monitor()));
        if ctx.mixer.add_source(id, consumer) {
            inbound.audio = Some(producer);
        } else {
            tracing::warn!(client_id = id, "Mixer full, client audio will not be relayed");
        }
    }

    session.advance(SessionState::Joined);
    tracing::info!(client_id = id, name = %name, video = caps.video(), audio = caps.audio(), "Client joined");
    ctx.events.publish(SessionEvent::Joined {
        client_id: id,
        display_name: name,
        video: caps.video(),
        audio: caps.audio(),
    });
    Ok(())
}

fn write_audio(session: &ClientSession, inbound: &mut Inbound, samples: &[f32]) {
    if !session.info().audio_enabled {
        return;
    }
    if let Some(producer) = inbound.audio.as_mut() {
        producer.write(samples);
        session
            .counters
            .audio_samples_received
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        session.advance(SessionState::Active);
    }
}

fn publish_capabilities(ctx: &ServerContext, session: &ClientSession) {
    let info = session.info();
    if let Some(size) = info.size {
        ctx.events.publish(SessionEvent::CapabilitiesChanged {
            client_id: session.id(),
            width: size.width,
            height: size.height,
            color: info.render_options().color,
        });
    }
}

fn teardown(ctx: &ServerContext, session: &ClientSession, send_thread: JoinHandle<()>, reason: &str) {
    let id = session.id();
    let was_joined = session.state() >= SessionState::Joined;
    session.advance(SessionState::Disconnecting);

    session.outbound.shutdown();
    if send_thread.join().is_err() {
        tracing::error!(client_id = id, "Send thread panicked");
    }
    session.writer().shutdown();

    let released = session.release_buffers();
    ctx.mixer.remove_source(id);
    ctx.registry.remove(id);
    session.advance(SessionState::Removed);

    tracing::info!(client_id = id, released, "Client disconnected: {}", reason);
    if was_joined {
        ctx.events.publish(SessionEvent::Left {
            client_id: id,
            reason: reason.to_string(),
        });
    }
}
