//! Video composition and audio mixing loops
//!
//! Both loops only enqueue; the per-client send threads do the socket work.
//! A full queue drops the packet (counted) and the loop moves on.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::compose::Composition;
use super::ServerContext;
use crate::constants::DRAIN_OCCUPANCY_RATIO;
use crate::protocol::{AudioBatch, Packet, PacketType, ServerState, SERVER_ID};
use crate::util::LogThrottle;
use crate::video::RgbImage;

static VIDEO_DROPS: LogThrottle = LogThrottle::new(200);
static AUDIO_DROPS: LogThrottle = LogThrottle::new(500);

/// What one composition tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoTickReport {
    pub sources: usize,
    pub frames_enqueued: usize,
    pub frames_dropped: usize,
    pub blank_suppressed: usize,
    pub not_ready: usize,
    pub state_broadcast: bool,
}

/// Base period from `video_fps`, halved while any client's inbound video
/// ring is more than [`DRAIN_OCCUPANCY_RATIO`] full.
pub fn frame_interval(ctx: &ServerContext) -> Duration {
    let base = Duration::from_secs(1) / ctx.config.video_fps.max(1);
    let backlogged = ctx
        .registry
        .snapshot()
        .iter()
        .any(|s| s.video_in.occupancy_ratio() > DRAIN_OCCUPANCY_RATIO);
    if backlogged {
        base / 2
    } else {
        base
    }
}

/// Composition loop state
#[derive(Debug, Default)]
pub struct VideoBroadcaster {
    last_state: Option<ServerState>,
    ticks: u64,
}

impl VideoBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick(&mut self, ctx: &ServerContext) -> VideoTickReport {
        self.ticks += 1;
        let mut report = VideoTickReport::default();
        let sessions = ctx.registry.connected();

        let state = ctx.registry.counts();
        if self.last_state != Some(state) {
            tracing::debug!(
                connected = state.connected_clients,
                active = state.active_clients,
                "Broadcasting server state"
            );
            for session in &sessions {
                let _ = session.outbound.video.enqueue(state.to_packet());
            }
            self.last_state = Some(state);
            report.state_broadcast = true;
        }

        // One read per source per tick, however many recipients there are.
        let sources: Vec<RgbImage> = sessions
            .iter()
            .filter(|s| s.info().video_enabled)
            .filter_map(|s| s.last_frame.fresh_or_cached(&s.video_in))
            .collect();
        report.sources = sources.len();

        for session in &sessions {
            match ctx.compositor.compose_for(&sources, &session.info()) {
                Composition::Frame(frame) => {
                    if session.outbound.video.enqueue(frame.to_packet()).is_ok() {
                        session.counters.frames_composed.fetch_add(1, Ordering::Relaxed);
                        report.frames_enqueued += 1;
                    } else {
                        report.frames_dropped += 1;
                        if VIDEO_DROPS.should_log() {
                            tracing::warn!(
                                client_id = session.id(),
                                dropped = session.outbound.video.dropped(),
                                "Video relay queue full, frame dropped"
                            );
                        }
                    }
                }
                Composition::Blank => {
                    session.counters.blank_frames_suppressed.fetch_add(1, Ordering::Relaxed);
                    report.blank_suppressed += 1;
                }
                Composition::NotReady => report.not_ready += 1,
                Composition::NoSources => {}
            }
        }
        report
    }
}

pub fn run_video_loop(ctx: Arc<ServerContext>) {
    tracing::info!(fps = ctx.config.video_fps, "Video broadcast loop started");
    let mut broadcaster = VideoBroadcaster::new();
    while !ctx.shutdown.is_triggered() {
        let started = Instant::now();
        let interval = frame_interval(&ctx);
        broadcaster.tick(&ctx);
        let elapsed = started.elapsed();
        if elapsed < interval {
            ctx.shutdown.sleep(interval - elapsed);
        }
    }
    tracing::info!(ticks = broadcaster.ticks(), "Video broadcast loop stopped");
}

/// Samples consumed from each source per mixing tick
pub fn mix_frame_len(ctx: &ServerContext) -> usize {
    (ctx.audio.sample_rate as u64 * ctx.config.audio_mix_interval_ms / 1000).max(1) as usize
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioTickReport {
    pub active_sources: usize,
    pub batches_enqueued: usize,
    pub batches_dropped: usize,
}

/// Mix once and hand every audio-capable client its exclude-self mix.
pub fn audio_tick(ctx: &ServerContext, frame_len: usize) -> AudioTickReport {
    let tick = ctx.mixer.tick(frame_len);
    let mut report = AudioTickReport {
        active_sources: tick.active_sources(),
        ..AudioTickReport::default()
    };
    if report.active_sources == 0 {
        return report;
    }

    for session in ctx.registry.connected() {
        if !session.info().capabilities.audio() {
            continue;
        }
        let batch = AudioBatch {
            batch_count: 1,
            sample_rate: ctx.audio.sample_rate,
            channels: 1,
            samples: tick.excluding(session.id()),
        };
        let packet = Packet::new(PacketType::AudioBatch, SERVER_ID, batch.encode());
        match session.outbound.audio.enqueue(packet) {
            Ok(()) => report.batches_enqueued += 1,
            Err(e) => {
                report.batches_dropped += 1;
                if AUDIO_DROPS.should_log() {
                    tracing::warn!(client_id = session.id(), "Audio mix dropped: {}", e);
                }
            }
        }
    }
    report
}

pub fn run_audio_loop(ctx: Arc<ServerContext>) {
    let interval = Duration::from_millis(ctx.config.audio_mix_interval_ms.max(1));
    let frame_len = mix_frame_len(&ctx);
    tracing::info!(interval_ms = interval.as_millis() as u64, frame_len, "Audio mix loop started");

    let mut next = Instant::now() + interval;
    while !ctx.shutdown.is_triggered() {
        audio_tick(&ctx, frame_len);

        let now = Instant::now();
        if now > next + interval * 4 {
            tracing::debug!("Audio mix loop fell behind, resynchronising");
            next = now;
        }
        if next > now {
            ctx.shutdown.sleep(next - now);
        }
        next += interval;
    }
    tracing::info!("Audio mix loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioRingBuffer;
    use crate::config::AppConfig;
    use crate::protocol::{CapabilityFlags, TerminalSize};
    use crate::server::session::tests::loopback_writer;
    use crate::server::session::{ClientSession, SessionState};
    use crate::util::Shutdown;
    use std::net::TcpStream;

    fn context() -> ServerContext {
        let mut config = AppConfig::default();
        config.audio.jitter_threshold = 0;
        config.audio.crossfade_samples = 0;
        ServerContext::new(&config, Shutdown::new())
    }

    fn joined(ctx: &ServerContext, video: bool, audio: bool) -> (Arc<ClientSession>, TcpStream) {
        let (writer, peer) = loopback_writer();
        let session = ctx.registry.admit(writer).unwrap();
        session.update_info(|info| {
            info.display_name = format!("client{}", session.id());
            info.capabilities = CapabilityFlags::new(video, audio, false, false);
            info.video_enabled = video;
            info.audio_enabled = audio;
        });
        session.advance(SessionState::Joined);
        (session, peer)
    }

    fn drain_video(session: &ClientSession) -> Vec<Packet> {
        std::iter::from_fn(|| session.outbound.video.try_dequeue()).collect()
    }

    #[test]
    fn test_server_state_sent_once_per_change() {
        let ctx = context();
        let (a, _pa) = joined(&ctx, true, false);
        let mut broadcaster = VideoBroadcaster::new();

        assert!(broadcaster.tick(&ctx).state_broadcast);
        let packets = drain_video(&a);
        assert_eq!(packets.len(), 1);
        let state = ServerState::decode(&packets[0].payload).unwrap();
        assert_eq!(state.connected_clients, 1);

        assert!(!broadcaster.tick(&ctx).state_broadcast);
        let (_b, _pb) = joined(&ctx, true, false);
        assert!(broadcaster.tick(&ctx).state_broadcast);
    }

    #[test]
    fn test_unsized_client_is_skipped() {
        let ctx = context();
        let (a, _pa) = joined(&ctx, true, false);
        a.video_in.write(a.id(), 0, RgbImage::solid(8, 8, [255, 255, 255]));

        let report = VideoBroadcaster::new().tick(&ctx);
        assert_eq!(report.sources, 1);
        assert_eq!(report.not_ready, 1);
        assert_eq!(report.frames_enqueued, 0);
    }

    #[test]
    fn test_blank_frame_never_enqueued() {
        let ctx = context();
        let (a, _pa) = joined(&ctx, true, false);
        a.update_info(|info| info.size = Some(TerminalSize { width: 40, height: 12 }));
        a.video_in.write(a.id(), 0, RgbImage::solid(8, 8, [0, 0, 0]));

        let mut broadcaster = VideoBroadcaster::new();
        let report = broadcaster.tick(&ctx);
        assert_eq!(report.blank_suppressed, 1);
        assert_eq!(report.frames_enqueued, 0);
        let packets = drain_video(&a);
        assert!(packets.iter().all(|p| p.packet_type != PacketType::AsciiFrame));
    }

    #[test]
    fn test_frame_composed_for_sized_client() {
        let ctx = context();
        let (a, _pa) = joined(&ctx, true, false);
        let (b, _pb) = joined(&ctx, true, false);
        a.update_info(|info| info.size = Some(TerminalSize { width: 40, height: 12 }));
        b.video_in.write(b.id(), 0, RgbImage::solid(8, 8, [255, 255, 255]));

        let report = VideoBroadcaster::new().tick(&ctx);
        assert_eq!(report.sources, 1);
        assert_eq!(report.frames_enqueued, 1);
        assert_eq!(report.not_ready, 1);
        assert!(drain_video(&a).iter().any(|p| p.packet_type == PacketType::AsciiFrame));
    }

    #[test]
    fn test_cached_frame_reused_between_ticks() {
        let ctx = context();
        let (a, _pa) = joined(&ctx, true, false);
        a.update_info(|info| info.size = Some(TerminalSize { width: 20, height: 10 }));
        a.video_in.write(a.id(), 0, RgbImage::solid(8, 8, [255, 255, 255]));

        let mut broadcaster = VideoBroadcaster::new();
        assert_eq!(broadcaster.tick(&ctx).sources, 1);
        assert_eq!(broadcaster.tick(&ctx).sources, 1);
        assert_eq!(a.counters.frames_composed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_frame_interval_doubles_under_backlog() {
        let ctx = context();
        let base = frame_interval(&ctx);
        let (a, _pa) = joined(&ctx, true, false);
        for i in 0..10 {
            a.video_in.write(a.id(), i, RgbImage::solid(2, 2, [0, 0, 0]));
        }
        assert_eq!(frame_interval(&ctx), base / 2);
    }

    #[test]
    fn test_exclude_self_mix() {
        let ctx = context();
        let frame_len = 4;
        let mut producers = Vec::new();
        let mut sessions = Vec::new();
        for level in [0.1f32, 0.2, 0.4] {
            let (session, peer) = joined(&ctx, false, true);
            let (mut producer, consumer) = AudioRingBuffer::playback(&ctx.audio);
            ctx.mixer.add_source(session.id(), consumer);
            producer.write(&[level; 4]);
            producers.push(producer);
            sessions.push((session, peer));
        }

        let report = audio_tick(&ctx, frame_len);
        assert_eq!(report.active_sources, 3);
        assert_eq!(report.batches_enqueued, 3);

        let expected = [0.6f32, 0.5, 0.3];
        for ((session, _), want) in sessions.iter().zip(expected) {
            let packet = session.outbound.audio.try_dequeue().unwrap();
            let batch = AudioBatch::decode(&packet.payload).unwrap();
            assert_eq!(batch.samples.len(), frame_len);
            assert!(batch.samples.iter().all(|s| (s - want).abs() < 1e-6));
        }
    }

    #[test]
    fn test_lone_source_receives_silence() {
        let ctx = context();
        let (session, _peer) = joined(&ctx, false, true);
        let (mut producer, consumer) = AudioRingBuffer::playback(&ctx.audio);
        ctx.mixer.add_source(session.id(), consumer);
        producer.write(&[0.5; 8]);

        audio_tick(&ctx, 8);
        let packet = session.outbound.audio.try_dequeue().unwrap();
        let batch = AudioBatch::decode(&packet.payload).unwrap();
        assert!(batch.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_no_active_sources_sends_nothing() {
        let ctx = context();
        let (session, _peer) = joined(&ctx, false, true);
        let report = audio_tick(&ctx, 8);
        assert_eq!(report, AudioTickReport::default());
        assert!(session.outbound.audio.is_empty());
    }

    #[test]
    fn test_mix_frame_len_matches_interval() {
        let ctx = context();
        assert_eq!(mix_frame_len(&ctx), 288);
    }
}
