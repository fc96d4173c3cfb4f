//! Periodic relay statistics

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::session::SessionStats;
use super::ServerContext;
use crate::audio::MixerStats;

/// Relay-wide totals over all current sessions
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayTotals {
    pub sessions: usize,
    pub connected: u32,
    pub active: u32,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub dropped: u64,
    pub blank_frames_suppressed: u64,
    pub audio_underruns: u64,
    pub mixer: MixerStats,
    pub uptime_secs: u64,
}

pub fn totals(ctx: &ServerContext, sessions: &[SessionStats]) -> RelayTotals {
    let counts = ctx.registry.counts();
    let mut totals = RelayTotals {
        sessions: sessions.len(),
        connected: counts.connected_clients,
        active: counts.active_clients,
        mixer: ctx.mixer.stats(),
        uptime_secs: ctx.uptime().as_secs(),
        ..RelayTotals::default()
    };
    for s in sessions {
        totals.packets_received += s.packets_received;
        totals.packets_sent += s.packets_sent;
        totals.bytes_received += s.bytes_received;
        totals.bytes_sent += s.bytes_sent;
        totals.dropped += s.dropped();
        totals.blank_frames_suppressed += s.blank_frames_suppressed;
        totals.audio_underruns += s.audio_buffer.map(|a| a.underruns).unwrap_or(0);
    }
    totals
}

fn log_session(s: &SessionStats) {
    tracing::info!(
        client_id = s.client_id,
        name = %s.display_name,
        state = ?s.state,
        rx_packets = s.packets_received,
        tx_packets = s.packets_sent,
        dropped = s.dropped(),
        audio_queue = s.audio_queue.depth,
        video_queue = s.video_queue.depth,
        video_ring = s.video_buffer.occupancy,
        frames_in = s.frames_received,
        frames_out = s.frames_composed,
        underruns = s.audio_buffer.map(|a| a.underruns).unwrap_or(0),
        "Session stats"
    );
}

pub fn run_stats_loop(ctx: Arc<ServerContext>) {
    let interval = Duration::from_secs(ctx.config.stats_interval_secs.max(1));
    while !ctx.shutdown.sleep(interval) {
        let sessions = ctx.registry.stats();
        if sessions.is_empty() {
            continue;
        }
        for s in &sessions {
            log_session(s);
        }
        let t = totals(&ctx, &sessions);
        tracing::info!(
            sessions = t.sessions,
            connected = t.connected,
            active = t.active,
            rx_bytes = t.bytes_received,
            tx_bytes = t.bytes_sent,
            dropped = t.dropped,
            underruns = t.audio_underruns,
            "Relay stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::server::session::tests::loopback_writer;
    use crate::server::SessionState;
    use crate::util::Shutdown;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_totals_sum_sessions() {
        let ctx = ServerContext::new(&AppConfig::default(), Shutdown::new());
        let (w1, _p1) = loopback_writer();
        let (w2, _p2) = loopback_writer();
        let a = ctx.registry.admit(w1).unwrap();
        let b = ctx.registry.admit(w2).unwrap();
        a.advance(SessionState::Active);
        b.advance(SessionState::Joined);
        a.counters.packets_received.fetch_add(3, Ordering::Relaxed);
        b.counters.packets_received.fetch_add(4, Ordering::Relaxed);

        let sessions = ctx.registry.stats();
        let t = totals(&ctx, &sessions);
        assert_eq!(t.sessions, 2);
        assert_eq!(t.connected, 2);
        assert_eq!(t.active, 1);
        assert_eq!(t.packets_received, 7);
    }
}
