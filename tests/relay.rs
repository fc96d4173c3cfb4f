//! End-to-end relay behaviour over loopback TCP with raw protocol clients.

use bytes::Bytes;
use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use term_relay::client::{Client, ConnectionHandle, TerminalSink};
use term_relay::config::AppConfig;
use term_relay::error::{Error, NetworkError};
use term_relay::network::{split, PacketReader, PacketWriter};
use term_relay::protocol::{
    AsciiFrame, AudioBatch, CapabilityFlags, ClientJoin, ImageFrame, Packet, PacketType,
    ServerState, TerminalSize,
};
use term_relay::server::{Server, ServerHandle, SessionEvent, SessionState};
use term_relay::util::Shutdown;

const WAIT: Duration = Duration::from_secs(3);

fn test_config(max_clients: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.bind_address = "127.0.0.1".into();
    config.server.port = 0;
    config.server.max_clients = max_clients;
    config.server.video_fps = 30;
    config.server.stats_interval_secs = 3600;
    config.audio.jitter_threshold = 0;
    config.audio.crossfade_samples = 0;
    config
}

fn start(config: &AppConfig) -> ServerHandle {
    Server::bind(config, Shutdown::new()).unwrap().spawn().unwrap()
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

fn next_event(events: &mut broadcast::Receiver<SessionEvent>, matches: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
    let deadline = Instant::now() + WAIT;
    loop {
        match events.try_recv() {
            Ok(event) if matches(&event) => return event,
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Empty) => {
                assert!(Instant::now() < deadline, "timed out waiting for event");
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("event stream failed: {}", e),
        }
    }
}

struct TestClient {
    reader: PacketReader,
    writer: PacketWriter,
    /// Extra handle for writing bytes that bypass framing
    raw: TcpStream,
}

impl TestClient {
    fn connect(server: &ServerHandle) -> Self {
        let stream = TcpStream::connect(server.addr()).unwrap();
        let raw = stream.try_clone().unwrap();
        let (reader, writer) = split(stream, WAIT, WAIT).unwrap();
        Self { reader, writer, raw }
    }

    fn join(server: &ServerHandle, name: &str, video: bool, audio: bool) -> Self {
        let mut client = Self::connect(server);
        client.send(
            PacketType::ClientJoin,
            ClientJoin {
                client_id: 0,
                display_name: name.into(),
                capabilities: CapabilityFlags::new(video, audio, false, false),
            }
            .encode(),
        );
        client
    }

    fn send(&mut self, packet_type: PacketType, payload: Bytes) {
        self.writer.send(&Packet::new(packet_type, 0, payload)).unwrap();
    }

    fn resize(&mut self, width: u16, height: u16) {
        self.send(PacketType::SizeUpdate, TerminalSize { width, height }.encode());
    }

    fn send_image(&mut self, rgb: [u8; 3]) {
        let (w, h) = (32u32, 24u32);
        let pixels: Vec<u8> = (0..w * h).flat_map(|_| rgb).collect();
        let frame = ImageFrame {
            width: w,
            height: h,
            timestamp: 0,
            pixels: Bytes::from(pixels),
        };
        self.send(PacketType::ImageFrame, frame.encode());
    }

    fn send_audio(&mut self, level: f32, samples: usize) {
        let batch = AudioBatch {
            batch_count: 1,
            sample_rate: 48_000,
            channels: 1,
            samples: vec![level; samples],
        };
        self.send(PacketType::AudioBatch, batch.encode());
    }

    /// First packet of `packet_type` within the reader timeout.
    fn expect(&mut self, packet_type: PacketType) -> Packet {
        loop {
            match self.reader.recv() {
                Ok(Some(packet)) if packet.packet_type == packet_type => return packet,
                Ok(Some(_)) => {}
                other => panic!("no {} packet: {:?}", packet_type.name(), other.map(|p| p.map(|p| p.packet_type))),
            }
        }
    }

    /// True once the server has closed the connection.
    fn closed(&mut self) -> bool {
        loop {
            match self.reader.recv() {
                Ok(Some(_)) => {}
                Ok(None) => return true,
                Err(Error::Network(NetworkError::Timeout(_))) => return false,
                Err(_) => return true,
            }
        }
    }
}

#[test]
fn test_join_truncates_name_and_broadcasts_state() {
    let server = start(&test_config(4));
    let mut events = server.context().events.subscribe();

    let long_name = "n".repeat(40);
    let mut client = TestClient::join(&server, &long_name, false, false);

    let state = ServerState::decode(&client.expect(PacketType::ServerState).payload).unwrap();
    assert_eq!(state.connected_clients, 1);
    assert_eq!(state.active_clients, 0);

    let session = server.context().registry.snapshot().remove(0);
    assert_eq!(session.display_name().len(), 31);
    assert_eq!(session.state(), SessionState::Joined);

    match next_event(&mut events, |e| matches!(e, SessionEvent::Joined { .. })) {
        SessionEvent::Joined { display_name, .. } => assert_eq!(display_name, "n".repeat(31)),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_every_client_hears_everyone_but_itself() {
    let server = start(&test_config(4));
    let levels = [0.1f32, 0.2, 0.4];
    let mut clients: Vec<TestClient> = levels
        .iter()
        .enumerate()
        .map(|(i, _)| TestClient::join(&server, &format!("c{}", i), false, true))
        .collect();
    wait_for("three joined clients", || {
        server.context().registry.counts().connected_clients == 3
    });

    for (client, level) in clients.iter_mut().zip(levels) {
        client.send_audio(level, 4800);
    }

    for (i, client) in clients.iter_mut().enumerate() {
        let own = levels[i];
        let others: Vec<f32> = levels.iter().copied().filter(|&l| l != own).collect();
        // Any tick may miss a source whose ring ran dry; never our own voice.
        let allowed = [0.0, others[0], others[1], others[0] + others[1]];
        let full = others[0] + others[1];

        let mut heard_full_mix = false;
        for _ in 0..40 {
            let packet = client.expect(PacketType::AudioBatch);
            let batch = AudioBatch::decode(&packet.payload).unwrap();
            assert_eq!(batch.channels, 1);
            for sample in &batch.samples {
                assert!(
                    allowed.iter().any(|a| (sample - a).abs() < 1e-3),
                    "client {} heard {} (own level {})",
                    i,
                    sample,
                    own
                );
            }
            if batch.samples.iter().any(|s| (s - full).abs() < 1e-3) {
                heard_full_mix = true;
                break;
            }
        }
        assert!(heard_full_mix, "client {} never heard the full mix {}", i, full);
    }
}

#[test]
fn test_blank_composite_is_not_sent() {
    let server = start(&test_config(4));
    let mut camera = TestClient::join(&server, "camera", true, false);
    let mut viewer = TestClient::join(&server, "viewer", false, false);
    viewer.resize(40, 12);
    wait_for("two joined clients", || {
        server.context().registry.counts().connected_clients == 2
    });

    camera.send_image([0, 0, 0]);
    wait_for("blank frames to be suppressed", || {
        server
            .context()
            .registry
            .stats()
            .iter()
            .any(|s| s.display_name == "viewer" && s.blank_frames_suppressed > 0)
    });

    viewer.reader.set_timeout(Duration::from_millis(300));
    loop {
        match viewer.reader.recv() {
            Ok(Some(packet)) => assert_ne!(packet.packet_type, PacketType::AsciiFrame),
            Err(Error::Network(NetworkError::Timeout(_))) => break,
            other => panic!("viewer connection failed: {:?}", other.map(|p| p.map(|p| p.packet_type))),
        }
    }

    camera.send_image([255, 255, 255]);
    viewer.reader.set_timeout(WAIT);
    let frame = AsciiFrame::decode(viewer.expect(PacketType::AsciiFrame).payload).unwrap();
    assert!(frame.data.iter().any(|b| !b.is_ascii_whitespace()));
}

#[test]
fn test_protocol_error_only_drops_offender() {
    let server = start(&test_config(4));
    let mut bad = TestClient::join(&server, "bad", false, false);
    let mut good = TestClient::join(&server, "good", false, false);
    wait_for("two joined clients", || {
        server.context().registry.counts().connected_clients == 2
    });

    bad.raw.write_all(&[0x0B, 0xAD, 0xF0, 0x0D].repeat(5)).unwrap();
    bad.reader.set_timeout(WAIT);
    assert!(bad.closed());

    wait_for("offender removed", || server.context().registry.len() == 1);

    good.send(PacketType::Ping, Bytes::new());
    good.expect(PacketType::Pong);
    assert_eq!(server.context().registry.snapshot()[0].display_name(), "good");
}

#[test]
fn test_rejects_beyond_capacity() {
    let server = start(&test_config(1));
    let _first = TestClient::join(&server, "first", false, false);
    wait_for("first admitted", || server.context().registry.len() == 1);

    let mut second = TestClient::connect(&server);
    let leave = second.expect(PacketType::ClientLeave);
    let reason = String::from_utf8_lossy(&leave.payload).to_string();
    assert!(reason.contains("capacity"), "reason was {:?}", reason);
    assert!(second.closed());
    assert_eq!(server.context().registry.len(), 1);
}

#[test]
fn test_leave_publishes_left_event() {
    let server = start(&test_config(4));
    let mut client = TestClient::join(&server, "brief", false, false);
    wait_for("client joined", || {
        server.context().registry.counts().connected_clients == 1
    });
    let mut events = server.context().events.subscribe();

    client.send(PacketType::ClientLeave, Bytes::from_static(b"bye"));
    match next_event(&mut events, |e| matches!(e, SessionEvent::Left { .. })) {
        SessionEvent::Left { reason, .. } => assert_eq!(reason, "bye"),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(server.context().registry.is_empty());
}

#[test]
fn test_client_reconnects_after_server_drops_it() {
    let server = start(&test_config(4));

    let mut config = test_config(4);
    config.client.server_address = "127.0.0.1".into();
    config.client.port = server.addr().port();
    config.client.display_name = "roamer".into();
    config.client.send_video = false;
    config.client.send_audio = false;
    config.client.reconnect_base_ms = 10;
    config.client.reconnect_max_ms = 50;
    config.client.connect_timeout_ms = 1_000;

    let handle = ConnectionHandle::new(TerminalSize { width: 80, height: 24 });
    let shutdown = Shutdown::new();
    let mut client = Client::new(
        config.client.clone(),
        &config.audio,
        handle.clone(),
        Box::new(TerminalSink::new(Vec::new())),
        shutdown.clone(),
    );
    let runner = thread::spawn(move || client.run());

    wait_for("first connection", || {
        handle.connect_count() == 1 && server.context().registry.counts().connected_clients == 1
    });
    let first = server.context().registry.snapshot().remove(0);
    assert_eq!(first.display_name(), "roamer");
    first.request_close();

    wait_for("first session removed", || server.context().registry.get(first.id()).is_none());
    wait_for("client reconnected", || handle.connect_count() == 2);
    wait_for("second session joined", || {
        server
            .context()
            .registry
            .connected()
            .iter()
            .any(|s| s.id() != first.id() && s.display_name() == "roamer")
    });

    shutdown.trigger();
    runner.join().unwrap().unwrap();
    assert_eq!(handle.connect_count(), 2);
}
