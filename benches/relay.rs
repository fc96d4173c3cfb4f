// Hot-path benchmarks: checksums, packet framing, the audio ring and the mixer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use term_relay::audio::{AudioRingBuffer, Mixer};
use term_relay::protocol::crc32::{crc32, crc32_sw};
use term_relay::protocol::{AudioBatch, Packet, PacketType};

fn bench_crc32(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32");
    for size in [64usize, 4096, 256 * 1024] {
        let data: Vec<u8> = (0..size).map(|i| (i * 31) as u8).collect();
        group.bench_with_input(BenchmarkId::new("dispatch", size), &data, |b, data| {
            b.iter(|| black_box(crc32(black_box(data))))
        });
        group.bench_with_input(BenchmarkId::new("software", size), &data, |b, data| {
            b.iter(|| black_box(crc32_sw(black_box(data))))
        });
    }
    group.finish();
}

fn bench_packet_framing(c: &mut Criterion) {
    let batch = AudioBatch {
        batch_count: 4,
        sample_rate: 48_000,
        channels: 1,
        samples: vec![0.25; 1024],
    };
    let packet = Packet::new(PacketType::AudioBatch, 3, batch.encode());
    let wire = packet.encode().unwrap();

    c.bench_function("packet_encode_audio_batch", |b| {
        b.iter(|| black_box(packet.encode().unwrap()))
    });
    c.bench_function("packet_decode_audio_batch", |b| {
        b.iter(|| black_box(Packet::decode(black_box(&wire)).unwrap()))
    });
}

fn bench_audio_ring(c: &mut Criterion) {
    let (mut producer, mut consumer) = AudioRingBuffer::capture(8192);
    let input = vec![0.5f32; 256];
    let mut output = vec![0.0f32; 256];

    c.bench_function("audio_ring_write_read_256", |b| {
        b.iter(|| {
            producer.write(black_box(&input));
            black_box(consumer.read(&mut output));
        })
    });
}

fn bench_mixer(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixer_tick");
    for sources in [2usize, 9] {
        let mixer = Mixer::new(sources);
        let mut producers = Vec::new();
        for id in 0..sources as u32 {
            let (producer, consumer) = AudioRingBuffer::capture(8192);
            mixer.add_source(id, consumer);
            producers.push(producer);
        }
        let chunk = vec![0.1f32; 288];
        group.bench_with_input(BenchmarkId::from_parameter(sources), &sources, |b, _| {
            b.iter(|| {
                for producer in producers.iter_mut() {
                    producer.write(&chunk);
                }
                let tick = mixer.tick(288);
                for id in 0..sources as u32 {
                    black_box(tick.excluding(id));
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_crc32, bench_packet_framing, bench_audio_ring, bench_mixer);
criterion_main!(benches);
