//! Codec benchmarks for rapport-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rapport_core::model::now;
use rapport_core::{Event, MatchId, Message, MessageId};
use rapport_protocol::{codec, Frame};

fn message_frame(body_len: usize) -> Frame {
    Frame::event(Event::MessageAppended {
        message: Message {
            id: MessageId(42),
            match_id: MatchId::generate(),
            sender_id: "alice".into(),
            body: "x".repeat(body_len),
            client_key: None,
            created_at: now(),
        },
    })
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [64, 1024, 16384] {
        let frame = message_frame(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("message_{size}B"), |b| {
            b.iter(|| codec::encode(black_box(&frame)))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for size in [64, 1024, 16384] {
        let encoded = codec::encode(&message_frame(size)).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(format!("message_{size}B"), |b| {
            b.iter(|| codec::decode(black_box(&encoded)))
        });
    }
    group.finish();
}

fn bench_streaming(c: &mut Criterion) {
    let frames: Vec<Frame> = (0..100).map(|_| message_frame(128)).collect();
    let mut stream = BytesMut::new();
    for frame in &frames {
        codec::encode_into(frame, &mut stream).unwrap();
    }

    c.bench_function("decode_from_100_frames", |b| {
        b.iter(|| {
            let mut buf = stream.clone();
            while let Some(frame) = codec::decode_from(&mut buf).unwrap() {
                black_box(frame);
            }
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_streaming);
criterion_main!(benches);
