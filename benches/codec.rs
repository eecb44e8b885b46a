//! Benchmarks for the STOMP frame codec.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use scan_relay::connection::stomp::{Frame, HeartBeat, decode};
use std::time::Duration;

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    group.bench_function("send", |b| {
        b.iter(|| black_box(Frame::send("/app/barcode/send", black_box("4006381333931")).encode()))
    });

    let beat = HeartBeat::new(Duration::from_millis(4000), Duration::from_millis(4000));
    group.bench_function("connect", |b| {
        b.iter(|| black_box(Frame::connect("192.168.10.9", None, None, beat).encode()))
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    let inputs: [(&str, &[u8]); 4] = [
        ("heartbeat", b"\n"),
        (
            "connected",
            b"CONNECTED\nversion:1.2\nheart-beat:4000,4000\nserver:RabbitMQ/3.13\n\n\0",
        ),
        ("connected_without_null", b"CONNECTED\nversion:1.2\nheart-beat:0,0\n\n"),
        (
            "error",
            b"ERROR\nmessage:Invalid destination\ncontent-length:24\n\nNo handler for /app/nope\0",
        ),
    ];

    for (name, data) in inputs {
        group.bench_with_input(BenchmarkId::from_parameter(name), data, |b, data| {
            b.iter(|| black_box(decode(black_box(data)).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
