//! Benchmarks for netgate codecs.

use bytes::{BufMut, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use netgate::codec::{
    LineCodec, MqttCodec, MqttPacket, PacketType, WebSocketCodec, WsFrame,
    DEFAULT_MAX_FRAME_PAYLOAD,
};
use netgate::config::Protocol;
use netgate::metrics::{Direction, MetricsCollector};
use netgate::util::ConnectionId;
use tokio_util::codec::{Decoder, Encoder};

fn benchmark_line_codec(c: &mut Criterion) {
    let mut input = BytesMut::new();
    for i in 0..100 {
        input.put_slice(format!("message number {}\r\n", i).as_bytes());
    }

    let mut group = c.benchmark_group("line");
    group.throughput(Throughput::Bytes(input.len() as u64));

    group.bench_function("decode_100_lines", |b| {
        b.iter(|| {
            let mut codec = LineCodec::default();
            let mut buf = input.clone();
            while let Some(line) = codec.decode(&mut buf).unwrap() {
                black_box(line);
            }
        })
    });

    group.bench_function("encode", |b| {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::with_capacity(64);
        b.iter(|| {
            buf.clear();
            codec.encode(black_box("message number 42"), &mut buf).unwrap();
        })
    });

    group.finish();
}

fn benchmark_mqtt_codec(c: &mut Criterion) {
    let mut codec = MqttCodec::default();
    let mut input = BytesMut::new();
    for size in [0usize, 16, 300, 20_000] {
        codec
            .encode(MqttPacket::new(PacketType::Publish, 0, vec![7u8; size]), &mut input)
            .unwrap();
    }

    let mut group = c.benchmark_group("mqtt");
    group.throughput(Throughput::Bytes(input.len() as u64));

    group.bench_function("decode_mixed_sizes", |b| {
        b.iter(|| {
            let mut codec = MqttCodec::default();
            let mut buf = input.clone();
            while let Some(packet) = codec.decode(&mut buf).unwrap() {
                black_box(packet);
            }
        })
    });

    group.finish();
}

const HANDSHAKE: &[u8] = b"GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

fn upgraded_server() -> WebSocketCodec {
    let mut server = WebSocketCodec::server("/ws", DEFAULT_MAX_FRAME_PAYLOAD, 256);
    let mut buf = BytesMut::from(HANDSHAKE);
    server.decode(&mut buf).unwrap();
    server
}

fn benchmark_websocket_codec(c: &mut Criterion) {
    let message = "x".repeat(1024);

    let mut client = WebSocketCodec::client(DEFAULT_MAX_FRAME_PAYLOAD, 256);
    let mut input = BytesMut::new();
    client.encode(WsFrame::Text(message.clone()), &mut input).unwrap();

    let mut group = c.benchmark_group("websocket");
    group.throughput(Throughput::Bytes(message.len() as u64));

    group.bench_function("decode_fragmented_1k", |b| {
        b.iter(|| {
            let mut server = upgraded_server();
            let mut buf = input.clone();
            black_box(server.decode(&mut buf).ok());
        })
    });

    group.bench_function("encode_chunked_1k", |b| {
        let mut server = upgraded_server();
        let mut buf = BytesMut::with_capacity(2048);
        b.iter(|| {
            buf.clear();
            server
                .encode(WsFrame::Text(black_box(message.clone())), &mut buf)
                .unwrap();
        })
    });

    group.finish();
}

fn benchmark_metrics(c: &mut Criterion) {
    let collector = MetricsCollector::new();

    let mut group = c.benchmark_group("metrics");
    group.throughput(Throughput::Elements(1));

    group.bench_function("record_message", |b| {
        b.iter(|| {
            collector.record_message(black_box(Protocol::Line), Direction::Inbound);
        })
    });

    group.bench_function("connection_id", |b| b.iter(|| black_box(ConnectionId::next())));

    group.finish();
}

criterion_group!(
    benches,
    benchmark_line_codec,
    benchmark_mqtt_codec,
    benchmark_websocket_codec,
    benchmark_metrics,
);

criterion_main!(benches);
