//! Protocol encoding/decoding benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relwire_protocol::packet::{fetch_status, FetchResponse};
use relwire_protocol::pblock::dpb;
use relwire_protocol::{
    CipherPair, Decoder, Encoder, Field, FieldType, MessageFormat, Packet, ParamBlock, Value,
};

fn row_format() -> MessageFormat {
    MessageFormat::new(vec![
        Field::new("id", FieldType::Integer).not_null(),
        Field::new("amount", FieldType::BigInt),
        Field::new("label", FieldType::Varchar(64)),
    ])
}

fn row(id: i32) -> Vec<Value> {
    vec![
        Value::Integer(id),
        Value::BigInt(i64::from(id) * 1_000),
        Value::Text(format!("label {}", id)),
    ]
}

fn fetch_packet(rows: usize) -> Packet {
    let format = row_format();
    let rows = (0..rows as i32)
        .map(|id| format.encode_row(&row(id)).unwrap())
        .collect();
    Packet::FetchResponse(FetchResponse {
        status: fetch_status::OK,
        rows,
    })
}

fn bench_row_encode(c: &mut Criterion) {
    let format = row_format();
    let values = row(42);

    c.bench_function("row_encode", |b| {
        b.iter(|| black_box(format.encode_row(&values).unwrap()));
    });
}

fn bench_row_decode(c: &mut Criterion) {
    let format = row_format();
    let encoded = format.encode_row(&row(42)).unwrap();

    c.bench_function("row_decode", |b| {
        b.iter(|| black_box(format.decode_row(&encoded).unwrap()));
    });
}

fn bench_fetch_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch_encode");

    for rows in [1, 16, 256] {
        let packet = fetch_packet(rows);

        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("plain", rows), &packet, |b, packet| {
            let mut encoder = Encoder::new();
            b.iter(|| black_box(encoder.encode(packet).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("encrypted", rows), &packet, |b, packet| {
            let mut encoder = Encoder::new();
            encoder.set_cipher(CipherPair::for_client(b"bench session key").unwrap().send);
            b.iter(|| black_box(encoder.encode(packet).unwrap()));
        });
    }

    group.finish();
}

fn bench_fetch_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch_decode");

    for rows in [1, 16, 256] {
        let encoded = Encoder::new().encode(&fetch_packet(rows)).unwrap().freeze();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                black_box(decoder.decode_packet().unwrap().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_param_block(c: &mut Criterion) {
    let block = ParamBlock::new()
        .with_str(dpb::USER_NAME, "alice")
        .with_str(dpb::PROCESS_NAME, "bench")
        .with_bytes(dpb::CRYPT_KEY, Bytes::from_static(b"database key"));
    let encoded = block.to_bytes().unwrap();

    let mut group = c.benchmark_group("param_block");
    group.bench_function("build", |b| b.iter(|| black_box(block.to_bytes().unwrap())));
    group.bench_function("parse", |b| {
        b.iter(|| black_box(ParamBlock::parse(&encoded).unwrap()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_row_encode,
    bench_row_decode,
    bench_fetch_encode,
    bench_fetch_decode,
    bench_param_block,
);

criterion_main!(benches);
