//! Throughput Benchmark for CinderKV
//!
//! Measures the hot paths: the wire codec in both directions and the core
//! keyspace operations, all below the socket layer.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use cinderkv::protocol::{decode_commands, Reply};
use cinderkv::storage::{Keyspace, SetCondition, SystemClock};

/// Benchmark reply encoding
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("status", |b| {
        let reply = Reply::ok();
        b.iter(|| black_box(reply.encode()));
    });

    group.bench_function("bulk_1kb", |b| {
        let reply = Reply::text("x".repeat(1024));
        b.iter(|| black_box(reply.encode()));
    });

    group.bench_function("array_of_100", |b| {
        let reply = Reply::array((0..100).map(|i| Reply::text(format!("item:{}", i))).collect());
        b.iter(|| black_box(reply.encode()));
    });

    group.finish();
}

/// Benchmark request decoding
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    let single = b"*3\r\n$3\r\nSET\r\n$8\r\nmykey:42\r\n$11\r\nsmall_value\r\n".to_vec();
    group.throughput(Throughput::Bytes(single.len() as u64));
    group.bench_function("single_set", |b| {
        b.iter(|| black_box(decode_commands(&single)));
    });

    let pipeline: Vec<u8> = (0..100)
        .flat_map(|i| {
            let key = format!("key:{}", i);
            format!("*2\r\n$3\r\nGET\r\n${}\r\n{}\r\n", key.len(), key).into_bytes()
        })
        .collect();
    group.throughput(Throughput::Elements(100));
    group.bench_function("pipeline_of_100", |b| {
        b.iter(|| black_box(decode_commands(&pipeline)));
    });

    group.finish();
}

/// Benchmark keyspace SET operations
fn bench_set(c: &mut Criterion) {
    let mut keyspace = Keyspace::new(Arc::new(SystemClock));

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i);
            keyspace.set(&key, "small_value", SetCondition::Always);
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let mut i = 0u64;
        let value = "x".repeat(1024); // 1KB value
        b.iter(|| {
            let key = format!("key:{}", i);
            keyspace.set(&key, &value, SetCondition::Always);
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark keyspace GET operations
fn bench_get(c: &mut Criterion) {
    let mut keyspace = Keyspace::new(Arc::new(SystemClock));

    // Pre-populate with data
    for i in 0..100_000 {
        let key = format!("key:{}", i);
        let value = format!("value:{}", i);
        keyspace.set(&key, &value, SetCondition::Always);
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(keyspace.get(&key).unwrap());
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("missing:{}", i);
            black_box(keyspace.get(&key).unwrap());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark list push/pop cycling
fn bench_lists(c: &mut Criterion) {
    let mut keyspace = Keyspace::new(Arc::new(SystemClock));

    let mut group = c.benchmark_group("lists");
    group.throughput(Throughput::Elements(1));

    group.bench_function("lpush_rpop_cycle", |b| {
        b.iter(|| {
            keyspace.lpush("queue", "job").unwrap();
            black_box(keyspace.rpop("queue").unwrap());
        });
    });

    group.finish();
}

/// Benchmark sorted set insertion
fn bench_zadd(c: &mut Criterion) {
    let mut group = c.benchmark_group("zadd");
    group.throughput(Throughput::Elements(1));
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("zadd_growing", |b| {
        let mut keyspace = Keyspace::new(Arc::new(SystemClock));
        let mut i = 0u64;
        b.iter(|| {
            let member = format!("member:{}", i);
            keyspace.zadd("board", i as f64, &member).unwrap();
            i += 1;
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_set,
    bench_get,
    bench_lists,
    bench_zadd
);
criterion_main!(benches);
