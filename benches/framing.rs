use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use openndi::protocol::{decode, Packet};

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [0usize, 1024, 1316, 60 * 1024] {
        let packet = Packet::data(42, Bytes::from(vec![0x47; size]));
        group.throughput(Throughput::Bytes(packet.total_size() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &packet, |b, packet| {
            b.iter(|| black_box(packet).encode())
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for size in [0usize, 1024, 1316, 60 * 1024] {
        let data = Packet::data(42, Bytes::from(vec![0x47; size])).encode();
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| decode(black_box(data)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
