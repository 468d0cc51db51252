//! Benchmark: merkle tree construction and whole-blob verification.

use amber_merkle::{build, tree_length, verify};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("merkle_build");
    for size in [64 * 1024_usize, 1024 * 1024, 8 * 1024 * 1024] {
        let data = payload(size);
        let tree_len = usize::try_from(tree_length(size as u64)).expect("tree length");
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}KiB", size / 1024), |b| {
            let mut tree = vec![0_u8; tree_len];
            b.iter(|| black_box(build(black_box(&data), &mut tree).expect("build")));
        });
    }
    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let data = payload(1024 * 1024);
    let len = data.len() as u64;
    let mut tree = vec![0_u8; usize::try_from(tree_length(len)).expect("tree length")];
    let root = build(&data, &mut tree).expect("build");

    c.bench_function("merkle_verify_1MiB", |b| {
        b.iter(|| {
            verify(
                black_box(&data),
                len,
                black_box(&tree),
                0,
                len,
                black_box(&root),
            )
            .expect("verify");
        });
    });
}

criterion_group!(benches, bench_build, bench_verify);
criterion_main!(benches);
