use std::hint::black_box;

use clipsearch::IndexSnapshot;
use clipsearch::embed::l2_normalize_rows;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ndarray::Array2;
use rand::prelude::*;

const DIM: usize = 512;

fn random_snapshot(rng: &mut StdRng, n: usize) -> IndexSnapshot {
    let data = (0..n * DIM).map(|_| rng.random::<f32>() - 0.5).collect::<Vec<_>>();
    let matrix = l2_normalize_rows(Array2::from_shape_vec((n, DIM), data).unwrap());
    let paths = (0..n).map(|i| format!("/images/{i:06}.jpg")).collect();
    IndexSnapshot::new(paths, matrix).unwrap()
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("Search");
    let mut rng = StdRng::seed_from_u64(42);

    for n in [1_000, 10_000, 100_000] {
        let snapshot = random_snapshot(&mut rng, n);
        let query = snapshot.matrix().row(0).to_owned();

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("vector", n), &n, |b, _| {
            b.iter(|| snapshot.search(black_box(query.view()), 24).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("by_path", n), &n, |b, _| {
            b.iter(|| snapshot.search_by_path(black_box("/images/000000.jpg"), 24).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
