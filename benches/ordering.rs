use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::ThreadPoolBuilder;

use circsplits::data::distance_matrix::DistanceMatrix;
use circsplits::ordering::{OrderingMethod, compute_order};

fn make_distance_matrix(n: usize, seed: u64) -> DistanceMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut m = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let v = rng.gen_range(0.0..10.0);
            m[[i, j]] = v;
            m[[j, i]] = v;
        }
    }
    DistanceMatrix::new(m).expect("valid matrix")
}

fn bench_ordering(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordering");
    group.sample_size(10);
    for &n in &[80usize, 160, 320] {
        let dist = make_distance_matrix(n, 42);
        for method in [OrderingMethod::Agglomerative, OrderingMethod::Components] {
            group.bench_with_input(BenchmarkId::new(method.as_str(), n), &dist, |b, d| {
                b.iter(|| compute_order(method, black_box(d)).unwrap());
            });
        }

        let max_threads = num_cpus::get();
        for threads in [2usize, 4, 8].into_iter().filter(|&t| t <= max_threads) {
            let pool = ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .expect("thread pool");
            let id = BenchmarkId::new(format!("components_t{}", threads), n);
            group.bench_with_input(id, &dist, |b, d| {
                b.iter(|| {
                    pool.install(|| {
                        compute_order(OrderingMethod::Components, black_box(d)).unwrap()
                    })
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_ordering);
criterion_main!(benches);
