use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use otpair::device::DevicePlanner;
use otpair::{
    DivergenceKind, DivergenceScorer, EngineOptions, LossConfig, PairwiseOtd, PointCloud,
    SampleSet, SinkhornScorer,
};

fn make_cloud(n: usize, d: usize, seed: u64) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut x = Array2::<f32>::zeros((n, d));
    for i in 0..n {
        for k in 0..d {
            x[[i, k]] = StandardNormal.sample(&mut rng);
        }
    }
    x
}

fn make_set(k: usize, n: usize, d: usize, seed: u64) -> SampleSet {
    SampleSet::from_arrays((0..k).map(|s| make_cloud(n, d, seed + s as u64)).collect()).unwrap()
}

fn bench_single_cell(c: &mut Criterion) {
    let mut group = c.benchmark_group("otd_cell");
    group.sample_size(20);

    for &(n, d) in &[(32usize, 3usize), (64, 3), (64, 8), (128, 3)] {
        let x = PointCloud::new(make_cloud(n, d, 7)).unwrap();
        let y = PointCloud::new(make_cloud(n, d, 8)).unwrap();
        let cell = DevicePlanner::host().place_pair(&x, &y).unwrap();

        // Blur 0.5 converges in few iterations, so this isolates scaling in n and d.
        let sinkhorn = LossConfig::default().with_blur(0.5);
        let entropic = sinkhorn.clone().with_kind(DivergenceKind::EntropicOt);

        group.bench_with_input(
            BenchmarkId::new("entropic_ot", format!("n{n}_d{d}")),
            &(n, d),
            |b, _| b.iter(|| SinkhornScorer.score(&cell.source, &cell.target, &entropic, false).unwrap()),
        );

        group.bench_with_input(
            BenchmarkId::new("sinkhorn_divergence", format!("n{n}_d{d}")),
            &(n, d),
            |b, _| b.iter(|| SinkhornScorer.score(&cell.source, &cell.target, &sinkhorn, false).unwrap()),
        );

        group.bench_with_input(
            BenchmarkId::new("sinkhorn_with_gradient", format!("n{n}_d{d}")),
            &(n, d),
            |b, _| b.iter(|| SinkhornScorer.score(&cell.source, &cell.target, &sinkhorn, true).unwrap()),
        );
    }

    group.finish();
}

fn bench_matrix(c: &mut Criterion) {
    let mut group = c.benchmark_group("otd_matrix");
    group.sample_size(10);

    let sources = make_set(4, 48, 3, 100);
    let targets = make_set(4, 48, 3, 200);
    let cfg = LossConfig::default().with_blur(0.5);

    for parallel in [false, true] {
        let mut engine = PairwiseOtd::new(sources.clone(), targets.clone(), cfg.clone())
            .unwrap()
            .with_options(EngineOptions::default().with_parallel(parallel));
        group.bench_function(BenchmarkId::new("4x4_n48_d3", if parallel { "parallel" } else { "sequential" }), |b| {
            b.iter(|| {
                engine.compute().unwrap();
            })
        });
    }

    // Default blur (0.05): the solver runs to its iteration limit on most cells.
    let small_sources = make_set(2, 24, 3, 300);
    let small_targets = make_set(2, 24, 3, 400);
    let mut engine = PairwiseOtd::new(small_sources, small_targets, LossConfig::default()).unwrap();
    group.bench_function(BenchmarkId::new("2x2_n24_d3", "default_blur"), |b| {
        b.iter(|| {
            engine.compute().unwrap();
        })
    });

    group.finish();
}

criterion_group!(benches, bench_single_cell, bench_matrix);
criterion_main!(benches);
