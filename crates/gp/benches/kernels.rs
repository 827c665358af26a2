use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{array, Array2};
use prefbox_gp::correlation_models::{covariance, length_scale_derivative, Kernel};
use prefbox_gp::InducingSpace;

fn locations(n: usize, nx: usize) -> Array2<f64> {
    Array2::from_shape_fn((n, nx), |(i, j)| (i as f64 * 0.37 + j as f64 * 0.11) % 1.0)
}

fn bench_matern32_covariance(c: &mut Criterion) {
    let mut group = c.benchmark_group("matern32_covariance");
    let ls = array![0.3, 0.3, 0.3, 0.3, 0.3];
    for size in [50, 200, 500].iter() {
        let x = locations(*size, 5);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| covariance(&Kernel::Matern32, &x, &x, &ls));
        });
    }
    group.finish();
}

fn bench_length_scale_derivative(c: &mut Criterion) {
    let mut group = c.benchmark_group("matern32_length_scale_derivative");
    let ls = array![0.3, 0.3, 0.3, 0.3, 0.3];
    for size in [50, 200].iter() {
        let x = locations(*size, 5);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| length_scale_derivative(&Kernel::Matern32, &x, &x, &ls, 2));
        });
    }
    group.finish();
}

fn bench_inducing_space(c: &mut Criterion) {
    let mut group = c.benchmark_group("inducing_space");
    group.sample_size(20);
    let xtrain = locations(2000, 3);
    for m in [50, 200].iter() {
        let z = locations(*m, 3);
        group.bench_with_input(BenchmarkId::from_parameter(m), m, |b, _| {
            b.iter(|| {
                InducingSpace::new(Kernel::Matern32, &array![0.5], z.clone(), xtrain.clone(), 1e-6)
                    .expect("inducing space")
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_matern32_covariance,
    bench_length_scale_derivative,
    bench_inducing_space
);
criterion_main!(benches);
