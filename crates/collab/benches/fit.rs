use criterion::{criterion_group, criterion_main, Criterion};
use env_logger::{Builder, Env};
use linfa::ParamGuard;
use ndarray::{Array, Axis};
use ndarray_rand::rand::{Rng, SeedableRng};
use prefbox_collab::{
    CollabPrefModel, Comparison, Inference, Observations, PreferenceData, PREFBOX_LOG,
};
use rand_xoshiro::Xoshiro256Plus;

fn synthetic(nitems: usize, npeople: usize, nobs: usize) -> PreferenceData {
    let x = Array::linspace(0., 5., nitems).insert_axis(Axis(1));
    let mut rng = Xoshiro256Plus::seed_from_u64(0);
    let comparisons: Vec<Comparison> = (0..nobs)
        .map(|_| {
            let p = rng.gen_range(0..npeople);
            let a = rng.gen_range(0..nitems);
            let b = (a + rng.gen_range(1..nitems)) % nitems;
            let sign = if p % 2 == 0 { 1. } else { -1. };
            let f = |x: f64| x.cos() + sign * 0.5 * x;
            Comparison::new(p, a, b, if f(x[[a, 0]]) > f(x[[b, 0]]) { 1. } else { 0. })
        })
        .collect();
    let obs = Observations::from_comparisons(&comparisons).unwrap();
    PreferenceData::new(obs, x, None).unwrap()
}

fn criterion_fit(c: &mut Criterion) {
    let env = Env::new().filter_or(PREFBOX_LOG, "error");
    let mut builder = Builder::from_env(env);
    let builder = builder.target(env_logger::Target::Stdout);
    builder.try_init().ok();

    let data = synthetic(100, 20, 2000);
    let mut group = c.benchmark_group("collab_fit");
    group.sample_size(10);
    group.bench_function("svi", |b| {
        let params = CollabPrefModel::params(5)
            .n_item_inducings(30)
            .max_update_size(200)
            .max_iter(20)
            .seed(Some(42))
            .check()
            .unwrap();
        b.iter(|| std::hint::black_box(params.fit(&data).unwrap()))
    });
    group.bench_function("full batch", |b| {
        let params = CollabPrefModel::params(5)
            .n_item_inducings(30)
            .inference(Inference::FullBatch)
            .max_iter(10)
            .seed(Some(42))
            .check()
            .unwrap();
        b.iter(|| std::hint::black_box(params.fit(&data).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, criterion_fit);
criterion_main!(benches);
