use env_logger::{Builder, Env};
use linfa::ParamGuard;
use ndarray::{Array, Axis};
use ndarray_rand::rand::{Rng, SeedableRng};
use prefbox_collab::{
    CollabPrefModel, Comparison, Inference, Observations, PreferenceData, PREFBOX_LOG,
};
use rand_xoshiro::Xoshiro256Plus;

/// Latent preference of `person` for an item at `x`: a common trend plus
/// one of two opposite tastes
fn taste(person: usize, x: f64) -> f64 {
    let sign = if person % 2 == 0 { 1. } else { -1. };
    0.5 * x + sign * (2. * x).sin()
}

fn main() {
    let env = Env::new().filter_or(PREFBOX_LOG, "info");
    let mut builder = Builder::from_env(env);
    let builder = builder.target(env_logger::Target::Stdout);
    builder.try_init().ok();

    let nitems = 20;
    let npeople = 8;
    let nobs = 400;
    let x = Array::linspace(0., 3., nitems).insert_axis(Axis(1));

    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let comparisons: Vec<Comparison> = (0..nobs)
        .map(|_| {
            let p = rng.gen_range(0..npeople);
            let a = rng.gen_range(0..nitems);
            let b = (a + rng.gen_range(1..nitems)) % nitems;
            let noisy = taste(p, x[[a, 0]]) - taste(p, x[[b, 0]]) + 0.2 * rng.gen::<f64>() - 0.1;
            Comparison::new(p, a, b, if noisy > 0. { 1. } else { 0. })
        })
        .collect();
    let obs = Observations::from_comparisons(&comparisons).expect("valid comparisons");
    let data = PreferenceData::new(obs, x.clone(), None).expect("valid data");

    let model = CollabPrefModel::params(3)
        .n_item_inducings(10)
        .inference(Inference::Stochastic)
        .max_update_size(100)
        .seed(Some(42))
        .check()
        .expect("valid parameters")
        .fit(&data)
        .expect("Collaborative preference fitting");
    println!("{model}");
    println!("lower bound = {}", model.lowerbound().expect("lower bound"));

    let mut correct = 0;
    for &c in comparisons.iter() {
        let p = model
            .predict(c.person, c.item_a, c.item_b)
            .expect("prediction");
        if (p > 0.5) == (c.label > 0.5) {
            correct += 1;
        }
    }
    println!("training accuracy = {:.3}", correct as f64 / nobs as f64);

    for item in [2, 10, 17] {
        println!(
            "item {item}: consensus = {:.3}, person 0 = {:.3}, person 1 = {:.3}",
            model.predict_t(item),
            model.predict_f(0, item).expect("latent value"),
            model.predict_f(1, item).expect("latent value"),
        );
    }
}
