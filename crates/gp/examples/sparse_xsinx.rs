use ndarray::{concatenate, Array, Array1, Array2, Axis};
use prefbox_gp::correlation_models::Kernel;
use prefbox_gp::{select_inducings, svi_rate, InducingSpace, Inducings, SviGaussian};
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;

fn xsinx(x: &Array2<f64>) -> Array1<f64> {
    ((x - 3.5) * ((x - 3.5) / std::f64::consts::PI).mapv(|v| v.sin())).remove_axis(Axis(1))
}

fn main() {
    let xt = Array::linspace(0., 25., 60).insert_axis(Axis(1));
    let yt = xsinx(&xt);
    let noise_var = 0.1;

    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let z = select_inducings(&Inducings::Clustered(12), &xt.view(), &mut rng)
        .expect("Inducing points");
    let space = InducingSpace::new(Kernel::Matern32, &ndarray::array![3.], z, xt.to_owned(), 1e-6)
        .expect("Kernel matrices");

    // Gaussian likelihood: data precision C^T C / noise and mean term C^T y / noise
    let c = space.projection();
    let lambda = c.t().dot(c) / noise_var;
    let eta = c.t().dot(&yt) / noise_var;
    let scale = 0.02;
    let prior_precision = space.inv_k_mm() * scale;

    println!("Fit sparse GP of 'xsinx' with {} inducing points", space.n_inducings());
    let mut posterior = SviGaussian::from_prior(space.k_mm(), space.inv_k_mm(), scale);
    for iter in 0..20 {
        let rho = svi_rate(iter, 1., 0.9);
        posterior.begin_step();
        posterior
            .update(&prior_precision, lambda.to_owned(), &eta, rho, 1.)
            .expect("SVI update");
    }

    let xtest = Array::linspace(0., 25., 26).insert_axis(Axis(1));
    let ytest = xsinx(&xtest);
    let ypred = space.predict_mean(&xtest, posterior.mean()).expect("Prediction");
    let ysigma = space
        .predict_variances(&xtest, posterior.cov(), scale)
        .expect("Prediction")
        .mapv(f64::sqrt);

    println!("Compute prediction errors (x, err(x), sigma(x))");
    println!(
        "{}",
        concatenate![
            Axis(1),
            xtest,
            (ypred - ytest).insert_axis(Axis(1)),
            ysigma.insert_axis(Axis(1))
        ]
    );
}
