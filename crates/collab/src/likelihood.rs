//! Probit likelihood of a pairwise comparison.
//!
//! With latent values `f_a`, `f_b` and unit Gaussian noise on each, the probability
//! that `a` is preferred is `Phi((f_a - f_b) / sqrt(2))`.

use libm::erfc;
use ndarray::{Array1, Zip};
use special::Gamma;
use std::f64::consts::{FRAC_1_SQRT_2, PI, SQRT_2};

/// Probabilities are kept in [PROB_EPS, 1 - PROB_EPS] before taking logarithms
pub const PROB_EPS: f64 = 1e-7;

const SQRT_2PI: f64 = 2.5066282746310007;

/// Cumulative distribution function of Standard Normal at x
pub fn norm_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// Probability density function of Standard Normal at x
pub fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / SQRT_2PI
}

/// Clamp a probability away from 0 and 1
pub fn clamp_probability(p: f64) -> f64 {
    p.clamp(PROB_EPS, 1. - PROB_EPS)
}

/// Probability that `a` is preferred given the mean `f_diff` and the
/// variance `var_diff` of `f_a - f_b`
pub fn pref_probability(f_diff: f64, var_diff: f64) -> f64 {
    norm_cdf(f_diff / (2. + var_diff.max(0.)).sqrt())
}

/// First-order expansion of the likelihood around the current latent differences.
///
/// For each comparison `probs = Phi(g)` with `g = (f_a - f_b) / sqrt(2)` and
/// `jacobian = phi(g) / sqrt(2)`, the derivative of `probs` with respect to `f_a`
/// (the derivative with respect to `f_b` is its opposite).
#[derive(Clone, Debug, PartialEq)]
pub struct Linearization {
    /// Likelihood at the expansion point
    pub probs: Array1<f64>,
    /// Derivative of the likelihood with respect to the latent value of the first item
    pub jacobian: Array1<f64>,
}

impl Linearization {
    /// Expand around latent differences `f_a - f_b`
    pub fn at(f_diff: &Array1<f64>) -> Self {
        let g = f_diff.mapv(|v| v * FRAC_1_SQRT_2);
        Linearization {
            probs: g.mapv(norm_cdf),
            jacobian: g.mapv(|v| norm_pdf(v) * FRAC_1_SQRT_2),
        }
    }

    /// Max absolute change of the jacobian with respect to a previous expansion,
    /// infinite when there is none
    pub fn change_from(&self, previous: Option<&Linearization>) -> f64 {
        match previous {
            None => f64::INFINITY,
            Some(prev) => Zip::from(&self.jacobian)
                .and(&prev.jacobian)
                .fold(0., |acc, a, b| f64::max(acc, (a - b).abs())),
        }
    }

    /// Linearization offsets `z0 = Phi(g) - J * partial` for a partial latent difference
    pub fn offsets(&self, partial_diff: &Array1<f64>) -> Array1<f64> {
        &self.probs - &(&self.jacobian * partial_diff)
    }
}

/// Log of the binomial coefficient C(1, z) extended to fractional labels
pub fn log_binomial_coefficient(z: f64) -> f64 {
    -Gamma::ln_gamma(z + 1.).0 - Gamma::ln_gamma(2. - z).0
}

/// `sum z ln(p) + (1 - z) ln(1 - p) + ln C(1, z)` over comparisons
pub fn log_likelihood(labels: &Array1<f64>, probs: &Array1<f64>) -> f64 {
    Zip::from(labels).and(probs).fold(0., |acc, &z, &p| {
        let p = clamp_probability(p);
        acc + z * p.ln() + (1. - z) * (1. - p).ln() + log_binomial_coefficient(z)
    })
}

/// Variance of the noisy observation of every comparison's likelihood.
///
/// The prior predictive probability `Phi(g)` with `g ~ N(0, var_g)` has mean 0.5 and
/// variance `asin(var_g / (1 + var_g)) / (2 pi)`. Moment matching a Beta(a, b) prior
/// to it and updating with the label `z` gives the observation noise
/// `m (1 - m) + m (1 - m) / (2 + a + b)` with `m = (z + a) / (1 + a + b)`.
pub fn observation_noise(labels: &Array1<f64>, prior_g_var: &Array1<f64>) -> Array1<f64> {
    Zip::from(labels).and(prior_g_var).map_collect(|&z, &var_g| {
        let var_g = var_g.max(0.);
        let v_prior = ((var_g / (1. + var_g)).asin() / (2. * PI)).max(1e-8);
        let a_plus_b = (0.25 / v_prior - 1.).max(0.);
        let a = 0.5 * a_plus_b;
        let m = (z + a) / (1. + a_plus_b);
        let var_m = m * (1. - m) / (2. + a_plus_b);
        m * (1. - m) + var_m
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_norm_cdf() {
        assert_abs_diff_eq!(norm_cdf(0.), 0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(norm_cdf(1.96), 0.9750021048517795, epsilon = 1e-12);
        assert_abs_diff_eq!(norm_cdf(-1.) + norm_cdf(1.), 1., epsilon = 1e-15);
    }

    #[test]
    fn test_pref_probability_symmetry() {
        for (f, v) in [(0.3, 0.), (-2., 1.5), (5., 0.2)] {
            assert_abs_diff_eq!(
                pref_probability(f, v),
                1. - pref_probability(-f, v),
                epsilon = 1e-15
            );
        }
        assert!(pref_probability(1., 10.) < pref_probability(1., 0.));
    }

    #[test]
    fn test_jacobian_vs_finite_diff() {
        let f = array![-1.5, 0., 0.7, 3.];
        let lin = Linearization::at(&f);
        let h = 1e-6;
        let fd = (Linearization::at(&(&f + h)).probs - Linearization::at(&(&f - h)).probs) / (2. * h);
        assert_abs_diff_eq!(lin.jacobian, fd, epsilon = 1e-8);
        assert_abs_diff_eq!(lin.jacobian[1], FRAC_1_SQRT_2 / SQRT_2PI, epsilon = 1e-15);
    }

    #[test]
    fn test_change_from() {
        let lin = Linearization::at(&array![0., 1.]);
        assert!(lin.change_from(None).is_infinite());
        assert_abs_diff_eq!(lin.change_from(Some(&lin)), 0.);
    }

    #[test]
    fn test_log_likelihood() {
        let labels = array![1., 0., 0.5];
        let probs = array![0.8, 0.3, 0.5];
        let expected = 0.8f64.ln() + 0.7f64.ln() + 0.5f64.ln() + log_binomial_coefficient(0.5);
        assert_abs_diff_eq!(log_likelihood(&labels, &probs), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(log_binomial_coefficient(1.), 0., epsilon = 1e-12);
        assert_abs_diff_eq!(log_binomial_coefficient(0.), 0., epsilon = 1e-12);
        // clamped probabilities keep the log-likelihood finite
        assert!(log_likelihood(&array![1.], &array![0.]).is_finite());
    }

    #[test]
    fn test_observation_noise() {
        let q = observation_noise(&array![1., 0., 0.5], &array![1., 1., 1.]);
        assert!(q.iter().all(|&v| v > 0. && v < 0.5));
        assert_abs_diff_eq!(q[0], q[1], epsilon = 1e-15);
        assert!(q[2] > q[0]);
    }
}
