use crate::parameters::GammaPrior;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use special::Gamma;

/// Gamma posterior over the output scale (inverse variance) of a latent GP
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct OutputScale {
    shape0: f64,
    rate0: f64,
    shape: f64,
    rate: f64,
}

impl OutputScale {
    /// Posterior equal to the prior
    pub fn new(prior: GammaPrior) -> Self {
        OutputScale {
            shape0: prior.shape,
            rate0: prior.rate,
            shape: prior.shape,
            rate: prior.rate,
        }
    }

    /// Closed-form update from `n` latent values whose expected prior quadratic form
    /// `E[u^T K^-1 u]` is `trace`
    pub fn update(&mut self, n: usize, trace: f64) {
        self.shape = self.shape0 + 0.5 * n as f64;
        self.rate = self.rate0 + 0.5 * trace.max(0.);
    }

    /// Posterior shape
    pub fn shape(&self) -> f64 {
        self.shape
    }

    /// Posterior rate
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// `E[s]`
    pub fn mean(&self) -> f64 {
        self.shape / self.rate
    }

    /// `E[ln s]`
    pub fn expected_ln(&self) -> f64 {
        Gamma::digamma(self.shape) - self.rate.ln()
    }

    /// `E[ln p(s)]` under the prior Gamma(shape0, rate0)
    pub fn ln_p(&self) -> f64 {
        -Gamma::ln_gamma(self.shape0).0 + self.shape0 * self.rate0.ln()
            + (self.shape0 - 1.) * self.expected_ln()
            - self.rate0 * self.mean()
    }

    /// `E[ln q(s)]`
    pub fn ln_q(&self) -> f64 {
        -Gamma::ln_gamma(self.shape).0 + self.shape * self.rate.ln()
            + (self.shape - 1.) * self.expected_ln()
            - self.rate * self.mean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_update() {
        let mut s = OutputScale::new(GammaPrior::new(2., 1.));
        assert_abs_diff_eq!(s.mean(), 2.);
        s.update(10, 4.);
        assert_abs_diff_eq!(s.shape(), 7.);
        assert_abs_diff_eq!(s.rate(), 3.);
        assert_abs_diff_eq!(s.mean(), 7. / 3.);
    }

    #[test]
    fn test_kl_is_zero_at_prior() {
        let s = OutputScale::new(GammaPrior::new(3., 0.5));
        assert_abs_diff_eq!(s.ln_p() - s.ln_q(), 0., epsilon = 1e-12);
        let mut s = s;
        s.update(4, 1.);
        assert!(s.ln_p() - s.ln_q() < 0.);
    }

    #[test]
    fn test_expected_ln() {
        // E[ln s] = digamma(1) - ln(1) = -euler gamma
        let s = OutputScale::new(GammaPrior::new(1., 1.));
        assert_abs_diff_eq!(s.expected_ln(), -0.5772156649015329, epsilon = 1e-10);
    }
}
