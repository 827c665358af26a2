use crate::errors::Result;
use crate::utils::{cholesky_inverse, log_det, symmetrize};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Robbins-Monro step size `(iter + delay)^-forgetting_rate`
pub fn svi_rate<F: Float>(iter: usize, delay: F, forgetting_rate: F) -> F {
    (F::cast(iter) + delay).powf(-forgetting_rate)
}

/// Gaussian variational posterior over the values `u` of a latent function
/// at M inducing points, updated by stochastic natural-gradient steps.
///
/// Natural parameters `S^-1` and `S^-1 m` are blended with the ones saved by
/// [SviGaussian::begin_step] so that the inner re-linearization loop of a
/// single outer iteration always starts from the same point.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SviGaussian<F: Float> {
    inv_s: Array2<F>,
    inv_sm: Array1<F>,
    s: Array2<F>,
    m: Array1<F>,
    prev_inv_s: Array2<F>,
    prev_inv_sm: Array1<F>,
    lambda: Array2<F>,
}

impl<F: Float> SviGaussian<F> {
    /// Posterior equal to the prior `N(0, K_mm / scale)`
    pub fn from_prior(k_mm: &Array2<F>, inv_k_mm: &Array2<F>, scale: F) -> Self {
        let m = inv_k_mm.nrows();
        let inv_s = inv_k_mm.mapv(|v| v * scale);
        SviGaussian {
            s: k_mm.mapv(|v| v / scale),
            m: Array1::zeros(m),
            inv_sm: Array1::zeros(m),
            prev_inv_s: inv_s.to_owned(),
            prev_inv_sm: Array1::zeros(m),
            lambda: Array2::zeros((m, m)),
            inv_s,
        }
    }

    /// Save current natural parameters as the base of the next blended updates
    pub fn begin_step(&mut self) {
        self.prev_inv_s.assign(&self.inv_s);
        self.prev_inv_sm.assign(&self.inv_sm);
    }

    /// One stochastic natural-gradient update:
    ///
    /// `S^-1 = (1 - rho) S^-1_prev + rho (prior_precision + weight * lambda)`
    /// `S^-1 m = (1 - rho) (S^-1 m)_prev + rho * weight * eta`
    ///
    /// `lambda` and `eta` are the data precision and mean contributions of the mini-batch
    /// and `weight` is `N / batch_size`.
    pub fn update(
        &mut self,
        prior_precision: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lambda: Array2<F>,
        eta: &ArrayBase<impl Data<Elem = F>, Ix1>,
        rho: F,
        weight: F,
    ) -> Result<()> {
        let keep = F::one() - rho;
        let inv_s = self.prev_inv_s.mapv(|v| v * keep)
            + (prior_precision + &lambda.mapv(|v| v * weight)).mapv(|v| v * rho);
        let inv_sm = self.prev_inv_sm.mapv(|v| v * keep) + eta.mapv(|v| v * rho * weight);
        let s = cholesky_inverse(&inv_s, "posterior precision S^-1")?;
        self.m = s.dot(&inv_sm);
        self.s = s;
        self.inv_s = symmetrize(&inv_s);
        self.inv_sm = inv_sm;
        self.lambda = lambda;
        Ok(())
    }

    /// Posterior mean m
    pub fn mean(&self) -> &Array1<F> {
        &self.m
    }

    /// Posterior covariance S
    pub fn cov(&self) -> &Array2<F> {
        &self.s
    }

    /// Posterior precision S^-1
    pub fn precision(&self) -> &Array2<F> {
        &self.inv_s
    }

    /// Unweighted data precision of the last update
    pub fn lambda(&self) -> &Array2<F> {
        &self.lambda
    }

    /// Number of inducing points
    pub fn dim(&self) -> usize {
        self.m.len()
    }

    /// `tr(K_mm^-1 (S + m m^T))`, the expected prior quadratic form before output scaling
    pub fn second_moment_trace(&self, inv_k_mm: &Array2<F>) -> F {
        let tr_s = (inv_k_mm * &self.s).sum();
        let quad = self.m.dot(&inv_k_mm.dot(&self.m));
        tr_s + quad
    }

    /// `E[ln N(u; 0, K_mm / s)]` given `ln |K_mm|`, `E[s]` and `E[ln s]`
    pub fn expected_log_prior(
        &self,
        log_det_k_mm: F,
        inv_k_mm: &Array2<F>,
        scale: F,
        expected_log_scale: F,
    ) -> F {
        let m = F::cast(self.dim());
        let half = F::cast(0.5);
        -half * m * F::cast(2. * std::f64::consts::PI).ln() - half * log_det_k_mm
            + half * m * expected_log_scale
            - half * scale * self.second_moment_trace(inv_k_mm)
    }

    /// `E[ln q(u)]`, the negative entropy of the posterior
    pub fn expected_log_q(&self) -> Result<F> {
        let m = F::cast(self.dim());
        let half = F::cast(0.5);
        let log_det_s = log_det(&self.s, "posterior covariance S")?;
        Ok(-half * m * F::cast(2. * std::f64::consts::PI).ln() - half * log_det_s - half * m)
    }
}
