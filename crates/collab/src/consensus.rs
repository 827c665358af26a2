use crate::data::MiniBatch;
use crate::errors::Result;
use crate::likelihood::Linearization;
use crate::output_scale::OutputScale;
use crate::parameters::GammaPrior;
use log::debug;
use ndarray::{Array1, Array2, Axis};
use prefbox_gp::correlation_models::Kernel;
use prefbox_gp::{InducingSpace, SviGaussian};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Sparse GP posterior over the consensus value `t` of every item,
/// shared by all people.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub(crate) struct Consensus {
    posterior: SviGaussian<f64>,
    scale: OutputScale,
    prior_mean: f64,
    values: Array1<f64>,
}

impl Consensus {
    pub fn new(items: &InducingSpace<f64, Kernel>, prior: GammaPrior, prior_mean: f64) -> Self {
        let scale = OutputScale::new(prior);
        Consensus {
            posterior: SviGaussian::from_prior(items.k_mm(), items.inv_k_mm(), scale.mean()),
            scale,
            prior_mean,
            values: Array1::from_elem(items.n_train(), prior_mean),
        }
    }

    /// Consensus values at every item location
    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    pub fn posterior(&self) -> &SviGaussian<f64> {
        &self.posterior
    }

    pub fn scale(&self) -> &OutputScale {
        &self.scale
    }

    pub fn prior_mean(&self) -> f64 {
        self.prior_mean
    }

    /// Update `t` on a mini-batch given the current item factors `w` (items, nfactors)
    /// and person factors `y` (nfactors, people), re-linearizing the likelihood until
    /// its jacobian is stable. Returns the number of linearization iterations.
    pub fn update(
        &mut self,
        batch: &MiniBatch,
        items: &InducingSpace<f64, Kernel>,
        w: &Array2<f64>,
        y: &Array2<f64>,
        conv_threshold_g: f64,
        max_iter_g: usize,
    ) -> Result<usize> {
        self.posterior.begin_step();
        let prior_precision = items.inv_k_mm() * self.scale.mean();
        let precision = batch.noise.mapv(|q| 1. / q);

        let mut previous: Option<Linearization> = None;
        let mut n_iter = 0;
        while n_iter < max_iter_g {
            n_iter += 1;
            let lin = Linearization::at(&batch.latent_differences(&self.values, w, y));
            let dt = Array1::from_shape_fn(batch.len(), |i| {
                self.values[batch.items_a[i]] - self.values[batch.items_b[i]]
            });
            let z0 = lin.offsets(&dt);

            let dj = &batch.d_proj * &lin.jacobian.view().insert_axis(Axis(1));
            let weighted = &dj * &precision.view().insert_axis(Axis(1));
            let lambda = dj.t().dot(&weighted);
            let eta = weighted.t().dot(&(&batch.labels - &z0));
            self.posterior
                .update(&prior_precision, lambda, &eta, batch.rho, batch.weight)?;
            self.values = items.project_mean(self.posterior.mean()) + self.prior_mean;

            let change = lin.change_from(previous.as_ref());
            debug!("t linearization iter {n_iter}: jacobian change = {change:e}");
            if change < conv_threshold_g {
                break;
            }
            previous = Some(lin);
        }

        self.scale.update(
            items.n_inducings(),
            self.posterior.second_moment_trace(items.inv_k_mm()),
        );
        Ok(n_iter)
    }

    /// Posterior variances of `t_a - t_b` for the batch comparisons
    pub fn difference_variances(
        &self,
        batch: &MiniBatch,
        items: &InducingSpace<f64, Kernel>,
    ) -> Array1<f64> {
        items.posterior_difference_variances(
            &batch.d_proj,
            &batch.prior_diff,
            self.posterior.cov(),
            self.scale.mean(),
        )
    }

    /// `E[ln p(u)] - E[ln q(u)] + E[ln p(s)] - E[ln q(s)]`
    pub fn lower_bound(&self, items: &InducingSpace<f64, Kernel>) -> Result<f64> {
        let logp = self.posterior.expected_log_prior(
            items.log_det_k_mm(),
            items.inv_k_mm(),
            self.scale.mean(),
            self.scale.expected_ln(),
        );
        let logq = self.posterior.expected_log_q()?;
        Ok(logp - logq + self.scale.ln_p() - self.scale.ln_q())
    }
}
