use crate::data::MiniBatch;
use crate::errors::Result;
use crate::likelihood::Linearization;
use crate::output_scale::OutputScale;
use crate::parameters::GammaPrior;
use crate::person_factors::PersonFactors;
use log::debug;
use ndarray::{Array1, Array2, Axis};
use prefbox_gp::correlation_models::Kernel;
use prefbox_gp::{InducingSpace, SviGaussian};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Low-rank item loadings `w`: one independent sparse GP per latent factor
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub(crate) struct ItemFactors {
    posteriors: Vec<SviGaussian<f64>>,
    scales: Vec<OutputScale>,
    values: Array2<f64>,
}

impl ItemFactors {
    pub fn new(items: &InducingSpace<f64, Kernel>, nfactors: usize, prior: GammaPrior) -> Self {
        let scale = OutputScale::new(prior);
        ItemFactors {
            posteriors: (0..nfactors)
                .map(|_| SviGaussian::from_prior(items.k_mm(), items.inv_k_mm(), scale.mean()))
                .collect(),
            scales: vec![scale; nfactors],
            values: Array2::zeros((items.n_train(), nfactors)),
        }
    }

    /// Item loadings (items, nfactors)
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn nfactors(&self) -> usize {
        self.posteriors.len()
    }

    pub fn posteriors(&self) -> &[SviGaussian<f64>] {
        &self.posteriors
    }

    pub fn scales(&self) -> &[OutputScale] {
        &self.scales
    }

    /// Update every factor on a mini-batch given the consensus `t`, then update the
    /// person factors with the new loadings.
    ///
    /// The data precision of factor `f` for a comparison made by person `p` is scaled by
    /// `E[y_fp^2]`. Returns the posterior variances of `w_af - w_bf` (nfactors, batch size)
    /// used for the person update.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        batch: &MiniBatch,
        items: &InducingSpace<f64, Kernel>,
        t: &Array1<f64>,
        persons: &mut PersonFactors,
        person_space: Option<&InducingSpace<f64, Kernel>>,
        conv_threshold_g: f64,
        max_iter_g: usize,
    ) -> Result<Array2<f64>> {
        self.posteriors.iter_mut().for_each(|p| p.begin_step());
        let precision = batch.noise.mapv(|q| 1. / q);
        {
            let y = persons.values();
            let y_var = persons.variances();
            let y_batch = gather(y, &batch.persons);
            let y_sq_batch = &y_batch * &y_batch + gather(y_var, &batch.persons);

            let mut previous: Option<Linearization> = None;
            let mut n_iter = 0;
            while n_iter < max_iter_g {
                n_iter += 1;
                let lin = Linearization::at(&batch.latent_differences(t, &self.values, y));
                let dw = batch.factor_differences(&self.values);
                let dj = &batch.d_proj * &lin.jacobian.view().insert_axis(Axis(1));

                for f in 0..self.nfactors() {
                    let yf = y_batch.row(f);
                    let z0 = lin.offsets(&(&yf * &dw.row(f)));
                    let scaled = &dj * &(&y_sq_batch.row(f) * &precision).insert_axis(Axis(1));
                    let lambda = dj.t().dot(&scaled);
                    let eta = dj.t().dot(&((&batch.labels - &z0) * &yf * &precision));
                    let prior_precision = items.inv_k_mm() * self.scales[f].mean();
                    self.posteriors[f].update(
                        &prior_precision,
                        lambda,
                        &eta,
                        batch.rho,
                        batch.weight,
                    )?;
                    self.values
                        .column_mut(f)
                        .assign(&items.project_mean(self.posteriors[f].mean()));
                }

                let change = lin.change_from(previous.as_ref());
                debug!("w linearization iter {n_iter}: jacobian change = {change:e}");
                if change < conv_threshold_g {
                    break;
                }
                previous = Some(lin);
            }
        }

        for (scale, posterior) in self.scales.iter_mut().zip(self.posteriors.iter()) {
            scale.update(
                items.n_inducings(),
                posterior.second_moment_trace(items.inv_k_mm()),
            );
        }

        let w_diff_var = self.difference_variances(batch, items);
        persons.update(
            batch,
            person_space,
            t,
            &self.values,
            &w_diff_var,
            conv_threshold_g,
            max_iter_g,
        )?;
        Ok(w_diff_var)
    }

    /// Posterior variances of `w_af - w_bf` for the batch comparisons (nfactors, batch size)
    pub fn difference_variances(
        &self,
        batch: &MiniBatch,
        items: &InducingSpace<f64, Kernel>,
    ) -> Array2<f64> {
        let mut var = Array2::zeros((self.nfactors(), batch.len()));
        for (f, mut row) in var.rows_mut().into_iter().enumerate() {
            row.assign(&items.posterior_difference_variances(
                &batch.d_proj,
                &batch.prior_diff,
                self.posteriors[f].cov(),
                self.scales[f].mean(),
            ));
        }
        var
    }

    /// Sum over factors of `E[ln p(u)] - E[ln q(u)] + E[ln p(s)] - E[ln q(s)]`
    pub fn lower_bound(&self, items: &InducingSpace<f64, Kernel>) -> Result<f64> {
        let mut lb = 0.;
        for (posterior, scale) in self.posteriors.iter().zip(self.scales.iter()) {
            lb += posterior.expected_log_prior(
                items.log_det_k_mm(),
                items.inv_k_mm(),
                scale.mean(),
                scale.expected_ln(),
            ) - posterior.expected_log_q()?
                + scale.ln_p()
                - scale.ln_q();
        }
        Ok(lb)
    }
}

/// Columns `persons` of `m` (nfactors, people) as a (nfactors, batch size) matrix
pub(crate) fn gather(m: &Array2<f64>, persons: &[usize]) -> Array2<f64> {
    m.select(Axis(1), persons)
}
