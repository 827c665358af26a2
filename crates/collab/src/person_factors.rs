use crate::data::MiniBatch;
use crate::errors::{PrefError, Result};
use crate::likelihood::Linearization;
use crate::output_scale::OutputScale;
use crate::parameters::GammaPrior;
use log::debug;
use ndarray::{Array1, Array2, Axis, Zip};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use prefbox_gp::correlation_models::Kernel;
use prefbox_gp::{InducingSpace, SviGaussian};
use rand_xoshiro::Xoshiro256Plus;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Variational posterior family of the person factors
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
enum PersonPosterior {
    /// Independent Gaussian per (factor, person), stored as natural parameters
    Independent {
        inv_s: Array2<f64>,
        inv_sm: Array2<f64>,
        prev_inv_s: Array2<f64>,
        prev_inv_sm: Array2<f64>,
    },
    /// One sparse GP per factor over person features
    Sparse(Vec<SviGaussian<f64>>),
}

/// Person loadings `y` (nfactors, people) with their posterior variances
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub(crate) struct PersonFactors {
    posterior: PersonPosterior,
    scales: Vec<OutputScale>,
    learn_scale: bool,
    values: Array2<f64>,
    variances: Array2<f64>,
}

/// Starting loadings: identity when there are as many factors as people, standard normal otherwise
fn initial_values(nfactors: usize, npeople: usize, rng: &mut Xoshiro256Plus) -> Array2<f64> {
    if nfactors == npeople {
        Array2::eye(nfactors)
            + Array2::<f64>::random_using((nfactors, npeople), StandardNormal, rng) * 1e-6
    } else {
        Array2::<f64>::random_using((nfactors, npeople), StandardNormal, rng)
    }
}

impl PersonFactors {
    /// Loadings without person features
    pub fn independent(
        nfactors: usize,
        npeople: usize,
        prior: GammaPrior,
        learn_scale: bool,
        rng: &mut Xoshiro256Plus,
    ) -> Self {
        let scale = OutputScale::new(prior);
        let values = initial_values(nfactors, npeople, rng);
        let inv_s = Array2::from_elem((nfactors, npeople), scale.mean());
        let inv_sm = &inv_s * &values;
        PersonFactors {
            posterior: PersonPosterior::Independent {
                prev_inv_s: inv_s.clone(),
                prev_inv_sm: inv_sm.clone(),
                inv_s,
                inv_sm,
            },
            scales: vec![scale; nfactors],
            learn_scale,
            variances: Array2::from_elem((nfactors, npeople), 1. / scale.mean()),
            values,
        }
    }

    /// Loadings as sparse GPs over the person features of `persons`
    pub fn sparse(
        persons: &InducingSpace<f64, Kernel>,
        nfactors: usize,
        prior: GammaPrior,
        learn_scale: bool,
        rng: &mut Xoshiro256Plus,
    ) -> Self {
        let scale = OutputScale::new(prior);
        let npeople = persons.n_train();
        PersonFactors {
            posterior: PersonPosterior::Sparse(
                (0..nfactors)
                    .map(|_| {
                        SviGaussian::from_prior(persons.k_mm(), persons.inv_k_mm(), scale.mean())
                    })
                    .collect(),
            ),
            scales: vec![scale; nfactors],
            learn_scale,
            values: initial_values(nfactors, npeople, rng),
            variances: Array2::from_elem(
                (nfactors, npeople),
                persons.prior_var() / scale.mean(),
            ),
        }
    }

    /// Posterior means (nfactors, people)
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Posterior variances (nfactors, people)
    pub fn variances(&self) -> &Array2<f64> {
        &self.variances
    }

    pub fn nfactors(&self) -> usize {
        self.values.nrows()
    }

    pub fn npeople(&self) -> usize {
        self.values.ncols()
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.posterior, PersonPosterior::Sparse(_))
    }

    pub fn scales(&self) -> &[OutputScale] {
        &self.scales
    }

    /// Factor posteriors when loadings are sparse GPs
    pub fn posteriors(&self) -> Option<&[SviGaussian<f64>]> {
        match &self.posterior {
            PersonPosterior::Sparse(posteriors) => Some(posteriors),
            PersonPosterior::Independent { .. } => None,
        }
    }

    fn begin_step(&mut self) {
        match &mut self.posterior {
            PersonPosterior::Independent {
                inv_s,
                inv_sm,
                prev_inv_s,
                prev_inv_sm,
            } => {
                prev_inv_s.assign(inv_s);
                prev_inv_sm.assign(inv_sm);
            }
            PersonPosterior::Sparse(posteriors) => {
                posteriors.iter_mut().for_each(|p| p.begin_step())
            }
        }
    }

    /// Update the loadings on a mini-batch given `t`, the item loadings `w` (items, nfactors)
    /// and the variances of their differences (nfactors, batch size).
    ///
    /// The data precision of `y_fp` is `J^2 E[(w_af - w_bf)^2] / Q` summed over the
    /// comparisons made by person `p`.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        batch: &MiniBatch,
        person_space: Option<&InducingSpace<f64, Kernel>>,
        t: &Array1<f64>,
        w: &Array2<f64>,
        w_diff_var: &Array2<f64>,
        conv_threshold_g: f64,
        max_iter_g: usize,
    ) -> Result<()> {
        let space = person_space;
        if self.is_sparse() && space.is_none() {
            return Err(PrefError::InvalidConfig(
                "sparse person factors need person features".to_string(),
            ));
        }
        self.begin_step();
        let precision = batch.noise.mapv(|q| 1. / q);
        let dw = batch.factor_differences(w);
        let dw_sq = &dw * &dw + w_diff_var;

        let mut previous: Option<Linearization> = None;
        let mut n_iter = 0;
        while n_iter < max_iter_g {
            n_iter += 1;
            let lin = Linearization::at(&batch.latent_differences(t, w, &self.values));
            let jac_sq = &lin.jacobian * &lin.jacobian;

            for f in 0..self.nfactors() {
                let dwf = dw.row(f);
                let y_batch = self.values.row(f).select(Axis(0), &batch.persons);
                let z0 = lin.offsets(&(&dwf * &y_batch));
                let lambda_obs = &jac_sq * &dw_sq.row(f) * &precision;
                let eta_obs = (&batch.labels - &z0) * &lin.jacobian * &dwf * &precision;
                let prior_precision = self.scales[f].mean();
                match (&mut self.posterior, space) {
                    (
                        PersonPosterior::Independent {
                            inv_s,
                            inv_sm,
                            prev_inv_s,
                            prev_inv_sm,
                        },
                        _,
                    ) => {
                        let mut lambda = Array1::<f64>::zeros(self.values.ncols());
                        let mut eta = Array1::<f64>::zeros(self.values.ncols());
                        for (i, &p) in batch.persons.iter().enumerate() {
                            lambda[p] += lambda_obs[i];
                            eta[p] += eta_obs[i];
                        }
                        let keep = 1. - batch.rho;
                        let new_inv_s = prev_inv_s.row(f).mapv(|v| v * keep)
                            + (lambda * batch.weight + prior_precision) * batch.rho;
                        let new_inv_sm = prev_inv_sm.row(f).mapv(|v| v * keep)
                            + eta * (batch.weight * batch.rho);
                        Zip::from(self.values.row_mut(f))
                            .and(self.variances.row_mut(f))
                            .and(&new_inv_s)
                            .and(&new_inv_sm)
                            .for_each(|y, v, &prec, &prec_mean| {
                                *y = prec_mean / prec;
                                *v = 1. / prec;
                            });
                        inv_s.row_mut(f).assign(&new_inv_s);
                        inv_sm.row_mut(f).assign(&new_inv_sm);
                    }
                    (PersonPosterior::Sparse(posteriors), Some(space)) => {
                        let c = space.projection().select(Axis(0), &batch.persons);
                        let lambda = c.t().dot(&(&c * &lambda_obs.view().insert_axis(Axis(1))));
                        let eta = c.t().dot(&eta_obs);
                        posteriors[f].update(
                            &(space.inv_k_mm() * prior_precision),
                            lambda,
                            &eta,
                            batch.rho,
                            batch.weight,
                        )?;
                        self.values
                            .row_mut(f)
                            .assign(&space.project_mean(posteriors[f].mean()));
                        self.variances
                            .row_mut(f)
                            .assign(&space.train_variances(posteriors[f].cov(), prior_precision));
                    }
                    (PersonPosterior::Sparse(_), None) => {
                        return Err(PrefError::InvalidConfig(
                            "sparse person factors need person features".to_string(),
                        ))
                    }
                }
            }

            let change = lin.change_from(previous.as_ref());
            debug!("y linearization iter {n_iter}: jacobian change = {change:e}");
            if change < conv_threshold_g {
                break;
            }
            previous = Some(lin);
        }

        if self.learn_scale {
            self.update_scales(space);
        }
        Ok(())
    }

    fn update_scales(&mut self, space: Option<&InducingSpace<f64, Kernel>>) {
        match (&self.posterior, space) {
            (PersonPosterior::Sparse(posteriors), Some(space)) => {
                for (scale, posterior) in self.scales.iter_mut().zip(posteriors.iter()) {
                    scale.update(
                        space.n_inducings(),
                        posterior.second_moment_trace(space.inv_k_mm()),
                    );
                }
            }
            _ => {
                for (f, scale) in self.scales.iter_mut().enumerate() {
                    let y = self.values.row(f);
                    let trace = y.dot(&y) + self.variances.row(f).sum();
                    scale.update(self.values.ncols(), trace);
                }
            }
        }
    }

    /// `E[ln s]` of factor `f`: the scale is a point mass at its prior mean when not learned
    fn expected_ln_scale(&self, f: usize) -> f64 {
        if self.learn_scale {
            self.scales[f].expected_ln()
        } else {
            self.scales[f].mean().ln()
        }
    }

    /// Sum over factors of `E[ln p(y)] - E[ln q(y)]`, plus the scale terms when learned
    pub fn lower_bound(&self, person_space: Option<&InducingSpace<f64, Kernel>>) -> Result<f64> {
        let mut lb = 0.;
        for f in 0..self.nfactors() {
            let scale = self.scales[f].mean();
            let e_ln_scale = self.expected_ln_scale(f);
            lb += match (&self.posterior, person_space) {
                (PersonPosterior::Sparse(posteriors), Some(space)) => {
                    posteriors[f].expected_log_prior(
                        space.log_det_k_mm(),
                        space.inv_k_mm(),
                        scale,
                        e_ln_scale,
                    ) - posteriors[f].expected_log_q()?
                }
                (PersonPosterior::Sparse(_), None) => {
                    return Err(PrefError::InvalidConfig(
                        "sparse person factors need person features".to_string(),
                    ))
                }
                (PersonPosterior::Independent { .. }, _) => Zip::from(self.values.row(f))
                    .and(self.variances.row(f))
                    .fold(0., |acc, &y, &v| {
                        // E[ln N(y; 0, 1/s)] - E[ln N(y; m, v)]
                        let logp = 0.5 * (e_ln_scale - (2. * PI).ln()) - 0.5 * scale * (y * y + v);
                        let logq = -0.5 * ((2. * PI * v).ln() + 1.);
                        acc + logp - logq
                    }),
            };
            if self.learn_scale {
                lb += self.scales[f].ln_p() - self.scales[f].ln_q();
            }
        }
        Ok(lb)
    }
}
