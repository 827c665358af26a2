//! Length-scale gradients of the variational lower bound, for external optimizers.
//!
//! Gradients follow the coordinate ascent argument: at convergence the implicit
//! dependencies of the posteriors on the length-scales vanish and only the explicit
//! dependency of the prior covariance `K_mm` is left. For a block with posterior
//! `N(m, S)`, output scale `s` and data precision `Λ`:
//!
//! `dL/dl = 0.5 * (s a^T dK a - tr(K^-1 S Λ dK))` with `a = K^-1 m`

use crate::algorithm::CollabPrefModel;
use crate::errors::{PrefError, Result};
use log::debug;
use ndarray::Array1;
use prefbox_gp::correlation_models::Kernel;
use prefbox_gp::{InducingSpace, SviGaussian};
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Which length-scales a gradient refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum LengthScaleKind {
    /// Length-scales of the item kernel, shared by `t` and `w`
    Item,
    /// Length-scales of the person kernel, when loadings are GPs over person features
    Person,
}

/// `dL/dl_dim` contribution of one sparse GP block
fn block_gradient(
    space: &InducingSpace<f64, Kernel>,
    dk: &ndarray::Array2<f64>,
    posterior: &SviGaussian<f64>,
    scale: f64,
) -> f64 {
    let a = space.inv_k_mm().dot(posterior.mean());
    let quad = a.dot(&dk.dot(&a)) * scale;
    let tr = (space.inv_k_mm().dot(posterior.cov()).dot(posterior.lambda()) * dk.t()).sum();
    0.5 * (quad - tr)
}

impl CollabPrefModel {
    fn space(&self, kind: LengthScaleKind) -> Result<&InducingSpace<f64, Kernel>> {
        match kind {
            LengthScaleKind::Item => Ok(&self.items),
            LengthScaleKind::Person => self.person_space.as_ref().ok_or_else(|| {
                PrefError::InvalidConfig(
                    "person length-scales are only used with person features".to_string(),
                )
            }),
        }
    }

    /// Gradient of the lower bound with respect to `ln l_dim`, the log length-scale of
    /// feature dimension `dim`
    pub fn lowerbound_gradient(&self, kind: LengthScaleKind, dim: usize) -> Result<f64> {
        let space = self.space(kind)?;
        let nx = space.length_scales().len();
        if dim >= nx {
            return Err(PrefError::InvalidData(format!(
                "length-scale dimension {dim} out of the {nx} feature dimensions"
            )));
        }
        let dk = space.k_mm_derivative(dim);
        let mut grad = 0.;
        match kind {
            LengthScaleKind::Item => {
                if let Some(consensus) = self.consensus.as_ref() {
                    grad += block_gradient(space, &dk, consensus.posterior(), consensus.scale().mean());
                }
                for (posterior, scale) in self
                    .item_factors
                    .posteriors()
                    .iter()
                    .zip(self.item_factors.scales().iter())
                {
                    grad += block_gradient(space, &dk, posterior, scale.mean());
                }
            }
            LengthScaleKind::Person => {
                if let Some(posteriors) = self.person_factors.posteriors() {
                    for (posterior, scale) in
                        posteriors.iter().zip(self.person_factors.scales().iter())
                    {
                        grad += block_gradient(space, &dk, posterior, scale.mean());
                    }
                }
            }
        }
        Ok(grad * space.length_scales()[dim])
    }

    /// Gradient of the lower bound with respect to the log length-scale parameters:
    /// one value per dimension, or a single value summed over dimensions when one
    /// length-scale is shared by all of them
    pub fn lowerbound_gradients(&self, kind: LengthScaleKind) -> Result<Array1<f64>> {
        let nx = self.space(kind)?.length_scales().len();
        let grads = (0..nx)
            .into_par_iter()
            .map(|dim| self.lowerbound_gradient(kind, dim))
            .collect::<Result<Vec<f64>>>()?;
        debug!("{kind:?} log length-scale gradients = {grads:?}");
        let shared = match kind {
            LengthScaleKind::Item => self.params.item_length_scales().len() == 1,
            LengthScaleKind::Person => self.params.person_length_scales().len() == 1,
        };
        if shared {
            Ok(Array1::from_elem(1, grads.iter().sum()))
        } else {
            Ok(Array1::from_vec(grads))
        }
    }

    /// Set new length-scales and recompute the corresponding kernel matrices.
    /// Posteriors are kept and only updated by the next inference run.
    pub fn set_length_scales(&mut self, kind: LengthScaleKind, length_scales: Array1<f64>) -> Result<()> {
        if length_scales.iter().any(|l| !(*l > 0.)) {
            return Err(PrefError::InvalidConfig(format!(
                "length-scales should be positive, got {length_scales}"
            )));
        }
        let space = self.space(kind)?.with_length_scales(&length_scales)?;
        match kind {
            LengthScaleKind::Item => {
                self.items = space;
                self.params.item_length_scales = length_scales;
            }
            LengthScaleKind::Person => {
                self.person_space = Some(space);
                self.params.person_length_scales = length_scales;
            }
        }
        Ok(())
    }

    /// Negative lower bound after refitting with length-scales `exp(log_item_ls)`
    /// (and `exp(log_person_ls)` if given), the objective of an external minimizer
    pub fn neg_lowerbound_at(
        &mut self,
        log_item_ls: &Array1<f64>,
        log_person_ls: Option<&Array1<f64>>,
    ) -> Result<f64> {
        self.set_length_scales(LengthScaleKind::Item, log_item_ls.mapv(f64::exp))?;
        if let Some(log_ls) = log_person_ls {
            self.set_length_scales(LengthScaleKind::Person, log_ls.mapv(f64::exp))?;
        }
        self.refit()?;
        let lb = self.lowerbound()?;
        debug!("Lower bound at log length-scales {log_item_ls} = {lb}");
        Ok(-lb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Comparison, Observations, PreferenceData};
    use crate::parameters::Inference;
    use approx::assert_abs_diff_eq;
    use linfa::ParamGuard;
    use ndarray::array;

    fn data_2d() -> PreferenceData {
        let x = array![[0., 0.], [1., 0.5], [2., 0.], [0.5, 2.], [1.5, 1.5], [2.5, 1.]];
        let comparisons: Vec<Comparison> = [
            (0, 1, 0, 1.),
            (0, 2, 1, 1.),
            (0, 4, 3, 1.),
            (1, 0, 2, 1.),
            (1, 3, 5, 1.),
            (1, 1, 4, 0.5),
            (0, 5, 0, 1.),
            (1, 3, 4, 1.),
        ]
        .iter()
        .map(|&(p, a, b, z)| Comparison::new(p, a, b, z))
        .collect();
        PreferenceData::new(Observations::from_comparisons(&comparisons).unwrap(), x, None).unwrap()
    }

    fn fit(ls: Array1<f64>) -> CollabPrefModel {
        CollabPrefModel::params(2)
            .item_length_scales(ls)
            .inference(Inference::FullBatch)
            .max_iter(10)
            .seed(Some(42))
            .check()
            .unwrap()
            .fit(&data_2d())
            .unwrap()
    }

    #[test]
    fn test_shared_gradient_sums_dimensions() {
        let per_dim = fit(array![1.2, 1.2]);
        let shared = fit(array![1.2]);
        let g = per_dim.lowerbound_gradients(LengthScaleKind::Item).unwrap();
        let gs = shared.lowerbound_gradients(LengthScaleKind::Item).unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(gs.len(), 1);
        assert_abs_diff_eq!(gs[0], g.sum(), epsilon = 1e-8);
        assert_abs_diff_eq!(
            g[1],
            per_dim.lowerbound_gradient(LengthScaleKind::Item, 1).unwrap(),
            epsilon = 1e-12
        );
        assert!(g.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_person_gradient_needs_person_features() {
        let model = fit(array![1.]);
        assert!(model.lowerbound_gradients(LengthScaleKind::Person).is_err());
        assert!(model.lowerbound_gradient(LengthScaleKind::Item, 2).is_err());
    }

    #[test]
    fn test_neg_lowerbound_at() {
        let mut model = fit(array![1., 1.]);
        let ls = array![0.3f64.ln(), 2f64.ln()];
        let neg_lb = model.neg_lowerbound_at(&ls, None).unwrap();
        assert!(neg_lb.is_finite());
        assert_abs_diff_eq!(neg_lb, -model.lowerbound().unwrap(), epsilon = 1e-12);
        assert_abs_diff_eq!(model.params_used().item_length_scales(), &array![0.3, 2.], epsilon = 1e-12);
        assert!(model
            .set_length_scales(LengthScaleKind::Item, array![1., -1.])
            .is_err());
    }
}
