use crate::errors::{PrefError, Result};
use linfa::ParamGuard;
use ndarray::{array, Array1, Array2};
use prefbox_gp::correlation_models::Kernel;
use prefbox_gp::Inducings;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Default number of latent factors
pub const DEFAULT_NFACTORS: usize = 20;
/// Default max number of inducing points (items and people)
pub const DEFAULT_NINDUCING: usize = 500;
/// Default max mini-batch size
pub const DEFAULT_UPDATE_SIZE: usize = 500;

/// Inference scheme
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Inference {
    /// Stochastic variational inference on mini-batches with a decaying step size
    #[default]
    Stochastic,
    /// Variational Bayes on the whole data set at every iteration (step size 1)
    FullBatch,
}

/// Gamma prior (shape, rate) on an output scale, ie. the inverse variance of a latent GP
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct GammaPrior {
    /// Shape parameter
    pub shape: f64,
    /// Rate parameter
    pub rate: f64,
}

impl GammaPrior {
    /// Constructor
    pub fn new(shape: f64, rate: f64) -> Self {
        GammaPrior { shape, rate }
    }

    /// Prior mean of the output scale
    pub fn mean(&self) -> f64 {
        self.shape / self.rate
    }
}

impl Default for GammaPrior {
    fn default() -> Self {
        GammaPrior::new(1., 1.)
    }
}

/// A set of validated collaborative preference learning parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct CollabPrefValidParams {
    pub(crate) nfactors: usize,
    pub(crate) kernel: Kernel,
    pub(crate) item_length_scales: Array1<f64>,
    pub(crate) person_length_scales: Array1<f64>,
    pub(crate) item_inducings: Inducings<f64>,
    pub(crate) person_inducings: Inducings<f64>,
    pub(crate) consensus_scale_prior: GammaPrior,
    pub(crate) factor_scale_prior: GammaPrior,
    pub(crate) person_scale_prior: GammaPrior,
    pub(crate) learn_person_scale: bool,
    pub(crate) use_common_mean: bool,
    pub(crate) consensus_prior_mean: f64,
    pub(crate) uncorrelated_noise: bool,
    pub(crate) inference: Inference,
    pub(crate) max_update_size: usize,
    pub(crate) forgetting_rate: f64,
    pub(crate) delay: f64,
    pub(crate) conv_threshold: f64,
    pub(crate) max_iter: usize,
    pub(crate) min_iter: usize,
    pub(crate) n_converged: Option<usize>,
    pub(crate) conv_threshold_g: f64,
    pub(crate) max_iter_g: usize,
    pub(crate) jitter: f64,
    pub(crate) seed: Option<u64>,
}

impl Default for CollabPrefValidParams {
    fn default() -> CollabPrefValidParams {
        CollabPrefValidParams {
            nfactors: DEFAULT_NFACTORS,
            kernel: Kernel::default(),
            item_length_scales: array![1.],
            person_length_scales: array![1.],
            item_inducings: Inducings::Clustered(DEFAULT_NINDUCING),
            person_inducings: Inducings::Clustered(DEFAULT_NINDUCING),
            consensus_scale_prior: GammaPrior::default(),
            factor_scale_prior: GammaPrior::default(),
            person_scale_prior: GammaPrior::default(),
            learn_person_scale: false,
            use_common_mean: true,
            consensus_prior_mean: 0.,
            uncorrelated_noise: false,
            inference: Inference::default(),
            max_update_size: DEFAULT_UPDATE_SIZE,
            forgetting_rate: 0.9,
            delay: 1.,
            conv_threshold: 1e-1,
            max_iter: 100,
            min_iter: 3,
            n_converged: None,
            conv_threshold_g: 1e-5,
            max_iter_g: 10,
            jitter: 1e-6,
            seed: None,
        }
    }
}

impl CollabPrefValidParams {
    /// Get the number of latent factors (clamped to the number of people at fit time)
    pub fn nfactors(&self) -> usize {
        self.nfactors
    }

    /// Get the kernel used for items and people
    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    /// Get item length-scales (one per item feature or a single shared value)
    pub fn item_length_scales(&self) -> &Array1<f64> {
        &self.item_length_scales
    }

    /// Get person length-scales (one per person feature or a single shared value)
    pub fn person_length_scales(&self) -> &Array1<f64> {
        &self.person_length_scales
    }

    /// Get item inducing points specification
    pub fn item_inducings(&self) -> &Inducings<f64> {
        &self.item_inducings
    }

    /// Get person inducing points specification
    pub fn person_inducings(&self) -> &Inducings<f64> {
        &self.person_inducings
    }

    /// Get the output scale prior of the consensus function
    pub fn consensus_scale_prior(&self) -> GammaPrior {
        self.consensus_scale_prior
    }

    /// Get the output scale prior of every item factor
    pub fn factor_scale_prior(&self) -> GammaPrior {
        self.factor_scale_prior
    }

    /// Get the output scale prior of the person factors
    pub fn person_scale_prior(&self) -> GammaPrior {
        self.person_scale_prior
    }

    /// Whether the person factors output scale is learned
    pub fn learn_person_scale(&self) -> bool {
        self.learn_person_scale
    }

    /// Whether a consensus function shared by all people is modelled
    pub fn use_common_mean(&self) -> bool {
        self.use_common_mean
    }

    /// Get the prior mean of the consensus function
    pub fn consensus_prior_mean(&self) -> f64 {
        self.consensus_prior_mean
    }

    /// Whether person factors ignore person features
    pub fn uncorrelated_noise(&self) -> bool {
        self.uncorrelated_noise
    }

    /// Get the inference scheme
    pub fn inference(&self) -> Inference {
        self.inference
    }

    /// Get the max mini-batch size
    pub fn max_update_size(&self) -> usize {
        self.max_update_size
    }

    /// Get the SVI forgetting rate
    pub fn forgetting_rate(&self) -> f64 {
        self.forgetting_rate
    }

    /// Get the SVI delay
    pub fn delay(&self) -> f64 {
        self.delay
    }

    /// Get the lower bound convergence threshold
    pub fn conv_threshold(&self) -> f64 {
        self.conv_threshold
    }

    /// Get the max number of outer iterations
    pub fn max_iter(&self) -> usize {
        self.max_iter
    }

    /// Get the min number of outer iterations
    pub fn min_iter(&self) -> usize {
        self.min_iter
    }

    /// Get the number of converged iterations required before stopping
    pub fn n_converged(&self) -> usize {
        match (self.n_converged, self.inference) {
            (Some(n), _) => n,
            (None, Inference::Stochastic) => 10,
            (None, Inference::FullBatch) => 3,
        }
    }

    /// Get the convergence threshold of the likelihood linearization loop
    pub fn conv_threshold_g(&self) -> f64 {
        self.conv_threshold_g
    }

    /// Get the max number of linearization iterations
    pub fn max_iter_g(&self) -> usize {
        self.max_iter_g
    }

    /// Get the jitter added to kernel matrices
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Get seed
    pub fn seed(&self) -> Option<&u64> {
        self.seed.as_ref()
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for the execution of
/// the [collaborative preference learning algorithm](crate::CollabPrefModel).
pub struct CollabPrefParams(CollabPrefValidParams);

impl Default for CollabPrefParams {
    fn default() -> Self {
        Self(CollabPrefValidParams::default())
    }
}

impl CollabPrefParams {
    /// A constructor for parameters given the number of latent factors
    pub fn new(nfactors: usize) -> CollabPrefParams {
        Self(CollabPrefValidParams {
            nfactors,
            ..Default::default()
        })
    }

    /// A constructor from validated parameters
    pub fn new_from_valid(params: &CollabPrefValidParams) -> Self {
        Self(params.clone())
    }

    /// Set the number of latent factors
    pub fn nfactors(mut self, nfactors: usize) -> Self {
        self.0.nfactors = nfactors;
        self
    }

    /// Set the kernel
    pub fn kernel(mut self, kernel: Kernel) -> Self {
        self.0.kernel = kernel;
        self
    }

    /// Set item length-scales
    pub fn item_length_scales(mut self, length_scales: Array1<f64>) -> Self {
        self.0.item_length_scales = length_scales;
        self
    }

    /// Set person length-scales
    pub fn person_length_scales(mut self, length_scales: Array1<f64>) -> Self {
        self.0.person_length_scales = length_scales;
        self
    }

    /// Specify the max number of item inducing points placed by k-means
    pub fn n_item_inducings(mut self, n: usize) -> Self {
        self.0.item_inducings = Inducings::Clustered(n);
        self
    }

    /// Specify item inducing points as a (nz, item_dim) matrix
    pub fn item_inducings(mut self, z: Array2<f64>) -> Self {
        self.0.item_inducings = Inducings::Located(z);
        self
    }

    /// Specify the max number of person inducing points placed by k-means
    pub fn n_person_inducings(mut self, n: usize) -> Self {
        self.0.person_inducings = Inducings::Clustered(n);
        self
    }

    /// Specify person inducing points as a (nz, person_dim) matrix
    pub fn person_inducings(mut self, z: Array2<f64>) -> Self {
        self.0.person_inducings = Inducings::Located(z);
        self
    }

    /// Set the output scale prior of the consensus function
    pub fn consensus_scale_prior(mut self, shape: f64, rate: f64) -> Self {
        self.0.consensus_scale_prior = GammaPrior::new(shape, rate);
        self
    }

    /// Set the output scale prior of the item factors
    pub fn factor_scale_prior(mut self, shape: f64, rate: f64) -> Self {
        self.0.factor_scale_prior = GammaPrior::new(shape, rate);
        self
    }

    /// Set the output scale prior of the person factors
    pub fn person_scale_prior(mut self, shape: f64, rate: f64) -> Self {
        self.0.person_scale_prior = GammaPrior::new(shape, rate);
        self
    }

    /// Learn the person factors output scale instead of keeping its prior mean
    pub fn learn_person_scale(mut self, learn: bool) -> Self {
        self.0.learn_person_scale = learn;
        self
    }

    /// Model a consensus function shared by all people
    pub fn use_common_mean(mut self, use_common_mean: bool) -> Self {
        self.0.use_common_mean = use_common_mean;
        self
    }

    /// Set the prior mean of the consensus function
    pub fn consensus_prior_mean(mut self, mu0: f64) -> Self {
        self.0.consensus_prior_mean = mu0;
        self
    }

    /// Treat people as uncorrelated even when person features are given
    pub fn uncorrelated_noise(mut self, uncorrelated: bool) -> Self {
        self.0.uncorrelated_noise = uncorrelated;
        self
    }

    /// Set the inference scheme
    pub fn inference(mut self, inference: Inference) -> Self {
        self.0.inference = inference;
        self
    }

    /// Set the max mini-batch size
    pub fn max_update_size(mut self, size: usize) -> Self {
        self.0.max_update_size = size;
        self
    }

    /// Set the SVI forgetting rate, should be in ]0.5, 1]
    pub fn forgetting_rate(mut self, rate: f64) -> Self {
        self.0.forgetting_rate = rate;
        self
    }

    /// Set the SVI delay, should be >= 1
    pub fn delay(mut self, delay: f64) -> Self {
        self.0.delay = delay;
        self
    }

    /// Set the lower bound convergence threshold
    pub fn conv_threshold(mut self, threshold: f64) -> Self {
        self.0.conv_threshold = threshold;
        self
    }

    /// Set the max number of outer iterations
    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.0.max_iter = max_iter;
        self
    }

    /// Set the min number of outer iterations
    pub fn min_iter(mut self, min_iter: usize) -> Self {
        self.0.min_iter = min_iter;
        self
    }

    /// Set the number of converged iterations required before stopping
    pub fn n_converged(mut self, n: usize) -> Self {
        self.0.n_converged = Some(n);
        self
    }

    /// Set the convergence threshold of the likelihood linearization loop
    pub fn conv_threshold_g(mut self, threshold: f64) -> Self {
        self.0.conv_threshold_g = threshold;
        self
    }

    /// Set the max number of linearization iterations
    pub fn max_iter_g(mut self, max_iter: usize) -> Self {
        self.0.max_iter_g = max_iter;
        self
    }

    /// Set the jitter added to kernel matrices before inversion
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.0.jitter = jitter;
        self
    }

    /// Set the random generator seed used for inducing points and mini-batches
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.0.seed = seed;
        self
    }
}

impl From<CollabPrefValidParams> for CollabPrefParams {
    fn from(valid: CollabPrefValidParams) -> Self {
        CollabPrefParams(valid)
    }
}

fn check_prior(name: &str, prior: &GammaPrior) -> Result<()> {
    if !(prior.shape > 0. && prior.rate > 0.) {
        return Err(PrefError::InvalidConfig(format!(
            "{name} output scale prior should have positive shape and rate, got ({}, {})",
            prior.shape, prior.rate
        )));
    }
    Ok(())
}

impl ParamGuard for CollabPrefParams {
    type Checked = CollabPrefValidParams;
    type Error = PrefError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        let p = &self.0;
        if p.nfactors == 0 {
            return Err(PrefError::InvalidConfig(
                "`nfactors` should be at least 1".to_string(),
            ));
        }
        for (name, ls) in [
            ("item", &p.item_length_scales),
            ("person", &p.person_length_scales),
        ] {
            if ls.is_empty() || ls.iter().any(|l| !(*l > 0.)) {
                return Err(PrefError::InvalidConfig(format!(
                    "{name} length-scales should be non empty and positive, got {ls}"
                )));
            }
        }
        for (name, z) in [("item", &p.item_inducings), ("person", &p.person_inducings)] {
            match z {
                Inducings::Clustered(0) => {
                    return Err(PrefError::InvalidConfig(format!(
                        "at least one {name} inducing point is required"
                    )))
                }
                Inducings::Located(z) if z.nrows() == 0 => {
                    return Err(PrefError::InvalidConfig(format!(
                        "at least one {name} inducing point is required"
                    )))
                }
                _ => (),
            }
        }
        check_prior("consensus", &p.consensus_scale_prior)?;
        check_prior("factor", &p.factor_scale_prior)?;
        check_prior("person", &p.person_scale_prior)?;
        if p.max_update_size == 0 {
            return Err(PrefError::InvalidConfig(
                "`max_update_size` should be at least 1".to_string(),
            ));
        }
        if !(p.forgetting_rate > 0.5 && p.forgetting_rate <= 1.) {
            return Err(PrefError::InvalidConfig(format!(
                "`forgetting_rate` should be in ]0.5, 1], got {}",
                p.forgetting_rate
            )));
        }
        if !(p.delay >= 1.) {
            return Err(PrefError::InvalidConfig(format!(
                "`delay` should be >= 1, got {}",
                p.delay
            )));
        }
        if !(p.conv_threshold > 0. && p.conv_threshold_g > 0.) {
            return Err(PrefError::InvalidConfig(
                "convergence thresholds should be positive".to_string(),
            ));
        }
        if p.min_iter > p.max_iter || p.max_iter == 0 || p.max_iter_g == 0 {
            return Err(PrefError::InvalidConfig(format!(
                "iteration budgets should satisfy 0 < min_iter ({}) <= max_iter ({}) and max_iter_g ({}) > 0",
                p.min_iter, p.max_iter, p.max_iter_g
            )));
        }
        if !(p.jitter >= 0.) {
            return Err(PrefError::InvalidConfig(format!(
                "`jitter` should be non negative, got {}",
                p.jitter
            )));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_valid() {
        let params = CollabPrefParams::default().check().unwrap();
        assert_eq!(params.nfactors(), DEFAULT_NFACTORS);
        assert_eq!(params.n_converged(), 10);
        assert_eq!(params.conv_threshold(), 1e-1);
        assert_eq!(params.kernel(), Kernel::Matern32);
    }

    #[test]
    fn test_full_batch_n_converged() {
        let params = CollabPrefParams::new(2)
            .inference(Inference::FullBatch)
            .check()
            .unwrap();
        assert_eq!(params.n_converged(), 3);
        let params = CollabPrefParams::new(2).n_converged(5).check().unwrap();
        assert_eq!(params.n_converged(), 5);
    }

    #[test]
    fn test_invalid_params() {
        assert!(CollabPrefParams::new(0).check().is_err());
        assert!(CollabPrefParams::new(2).forgetting_rate(0.4).check().is_err());
        assert!(CollabPrefParams::new(2).delay(0.5).check().is_err());
        assert!(CollabPrefParams::new(2)
            .item_length_scales(array![1., -1.])
            .check()
            .is_err());
        assert!(CollabPrefParams::new(2)
            .factor_scale_prior(0., 1.)
            .check()
            .is_err());
        assert!(CollabPrefParams::new(2).n_item_inducings(0).check().is_err());
        assert!(CollabPrefParams::new(2)
            .min_iter(10)
            .max_iter(5)
            .check()
            .is_err());
    }
}
