use crate::consensus::Consensus;
use crate::data::{sample_indices, MiniBatch, PreferenceData};
use crate::errors::{PrefError, Result};
use crate::item_factors::ItemFactors;
use crate::likelihood::{log_likelihood, observation_noise, pref_probability};
use crate::parameters::{CollabPrefParams, CollabPrefValidParams, Inference};
use crate::person_factors::PersonFactors;
use crate::state::OrchestrationState;

use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Axis, Data, Ix2, Zip};
use ndarray_rand::rand::SeedableRng;
use prefbox_gp::correlation_models::Kernel;
use prefbox_gp::{select_inducings, svi_rate, unique_rows, InducingSpace};
use rand_xoshiro::Xoshiro256Plus;
use std::fmt;

/// Collaborative preference model learnt from pairwise comparisons.
///
/// The latent preference of person `p` for item `i` is `f_ip = t_i + w_i . y_p` where
/// * `t` is a consensus function shared by everybody,
/// * `w` (items, nfactors) are item loadings, each factor being a sparse GP over item features,
/// * `y` (nfactors, people) are person loadings, either independent Gaussians or sparse GPs
///   over person features when those are given.
///
/// The probability that `a` is preferred to `b` is `Phi((f_a - f_b) / sqrt(2))`.
///
/// Every latent GP is summarized at inducing points and its variational posterior is
/// learnt by stochastic variational inference: each outer iteration draws a mini-batch
/// of comparisons, updates `t` then `w` (which updates `y` in turn), each update
/// re-linearizing the likelihood until its jacobian is stable, and computes the
/// variational lower bound to monitor convergence.
///
/// # Example
///
/// ```no_run
/// use prefbox_collab::{CollabPrefModel, Comparison, Observations, PreferenceData};
/// use linfa::ParamGuard;
/// use ndarray::array;
///
/// let obs = Observations::from_comparisons(&[
///     Comparison::new(0, 0, 1, 1.),
///     Comparison::new(0, 1, 2, 0.),
///     Comparison::new(1, 0, 2, 0.5),
/// ]).unwrap();
/// let data = PreferenceData::new(obs, array![[0.], [1.], [2.]], None).unwrap();
/// let model = CollabPrefModel::params(2)
///     .seed(Some(42))
///     .check()
///     .unwrap()
///     .fit(&data)
///     .expect("fitted model");
/// let p = model.predict(0, 0, 1).unwrap();
/// ```
pub struct CollabPrefModel {
    pub(crate) params: CollabPrefValidParams,
    pub(crate) data: PreferenceData,
    /// Unique item location of every item feature row
    pub(crate) item_index: Vec<usize>,
    pub(crate) items: InducingSpace<f64, Kernel>,
    pub(crate) person_space: Option<InducingSpace<f64, Kernel>>,
    /// Observation noise variance of every comparison
    pub(crate) noise: Array1<f64>,
    pub(crate) consensus: Option<Consensus>,
    pub(crate) item_factors: ItemFactors,
    pub(crate) person_factors: PersonFactors,
    pub(crate) trained: Vec<bool>,
    pub(crate) state: OrchestrationState,
    pub(crate) rng: Xoshiro256Plus,
}

impl fmt::Display for CollabPrefModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CollabPref(kernel={}, nfactors={}, items={}, people={}, item_inducings={}, lower_bound={:?}, status={})",
            self.params.kernel(),
            self.nfactors(),
            self.items.n_train(),
            self.n_people(),
            self.items.n_inducings(),
            self.state.lower_bound,
            self.state.status
        )
    }
}

impl CollabPrefValidParams {
    /// Fit a collaborative preference model on `data`
    pub fn fit(&self, data: &PreferenceData) -> Result<CollabPrefModel> {
        let mut model = CollabPrefModel::init(self, data.clone())?;
        info!(
            "Fit collaborative preference model on {} comparisons, {} items ({} inducings), {} people, {} factors",
            data.observations().len(),
            model.items.n_train(),
            model.items.n_inducings(),
            model.n_people(),
            model.nfactors()
        );
        model.state = model.run(OrchestrationState::new())?;
        Ok(model)
    }
}

/// Prior variance of the noiseless likelihood argument `g = (f_a - f_b) / sqrt(2)` of every
/// comparison, used to set the observation noise
fn prior_argument_variances(params: &CollabPrefValidParams, prior_diff: &Array1<f64>) -> Array1<f64> {
    let consensus_var = if params.use_common_mean() {
        1. / params.consensus_scale_prior().mean()
    } else {
        0.
    };
    let factor_var = params.nfactors() as f64
        / (params.factor_scale_prior().mean() * params.person_scale_prior().mean());
    prior_diff.mapv(|v| 0.5 * v * (consensus_var + factor_var))
}

/// Comparisons of a prediction request. Untrained people are mapped to person 0 and
/// flagged to get no personal term, items without a training row are `None`.
struct Query {
    persons: Vec<usize>,
    personal: Vec<bool>,
    items_a: Vec<Option<usize>>,
    items_b: Vec<Option<usize>>,
}

/// Posterior marginals at unique item locations: consensus mean and variance,
/// item loading variances (items, nfactors)
struct LatentMarginals {
    t: Array1<f64>,
    t_var: Array1<f64>,
    w_var: Array2<f64>,
}

impl CollabPrefModel {
    /// Model parameters builder with `nfactors` latent factors
    pub fn params(nfactors: usize) -> CollabPrefParams {
        CollabPrefParams::new(nfactors)
    }

    fn init(params: &CollabPrefValidParams, data: PreferenceData) -> Result<Self> {
        let mut params = params.clone();
        let npeople = data.n_people();
        if params.nfactors > npeople {
            warn!(
                "Number of factors ({}) greater than the number of people, clamped to {}",
                params.nfactors, npeople
            );
            params.nfactors = npeople;
        }
        let mut rng = match params.seed() {
            Some(seed) => Xoshiro256Plus::seed_from_u64(*seed),
            None => Xoshiro256Plus::from_entropy(),
        };

        let (unique_items, item_index) = unique_rows(data.item_features());
        let z = select_inducings(params.item_inducings(), &unique_items.view(), &mut rng)?;
        let items = InducingSpace::new(
            params.kernel(),
            params.item_length_scales(),
            z,
            unique_items,
            params.jitter(),
        )?;
        let person_space = match data.person_features() {
            Some(pf) if !params.uncorrelated_noise() => {
                let (unique_persons, _) = unique_rows(pf);
                let z = select_inducings(params.person_inducings(), &unique_persons.view(), &mut rng)?;
                Some(InducingSpace::new(
                    params.kernel(),
                    params.person_length_scales(),
                    z,
                    pf.to_owned(),
                    params.jitter(),
                )?)
            }
            _ => None,
        };

        let obs = data.observations();
        let items_a: Vec<usize> = obs.items_a().iter().map(|&i| item_index[i]).collect();
        let items_b: Vec<usize> = obs.items_b().iter().map(|&i| item_index[i]).collect();
        let prior_diff = items.prior_difference_variances(&items_a, &items_b);
        let noise = observation_noise(
            obs.labels(),
            &prior_argument_variances(&params, &prior_diff),
        );

        let mut trained = vec![false; npeople];
        obs.persons().iter().for_each(|&p| trained[p] = true);

        let consensus = params.use_common_mean().then(|| {
            Consensus::new(
                &items,
                params.consensus_scale_prior(),
                params.consensus_prior_mean(),
            )
        });
        let item_factors = ItemFactors::new(&items, params.nfactors(), params.factor_scale_prior());
        let person_factors = match person_space.as_ref() {
            Some(space) => PersonFactors::sparse(
                space,
                params.nfactors(),
                params.person_scale_prior(),
                params.learn_person_scale(),
                &mut rng,
            ),
            None => PersonFactors::independent(
                params.nfactors(),
                npeople,
                params.person_scale_prior(),
                params.learn_person_scale(),
                &mut rng,
            ),
        };

        Ok(CollabPrefModel {
            params,
            data,
            item_index,
            items,
            person_space,
            noise,
            consensus,
            item_factors,
            person_factors,
            trained,
            state: OrchestrationState::new(),
            rng,
        })
    }

    /// Outer inference loop: from the given state, iterate until convergence or
    /// iteration budget exhaustion and return the final state
    pub(crate) fn run(&mut self, mut state: OrchestrationState) -> Result<OrchestrationState> {
        let nobs = self.data.observations().len();
        let n_converged = self.params.n_converged();
        let (conv_g, max_iter_g) = (self.params.conv_threshold_g(), self.params.max_iter_g());

        while state.should_continue(self.params.min_iter(), self.params.max_iter(), n_converged) {
            let (indices, rho) = match self.params.inference() {
                Inference::Stochastic => (
                    sample_indices(nobs, self.params.max_update_size(), &mut self.rng),
                    svi_rate(
                        state.iteration,
                        self.params.delay(),
                        self.params.forgetting_rate(),
                    ),
                ),
                Inference::FullBatch => ((0..nobs).collect(), 1.),
            };
            let batch = MiniBatch::new(
                &indices,
                self.data.observations(),
                &self.item_index,
                &self.noise,
                &self.items,
                rho,
            );

            if let Some(consensus) = self.consensus.as_mut() {
                consensus.update(
                    &batch,
                    &self.items,
                    self.item_factors.values(),
                    self.person_factors.values(),
                    conv_g,
                    max_iter_g,
                )?;
            }
            let t = self.consensus_values();
            self.item_factors.update(
                &batch,
                &self.items,
                &t,
                &mut self.person_factors,
                self.person_space.as_ref(),
                conv_g,
                max_iter_g,
            )?;

            let lb = self.batch_lower_bound(&batch)?;
            let change = state.record(lb, self.params.conv_threshold());
            debug!(
                "Iteration {}: lower bound = {lb}, change = {change:e}, rho = {rho}, batch = {}",
                state.iteration,
                batch.len()
            );
        }
        state.finish(self.params.max_iter(), n_converged);
        Ok(state)
    }

    /// Rerun inference on the stored comparisons with the current hyperparameters,
    /// starting from the current posteriors. Observation noise is not re-estimated.
    pub fn refit(&mut self) -> Result<()> {
        let mut state = std::mem::take(&mut self.state);
        state.restart();
        self.state = self.run(state)?;
        Ok(())
    }

    /// Consensus values at unique item locations, zero when the consensus is disabled
    fn consensus_values(&self) -> Array1<f64> {
        match self.consensus.as_ref() {
            Some(c) => c.values().to_owned(),
            None => Array1::zeros(self.items.n_train()),
        }
    }

    /// Posterior mean and variance of `f_a - f_b` for every batch comparison.
    /// The personal term `w.y` is only added where `personal` is set.
    fn difference_moments(&self, batch: &MiniBatch, personal: &[bool]) -> (Array1<f64>, Array1<f64>) {
        let t = self.consensus_values();
        let mut mean =
            Array1::from_shape_fn(batch.len(), |i| t[batch.items_a[i]] - t[batch.items_b[i]]);
        let mut var = match self.consensus.as_ref() {
            Some(c) => c.difference_variances(batch, &self.items),
            None => Array1::zeros(batch.len()),
        };

        let dw = batch.factor_differences(self.item_factors.values());
        let w_var = self.item_factors.difference_variances(batch, &self.items);
        let y = self.person_factors.values().select(Axis(1), &batch.persons);
        let y_var = self.person_factors.variances().select(Axis(1), &batch.persons);
        let personal_mean = (&dw * &y).sum_axis(Axis(0));
        let personal_var = ((&y * &y + &y_var) * &w_var + &y_var * &dw * &dw).sum_axis(Axis(0));
        Zip::from(&mut mean)
            .and(&mut var)
            .and(&personal_mean)
            .and(&personal_var)
            .and(ArrayView1::from(personal))
            .for_each(|m, v, &pm, &pv, &on| {
                if on {
                    *m += pm;
                    *v += pv;
                }
            });
        (mean, var)
    }

    /// Sum of the prior and entropy terms of every latent block and output scale
    fn prior_terms(&self) -> Result<f64> {
        let mut lb = self.item_factors.lower_bound(&self.items)?
            + self.person_factors.lower_bound(self.person_space.as_ref())?;
        if let Some(consensus) = self.consensus.as_ref() {
            lb += consensus.lower_bound(&self.items)?;
        }
        Ok(lb)
    }

    /// Lower bound with the expected log likelihood estimated on a batch and rescaled
    /// to the whole data set
    fn batch_lower_bound(&self, batch: &MiniBatch) -> Result<f64> {
        let (mean, var) = self.difference_moments(batch, &vec![true; batch.len()]);
        let probs = Zip::from(&mean)
            .and(&var)
            .map_collect(|&m, &v| pref_probability(m, v));
        let data_term = log_likelihood(&batch.labels, &probs) * batch.weight;
        Ok(data_term + self.prior_terms()?)
    }

    /// Variational lower bound of the log marginal likelihood on all training comparisons
    pub fn lowerbound(&self) -> Result<f64> {
        let nobs = self.data.observations().len();
        let indices: Vec<usize> = (0..nobs).collect();
        let batch = MiniBatch::new(
            &indices,
            self.data.observations(),
            &self.item_index,
            &self.noise,
            &self.items,
            1.,
        );
        self.batch_lower_bound(&batch)
    }

    /// Unique item location of an item feature row, `None` for an item without
    /// a training row
    fn unique_item(&self, item: usize) -> Option<usize> {
        self.item_index.get(item).copied()
    }

    /// Prior mean of the latent value of an item never seen during fit
    fn unseen_item_mean(&self) -> f64 {
        self.consensus.as_ref().map_or(0., |c| c.prior_mean())
    }

    /// Whether `person` has training comparisons
    pub fn is_trained(&self, person: usize) -> bool {
        self.trained.get(person).copied().unwrap_or(false)
    }

    fn query(&self, persons: &[usize], items_a: &[usize], items_b: &[usize]) -> Result<Query> {
        if items_a.len() != persons.len() || items_b.len() != persons.len() {
            return Err(PrefError::InvalidData(format!(
                "query columns should have the same length, got {} persons, {} items a, {} items b",
                persons.len(),
                items_a.len(),
                items_b.len()
            )));
        }
        let personal: Vec<bool> = persons.iter().map(|&p| self.is_trained(p)).collect();
        Ok(Query {
            persons: persons
                .iter()
                .zip(personal.iter())
                .map(|(&p, &on)| if on { p } else { 0 })
                .collect(),
            personal,
            items_a: items_a.iter().map(|&i| self.unique_item(i)).collect(),
            items_b: items_b.iter().map(|&i| self.unique_item(i)).collect(),
        })
    }

    /// Marginal posterior mean and variance of `f` for one query endpoint.
    /// Unseen items get the prior: consensus prior mean, zero loadings and prior variances.
    fn latent_moments(
        &self,
        person: usize,
        personal: bool,
        item: Option<usize>,
        marginals: &LatentMarginals,
    ) -> (f64, f64) {
        let prior_var = self.items.prior_var();
        let (mut mean, mut var) = match (item, self.consensus.as_ref()) {
            (Some(u), Some(_)) => (marginals.t[u], marginals.t_var[u]),
            (None, Some(c)) => (c.prior_mean(), prior_var / c.scale().mean()),
            (_, None) => (0., 0.),
        };
        if personal {
            let y = self.person_factors.values().column(person);
            let y_var = self.person_factors.variances().column(person);
            for f in 0..self.nfactors() {
                let y2 = y[f] * y[f] + y_var[f];
                match item {
                    Some(u) => {
                        let w = self.item_factors.values()[[u, f]];
                        mean += w * y[f];
                        var += y2 * marginals.w_var[[u, f]] + y_var[f] * w * w;
                    }
                    None => var += y2 * prior_var / self.item_factors.scales()[f].mean(),
                }
            }
        }
        (mean, var)
    }

    /// Posterior mean and variance of `f_a - f_b` for every query comparison.
    /// Pairs of training items keep their posterior covariance, a pair involving an
    /// unseen item combines independent marginals.
    fn query_moments(&self, query: &Query) -> (Array1<f64>, Array1<f64>) {
        let n = query.persons.len();
        let mut mean = Array1::zeros(n);
        let mut var = Array1::zeros(n);
        let seen: Vec<(usize, usize, usize)> = (0..n)
            .filter_map(|i| Some((i, query.items_a[i]?, query.items_b[i]?)))
            .collect();
        if !seen.is_empty() {
            let batch = MiniBatch::from_pairs(
                seen.iter().map(|&(i, _, _)| query.persons[i]).collect(),
                seen.iter().map(|&(_, a, _)| a).collect(),
                seen.iter().map(|&(_, _, b)| b).collect(),
                &self.items,
            );
            let personal: Vec<bool> = seen.iter().map(|&(i, _, _)| query.personal[i]).collect();
            let (m, v) = self.difference_moments(&batch, &personal);
            for (k, &(i, _, _)) in seen.iter().enumerate() {
                mean[i] = m[k];
                var[i] = v[k];
            }
        }
        if seen.len() < n {
            let marginals = self.latent_marginals();
            for i in 0..n {
                if query.items_a[i].is_some() && query.items_b[i].is_some() {
                    continue;
                }
                let (p, on) = (query.persons[i], query.personal[i]);
                let (ma, va) = self.latent_moments(p, on, query.items_a[i], &marginals);
                let (mb, vb) = self.latent_moments(p, on, query.items_b[i], &marginals);
                mean[i] = ma - mb;
                var[i] = va + vb;
            }
        }
        (mean, var)
    }

    /// Posterior marginals of `t` and `w` at every unique item location
    fn latent_marginals(&self) -> LatentMarginals {
        let (t, t_var) = match self.consensus.as_ref() {
            Some(c) => (
                c.values().to_owned(),
                self.items
                    .train_variances(c.posterior().cov(), c.scale().mean()),
            ),
            None => (
                Array1::zeros(self.items.n_train()),
                Array1::zeros(self.items.n_train()),
            ),
        };
        let mut w_var = Array2::zeros((self.items.n_train(), self.nfactors()));
        for (f, mut col) in w_var.columns_mut().into_iter().enumerate() {
            col.assign(&self.items.train_variances(
                self.item_factors.posteriors()[f].cov(),
                self.item_factors.scales()[f].mean(),
            ));
        }
        LatentMarginals { t, t_var, w_var }
    }

    /// Probabilities that each person prefers `items_a` over `items_b`.
    /// Items without a training row are given their prior.
    pub fn predict_batch(
        &self,
        persons: &[usize],
        items_a: &[usize],
        items_b: &[usize],
    ) -> Result<Array1<f64>> {
        let (mean, var) = self.query_moments(&self.query(persons, items_a, items_b)?);
        Ok(Zip::from(&mean)
            .and(&var)
            .map_collect(|&m, &v| pref_probability(m, v)))
    }

    /// Probability that `person` prefers `item_a` over `item_b`.
    /// People without training comparisons get the consensus prediction.
    pub fn predict(&self, person: usize, item_a: usize, item_b: usize) -> Result<f64> {
        Ok(self.predict_batch(&[person], &[item_a], &[item_b])?[0])
    }

    /// Probabilities that `items_a` are preferred over `items_b` under the consensus alone
    pub fn predict_common_batch(&self, items_a: &[usize], items_b: &[usize]) -> Result<Array1<f64>> {
        let mut query = self.query(&vec![0; items_a.len()], items_a, items_b)?;
        query.personal.iter_mut().for_each(|on| *on = false);
        let (mean, var) = self.query_moments(&query);
        Ok(Zip::from(&mean)
            .and(&var)
            .map_collect(|&m, &v| pref_probability(m, v)))
    }

    /// Probability that `item_a` is preferred over `item_b` under the consensus alone,
    /// 0.5 when the consensus is disabled
    pub fn predict_common(&self, item_a: usize, item_b: usize) -> Result<f64> {
        Ok(self.predict_common_batch(&[item_a], &[item_b])?[0])
    }

    /// Consensus values of `items`, the consensus prior mean for unseen items
    pub fn predict_t_batch(&self, items: &[usize]) -> Array1<f64> {
        let t = self.consensus_values();
        items
            .iter()
            .map(|&i| match self.unique_item(i) {
                Some(u) => t[u],
                None => self.unseen_item_mean(),
            })
            .collect()
    }

    /// Consensus value of `item`
    pub fn predict_t(&self, item: usize) -> f64 {
        self.predict_t_batch(&[item])[0]
    }

    /// Latent values `t_i + w_i . y_p` of `(person, item)` pairs
    pub fn predict_f_batch(&self, persons: &[usize], items: &[usize]) -> Result<Array1<f64>> {
        if persons.len() != items.len() {
            return Err(PrefError::InvalidData(format!(
                "query columns should have the same length, got {} persons and {} items",
                persons.len(),
                items.len()
            )));
        }
        let t = self.consensus_values();
        let w = self.item_factors.values();
        let y = self.person_factors.values();
        Ok(persons
            .iter()
            .zip(items.iter())
            .map(|(&p, &i)| match self.unique_item(i) {
                Some(u) if self.is_trained(p) => t[u] + w.row(u).dot(&y.column(p)),
                Some(u) => t[u],
                None => self.unseen_item_mean(),
            })
            .collect())
    }

    /// Latent value of `item` for `person`
    pub fn predict_f(&self, person: usize, item: usize) -> Result<f64> {
        Ok(self.predict_f_batch(&[person], &[item])?[0])
    }

    /// Latent values (item feature rows, people) `t + w.y`, untrained people getting `t`
    pub fn latent_matrix(&self) -> Array2<f64> {
        let t = self.consensus_values();
        let mut f = self.item_factors.values().dot(self.person_factors.values());
        for (p, mut col) in f.columns_mut().into_iter().enumerate() {
            if self.is_trained(p) {
                col += &t;
            } else {
                col.assign(&t);
            }
        }
        f.select(Axis(0), &self.item_index)
    }

    /// Consensus posterior mean and variance at new item locations `x`
    pub fn predict_t_at(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Result<(Array1<f64>, Array1<f64>)> {
        match self.consensus.as_ref() {
            Some(c) => {
                let mean = self.items.predict_mean(x, c.posterior().mean())? + c.prior_mean();
                let var = self
                    .items
                    .predict_variances(x, c.posterior().cov(), c.scale().mean())?;
                Ok((mean, var))
            }
            None => {
                // still checks the dimension of the query locations
                self.items.cross_projection(x)?;
                Ok((Array1::zeros(x.nrows()), Array1::zeros(x.nrows())))
            }
        }
    }

    /// Latent values of `person` at new item locations `x`
    pub fn predict_f_at(
        &self,
        person: usize,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Result<Array1<f64>> {
        let (mut f, _) = self.predict_t_at(x)?;
        if self.is_trained(person) {
            let a = self.items.cross_projection(x)?;
            let y = self.person_factors.values();
            for (k, posterior) in self.item_factors.posteriors().iter().enumerate() {
                f.scaled_add(y[[k, person]], &a.dot(posterior.mean()));
            }
        }
        Ok(f)
    }

    /// Validated parameters, with the number of factors clamped to the number of people
    pub fn params_used(&self) -> &CollabPrefValidParams {
        &self.params
    }

    /// Training data
    pub fn data(&self) -> &PreferenceData {
        &self.data
    }

    /// Number of latent factors
    pub fn nfactors(&self) -> usize {
        self.params.nfactors()
    }

    /// Number of people
    pub fn n_people(&self) -> usize {
        self.person_factors.npeople()
    }

    /// Number of item feature rows
    pub fn n_items(&self) -> usize {
        self.item_index.len()
    }

    /// Item inducing points
    pub fn item_inducings(&self) -> &Array2<f64> {
        self.items.inducings()
    }

    /// Person inducing points when loadings are sparse GPs over person features
    pub fn person_inducings(&self) -> Option<&Array2<f64>> {
        self.person_space.as_ref().map(|s| s.inducings())
    }

    /// Observation noise variance of every training comparison
    pub fn noise(&self) -> &Array1<f64> {
        &self.noise
    }

    /// Item loadings (item feature rows, nfactors)
    pub fn item_factors(&self) -> Array2<f64> {
        self.item_factors.values().select(Axis(0), &self.item_index)
    }

    /// Person loadings (nfactors, people)
    pub fn person_factors(&self) -> &Array2<f64> {
        self.person_factors.values()
    }

    /// Posterior variances of the person loadings (nfactors, people)
    pub fn person_factor_variances(&self) -> &Array2<f64> {
        self.person_factors.variances()
    }

    /// Posterior mean of the consensus output scale, if any
    pub fn consensus_scale(&self) -> Option<f64> {
        self.consensus.as_ref().map(|c| c.scale().mean())
    }

    /// Posterior means of the item factor output scales
    pub fn factor_scales(&self) -> Array1<f64> {
        self.item_factors.scales().iter().map(|s| s.mean()).collect()
    }

    /// Last inference state
    pub fn state(&self) -> &OrchestrationState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Comparison, Observations};
    use crate::state::FitStatus;
    use approx::assert_abs_diff_eq;
    use linfa::ParamGuard;
    use ndarray::{array, Array};
    use ndarray_rand::rand::Rng;

    fn three_items() -> PreferenceData {
        let obs = Observations::from_comparisons(&[
            Comparison::new(0, 0, 1, 1.),
            Comparison::new(0, 1, 2, 0.),
            Comparison::new(1, 0, 2, 0.5),
        ])
        .unwrap();
        PreferenceData::new(obs, array![[0.], [1.], [2.]], None).unwrap()
    }

    /// Two groups of people with opposite tastes over 1D items
    fn synthetic(nobs: usize, seed: u64) -> PreferenceData {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let nitems = 12;
        let npeople = 6;
        let x = Array::linspace(0., 3., nitems).insert_axis(Axis(1));
        let f = |p: usize, i: usize| {
            let xi: f64 = x[[i, 0]];
            let sign = if p % 2 == 0 { 1. } else { -1. };
            0.5 * xi + sign * (2. * xi).sin()
        };
        let mut comparisons = Vec::with_capacity(nobs);
        for _ in 0..nobs {
            let p = rng.gen_range(0..npeople);
            let a = rng.gen_range(0..nitems);
            let mut b = rng.gen_range(0..nitems);
            if a == b {
                b = (a + 1) % nitems;
            }
            let label = if f(p, a) > f(p, b) { 1. } else { 0. };
            comparisons.push(Comparison::new(p, a, b, label));
        }
        let obs = Observations::from_comparisons(&comparisons).unwrap();
        PreferenceData::new(obs, x, None).unwrap()
    }

    #[test]
    fn test_three_items_scenario() {
        let data = three_items();
        let model = CollabPrefModel::params(2)
            .inference(Inference::FullBatch)
            .seed(Some(42))
            .check()
            .unwrap()
            .fit(&data)
            .unwrap();
        assert_abs_diff_eq!(model.predict(1, 0, 2).unwrap(), 0.5, epsilon = 0.15);
        assert!(model.predict(0, 0, 1).unwrap() > 0.5);
        assert!(model.predict(0, 2, 1).unwrap() > 0.5);
        assert!(model.lowerbound().unwrap().is_finite());
    }

    #[test]
    fn test_predict_symmetry() {
        let data = synthetic(60, 0);
        let model = CollabPrefModel::params(3)
            .max_iter(10)
            .seed(Some(1))
            .check()
            .unwrap()
            .fit(&data)
            .unwrap();
        for (p, a, b) in [(0, 1, 5), (3, 0, 11), (5, 7, 7), (10, 2, 3)] {
            assert_abs_diff_eq!(
                model.predict(p, a, b).unwrap(),
                1. - model.predict(p, b, a).unwrap(),
                epsilon = 1e-12
            );
        }
        assert_abs_diff_eq!(model.predict(0, 4, 4).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_seeded_fits_are_identical() {
        let data = synthetic(80, 3);
        let params = CollabPrefModel::params(2)
            .max_update_size(20)
            .max_iter(15)
            .seed(Some(7))
            .check()
            .unwrap();
        let m1 = params.fit(&data).unwrap();
        let m2 = params.fit(&data).unwrap();
        assert_eq!(m1.latent_matrix(), m2.latent_matrix());
        assert_eq!(m1.state().trace, m2.state().trace);
    }

    #[test]
    fn test_untrained_person_gets_consensus() {
        let data = synthetic(60, 5);
        let model = CollabPrefModel::params(2)
            .max_iter(10)
            .seed(Some(2))
            .check()
            .unwrap()
            .fit(&data)
            .unwrap();
        let unseen = model.n_people() + 3;
        assert!(!model.is_trained(unseen));
        for (a, b) in [(0, 3), (4, 9), (11, 1)] {
            assert_abs_diff_eq!(
                model.predict(unseen, a, b).unwrap(),
                model.predict_common(a, b).unwrap(),
                epsilon = 1e-12
            );
            assert_abs_diff_eq!(
                model.predict_f(unseen, a).unwrap(),
                model.predict_t(a),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_latent_matrix_matches_predict_f() {
        let data = synthetic(60, 11);
        let model = CollabPrefModel::params(2)
            .max_iter(8)
            .seed(Some(3))
            .check()
            .unwrap()
            .fit(&data)
            .unwrap();
        let f = model.latent_matrix();
        assert_eq!(f.dim(), (12, model.n_people()));
        for (i, p) in [(0, 0), (5, 3), (11, 5)] {
            assert_abs_diff_eq!(f[[i, p]], model.predict_f(p, i).unwrap(), epsilon = 1e-12);
        }
        // latent values at the training locations themselves
        let x = data.item_features().slice(ndarray::s![3..5, ..]).to_owned();
        let f_at = model.predict_f_at(1, &x).unwrap();
        assert_abs_diff_eq!(f_at[0], f[[3, 1]], epsilon = 1e-6);
        assert_abs_diff_eq!(f_at[1], f[[4, 1]], epsilon = 1e-6);
    }

    #[test]
    fn test_full_batch_lower_bound_never_decreases() {
        let env = env_logger::Env::new().filter_or(crate::PREFBOX_LOG, "info");
        env_logger::Builder::from_env(env).is_test(true).try_init().ok();
        let data = synthetic(50, 13);
        let model = CollabPrefModel::params(2)
            .inference(Inference::FullBatch)
            .max_iter(30)
            .min_iter(20)
            .seed(Some(1))
            .check()
            .unwrap()
            .fit(&data)
            .unwrap();
        let trace = &model.state().trace;
        assert!(trace.len() >= 20);
        assert!(trace.windows(2).all(|w| w[1] >= w[0] - 1e-6));
        assert!(trace.last().unwrap() > trace.first().unwrap());
        // the full-batch bound is the public lower bound
        assert_abs_diff_eq!(
            *trace.last().unwrap(),
            model.lowerbound().unwrap(),
            epsilon = 1e-8
        );
        assert_ne!(model.state().status, FitStatus::Running);
    }

    #[test]
    fn test_more_inducings_approach_exact_posterior() {
        let data = synthetic(200, 23);
        let items: Vec<usize> = (0..12).collect();
        let consensus = |n: usize| {
            CollabPrefModel::params(2)
                .inference(Inference::FullBatch)
                .n_item_inducings(n)
                .conv_threshold(1e-3)
                .max_iter(30)
                .seed(Some(9))
                .check()
                .unwrap()
                .fit(&data)
                .unwrap()
                .predict_t_batch(&items)
        };
        let exact = consensus(12);
        let distance = |n: usize| (&consensus(n) - &exact).mapv(f64::abs).sum();
        let (d3, d6) = (distance(3), distance(6));
        assert!(d6 < d3, "distance with 6 inducings {d6} vs 3 inducings {d3}");
        assert_abs_diff_eq!(distance(12), 0., epsilon = 1e-12);
    }

    #[test]
    fn test_groups_are_recovered() {
        let data = synthetic(300, 17);
        let model = CollabPrefModel::params(2)
            .inference(Inference::FullBatch)
            .max_iter(30)
            .seed(Some(5))
            .check()
            .unwrap()
            .fit(&data)
            .unwrap();
        // items 2 and 9: x = 0.55, 2.45; person 0 has f = 0.5x + sin(2x)
        assert!(model.predict(0, 2, 9).unwrap() > 0.5);
        assert!(model.predict(1, 9, 2).unwrap() > 0.5);
    }

    #[test]
    fn test_factors_clamped_to_people() {
        let model = CollabPrefModel::params(5)
            .max_iter(3)
            .seed(Some(0))
            .check()
            .unwrap()
            .fit(&three_items())
            .unwrap();
        assert_eq!(model.nfactors(), 2);
        assert_eq!(model.person_factors().dim(), (2, 2));
    }

    #[test]
    fn test_without_common_mean() {
        let model = CollabPrefModel::params(2)
            .use_common_mean(false)
            .max_iter(5)
            .seed(Some(0))
            .check()
            .unwrap()
            .fit(&three_items())
            .unwrap();
        assert_abs_diff_eq!(model.predict_common(0, 1).unwrap(), 0.5);
        assert_abs_diff_eq!(model.predict_t(2), 0.);
        assert!(model.consensus_scale().is_none());
        let (t, v) = model.predict_t_at(&array![[0.5]]).unwrap();
        assert_eq!((t[0], v[0]), (0., 0.));
    }

    #[test]
    fn test_duplicated_items_share_values() {
        let obs = Observations::from_comparisons(&[
            Comparison::new(0, 0, 1, 1.),
            Comparison::new(1, 2, 1, 1.),
            Comparison::new(1, 3, 0, 0.),
        ])
        .unwrap();
        // rows 0 and 3 are the same item
        let data = PreferenceData::new(obs, array![[0.], [1.], [2.], [0.]], None).unwrap();
        let model = CollabPrefModel::params(1)
            .max_iter(5)
            .seed(Some(0))
            .check()
            .unwrap()
            .fit(&data)
            .unwrap();
        assert_eq!(model.n_items(), 4);
        assert_eq!(model.item_inducings().nrows(), 3);
        assert_abs_diff_eq!(model.predict_t(0), model.predict_t(3));
        assert_abs_diff_eq!(model.predict(1, 0, 3).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_sparse_person_factors() {
        let data = synthetic(80, 19);
        let person_features = array![[0.], [1.], [0.1], [1.1], [0.2], [0.9]];
        let data = PreferenceData::new(
            data.observations().clone(),
            data.item_features().clone(),
            Some(person_features),
        )
        .unwrap();
        let model = CollabPrefModel::params(2)
            .n_person_inducings(3)
            .n_item_inducings(6)
            .max_iter(10)
            .seed(Some(6))
            .check()
            .unwrap()
            .fit(&data)
            .unwrap();
        assert_eq!(model.person_inducings().unwrap().nrows(), 3);
        assert_eq!(model.item_inducings().nrows(), 6);
        assert!(model.lowerbound().unwrap().is_finite());

        let model = CollabPrefModel::params(2)
            .uncorrelated_noise(true)
            .max_iter(3)
            .seed(Some(6))
            .check()
            .unwrap()
            .fit(&data)
            .unwrap();
        assert!(model.person_inducings().is_none());
    }

    #[test]
    fn test_unseen_items_get_the_prior() {
        let model = CollabPrefModel::params(2)
            .consensus_prior_mean(0.3)
            .max_iter(5)
            .seed(Some(0))
            .check()
            .unwrap()
            .fit(&three_items())
            .unwrap();
        assert_abs_diff_eq!(model.predict_t(7), 0.3);
        assert_abs_diff_eq!(model.predict_f(0, 7).unwrap(), 0.3);
        assert_abs_diff_eq!(model.predict(0, 7, 9).unwrap(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(model.predict_common(7, 9).unwrap(), 0.5, epsilon = 1e-12);

        let p = model.predict(0, 0, 7).unwrap();
        assert!(p > 0. && p < 1.);
        assert_abs_diff_eq!(p, 1. - model.predict(0, 7, 0).unwrap(), epsilon = 1e-12);
        // training pairs in a mixed batch are not affected by unseen items
        let batch = model.predict_batch(&[0, 0, 1], &[0, 7, 1], &[1, 0, 2]).unwrap();
        assert_abs_diff_eq!(batch[0], model.predict(0, 0, 1).unwrap(), epsilon = 1e-12);
        assert_abs_diff_eq!(batch[1], 1. - p, epsilon = 1e-12);
        assert_abs_diff_eq!(batch[2], model.predict(1, 1, 2).unwrap(), epsilon = 1e-12);
    }

    #[test]
    fn test_bad_queries() {
        let model = CollabPrefModel::params(1)
            .max_iter(3)
            .seed(Some(0))
            .check()
            .unwrap()
            .fit(&three_items())
            .unwrap();
        assert!(model.predict_batch(&[0, 1], &[0], &[1]).is_err());
        assert!(model.predict_f_batch(&[0, 1], &[0]).is_err());
        assert!(model.predict_t_at(&array![[0., 1.]]).is_err());
    }

    #[test]
    fn test_refit_keeps_the_posterior() {
        let mut model = CollabPrefModel::params(2)
            .inference(Inference::FullBatch)
            .max_iter(20)
            .seed(Some(8))
            .check()
            .unwrap()
            .fit(&three_items())
            .unwrap();
        let before = model.lowerbound().unwrap();
        let noise = model.noise().clone();
        model.refit().unwrap();
        assert_eq!(model.noise(), &noise);
        assert!(model.lowerbound().unwrap() > before - 1e-2);
    }
}
