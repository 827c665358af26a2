use crate::errors::{PrefError, Result};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2, Zip};
use ndarray_rand::rand::seq::SliceRandom;
use prefbox_gp::correlation_models::Kernel;
use prefbox_gp::InducingSpace;
use rand_xoshiro::Xoshiro256Plus;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// A pairwise comparison: `person` preferred `item_a` over `item_b` with
/// `label` 1, the reverse with `label` 0 and was indifferent with `label` 0.5
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Comparison {
    /// Person index
    pub person: usize,
    /// First item index
    pub item_a: usize,
    /// Second item index
    pub item_b: usize,
    /// Preference for `item_a` in [0, 1]
    pub label: f64,
}

impl Comparison {
    /// Constructor
    pub fn new(person: usize, item_a: usize, item_b: usize, label: f64) -> Self {
        Comparison {
            person,
            item_a,
            item_b,
            label,
        }
    }
}

/// Immutable set of pairwise comparisons
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Observations {
    persons: Vec<usize>,
    items_a: Vec<usize>,
    items_b: Vec<usize>,
    labels: Array1<f64>,
}

impl Observations {
    /// Build observations from parallel columns
    pub fn new(
        persons: Vec<usize>,
        items_a: Vec<usize>,
        items_b: Vec<usize>,
        labels: Array1<f64>,
    ) -> Result<Self> {
        let n = persons.len();
        if items_a.len() != n || items_b.len() != n || labels.len() != n {
            return Err(PrefError::InvalidData(format!(
                "observation columns should have the same length, got {} persons, {} items a, {} items b, {} labels",
                n,
                items_a.len(),
                items_b.len(),
                labels.len()
            )));
        }
        if n == 0 {
            return Err(PrefError::MissingObservations(
                "at least one comparison is needed".to_string(),
            ));
        }
        if let Some(z) = labels.iter().find(|z| !(0. ..=1.).contains(*z)) {
            return Err(PrefError::InvalidData(format!(
                "preference labels should be in [0, 1], got {z}"
            )));
        }
        Ok(Observations {
            persons,
            items_a,
            items_b,
            labels,
        })
    }

    /// Build observations from a list of comparisons
    pub fn from_comparisons(comparisons: &[Comparison]) -> Result<Self> {
        Self::new(
            comparisons.iter().map(|c| c.person).collect(),
            comparisons.iter().map(|c| c.item_a).collect(),
            comparisons.iter().map(|c| c.item_b).collect(),
            comparisons.iter().map(|c| c.label).collect(),
        )
    }

    /// Build observations from a (n, 4) matrix of rows `(person, item_a, item_b, label)`
    pub fn from_matrix(obs: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Result<Self> {
        if obs.ncols() != 4 {
            return Err(PrefError::InvalidData(format!(
                "observation matrix should have 4 columns, got {}",
                obs.ncols()
            )));
        }
        let as_index = |v: f64| -> Result<usize> {
            if v >= 0. && v.fract() == 0. {
                Ok(v as usize)
            } else {
                Err(PrefError::InvalidData(format!("bad index value {v}")))
            }
        };
        let mut persons = Vec::with_capacity(obs.nrows());
        let mut items_a = Vec::with_capacity(obs.nrows());
        let mut items_b = Vec::with_capacity(obs.nrows());
        for row in obs.rows() {
            persons.push(as_index(row[0])?);
            items_a.push(as_index(row[1])?);
            items_b.push(as_index(row[2])?);
        }
        Self::new(persons, items_a, items_b, obs.column(3).to_owned())
    }

    /// Number of comparisons
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether there is no comparison
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Person index of every comparison
    pub fn persons(&self) -> &[usize] {
        &self.persons
    }

    /// First item of every comparison
    pub fn items_a(&self) -> &[usize] {
        &self.items_a
    }

    /// Second item of every comparison
    pub fn items_b(&self) -> &[usize] {
        &self.items_b
    }

    /// Preference labels
    pub fn labels(&self) -> &Array1<f64> {
        &self.labels
    }

    /// Number of people referenced, ie. max person index + 1
    pub fn n_people(&self) -> usize {
        self.persons.iter().max().map_or(0, |p| p + 1)
    }

    /// Max item index + 1
    pub fn n_items(&self) -> usize {
        self.items_a
            .iter()
            .chain(self.items_b.iter())
            .max()
            .map_or(0, |i| i + 1)
    }
}

/// Training data: comparisons, item features and optional person features
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct PreferenceData {
    observations: Observations,
    item_features: Array2<f64>,
    person_features: Option<Array2<f64>>,
}

impl PreferenceData {
    /// Check that every referenced item (and person if features are given) has features
    pub fn new(
        observations: Observations,
        item_features: Array2<f64>,
        person_features: Option<Array2<f64>>,
    ) -> Result<Self> {
        if observations.n_items() > item_features.nrows() {
            return Err(PrefError::InvalidData(format!(
                "item index {} out of the {} item feature rows",
                observations.n_items() - 1,
                item_features.nrows()
            )));
        }
        if item_features.ncols() == 0 {
            return Err(PrefError::InvalidData(
                "items need at least one feature".to_string(),
            ));
        }
        if let Some(pf) = person_features.as_ref() {
            if observations.n_people() > pf.nrows() {
                return Err(PrefError::InvalidData(format!(
                    "person index {} out of the {} person feature rows",
                    observations.n_people() - 1,
                    pf.nrows()
                )));
            }
            if pf.ncols() == 0 {
                return Err(PrefError::InvalidData(
                    "person features should have at least one column".to_string(),
                ));
            }
        }
        Ok(PreferenceData {
            observations,
            item_features,
            person_features,
        })
    }

    /// Comparisons
    pub fn observations(&self) -> &Observations {
        &self.observations
    }

    /// Item features (n_items, item_dim)
    pub fn item_features(&self) -> &Array2<f64> {
        &self.item_features
    }

    /// Person features (n_people, person_dim) if any
    pub fn person_features(&self) -> Option<&Array2<f64>> {
        self.person_features.as_ref()
    }

    /// Number of people: rows of person features or max person index + 1
    pub fn n_people(&self) -> usize {
        match self.person_features.as_ref() {
            Some(pf) => pf.nrows(),
            None => self.observations.n_people(),
        }
    }
}

/// Draw `size` distinct observation indices out of `nobs`, sorted
pub(crate) fn sample_indices(nobs: usize, size: usize, rng: &mut Xoshiro256Plus) -> Vec<usize> {
    if size >= nobs {
        return (0..nobs).collect();
    }
    let mut indices = (0..nobs).collect::<Vec<_>>();
    indices.shuffle(rng);
    let mut picked = indices[..size].to_vec();
    picked.sort_unstable();
    picked
}

/// A mini-batch of comparisons expressed on unique item locations together with
/// the quantities shared by all estimators during one outer iteration
#[derive(Clone, Debug)]
pub(crate) struct MiniBatch {
    pub persons: Vec<usize>,
    pub items_a: Vec<usize>,
    pub items_b: Vec<usize>,
    pub labels: Array1<f64>,
    /// Observation noise variance Q of every comparison
    pub noise: Array1<f64>,
    /// Rows `A_a - A_b` of the item projection `K_nm K_mm^-1`
    pub d_proj: Array2<f64>,
    /// Prior variances `k_aa + k_bb - 2 k_ab` before output scaling
    pub prior_diff: Array1<f64>,
    /// Step size of the natural-gradient updates
    pub rho: f64,
    /// `N / batch size`
    pub weight: f64,
}

impl MiniBatch {
    pub fn new(
        indices: &[usize],
        observations: &Observations,
        item_index: &[usize],
        noise: &Array1<f64>,
        items: &InducingSpace<f64, Kernel>,
        rho: f64,
    ) -> Self {
        let persons: Vec<usize> = indices.iter().map(|&i| observations.persons()[i]).collect();
        let items_a: Vec<usize> = indices
            .iter()
            .map(|&i| item_index[observations.items_a()[i]])
            .collect();
        let items_b: Vec<usize> = indices
            .iter()
            .map(|&i| item_index[observations.items_b()[i]])
            .collect();
        let labels = indices.iter().map(|&i| observations.labels()[i]).collect();
        let noise = indices.iter().map(|&i| noise[i]).collect();
        let d_proj = items.difference_projection(&items_a, &items_b);
        let prior_diff = items.prior_difference_variances(&items_a, &items_b);
        MiniBatch {
            weight: observations.len() as f64 / indices.len() as f64,
            persons,
            items_a,
            items_b,
            labels,
            noise,
            d_proj,
            prior_diff,
            rho,
        }
    }

    /// Unlabelled comparisons between unique items, used to query the posterior
    pub fn from_pairs(
        persons: Vec<usize>,
        items_a: Vec<usize>,
        items_b: Vec<usize>,
        items: &InducingSpace<f64, Kernel>,
    ) -> Self {
        let n = persons.len();
        MiniBatch {
            d_proj: items.difference_projection(&items_a, &items_b),
            prior_diff: items.prior_difference_variances(&items_a, &items_b),
            persons,
            items_a,
            items_b,
            labels: Array1::from_elem(n, 0.5),
            noise: Array1::ones(n),
            rho: 1.,
            weight: 1.,
        }
    }

    pub fn len(&self) -> usize {
        self.persons.len()
    }

    /// `f_a - f_b` for every comparison, where `f = t + w.y` for the comparison's person
    pub fn latent_differences(&self, t: &Array1<f64>, w: &Array2<f64>, y: &Array2<f64>) -> Array1<f64> {
        let mut diff = Array1::zeros(self.len());
        Zip::indexed(&mut diff).for_each(|i, d| {
            let (a, b, p) = (self.items_a[i], self.items_b[i], self.persons[i]);
            let dw = &w.row(a) - &w.row(b);
            *d = t[a] - t[b] + dw.dot(&y.column(p));
        });
        diff
    }

    /// `w_af - w_bf` for every comparison and factor (nfactors, batch size)
    pub fn factor_differences(&self, w: &Array2<f64>) -> Array2<f64> {
        let mut dw = Array2::zeros((w.ncols(), self.len()));
        for (i, mut col) in dw.columns_mut().into_iter().enumerate() {
            col.assign(&(&w.row(self.items_a[i]) - &w.row(self.items_b[i])));
        }
        dw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use ndarray_rand::rand::SeedableRng;

    #[test]
    fn test_observations_from_matrix() {
        let obs = Observations::from_matrix(&array![[0., 0., 1., 1.], [1., 2., 1., 0.5]]).unwrap();
        assert_eq!(obs.len(), 2);
        assert_eq!(obs.persons(), &[0, 1]);
        assert_eq!(obs.items_b(), &[1, 1]);
        assert_eq!(obs.n_people(), 2);
        assert_eq!(obs.n_items(), 3);
        assert!(Observations::from_matrix(&array![[0., 0.5, 1., 1.]]).is_err());
    }

    #[test]
    fn test_bad_observations() {
        assert!(Observations::new(vec![0], vec![0], vec![1], array![1.5]).is_err());
        assert!(Observations::new(vec![0, 1], vec![0], vec![1], array![1.]).is_err());
        assert!(matches!(
            Observations::new(vec![], vec![], vec![], array![]),
            Err(PrefError::MissingObservations(_))
        ));
    }

    #[test]
    fn test_preference_data_checks_features() {
        let obs = Observations::from_comparisons(&[Comparison::new(1, 0, 3, 1.)]).unwrap();
        assert!(PreferenceData::new(obs.clone(), Array2::zeros((3, 1)), None).is_err());
        assert!(PreferenceData::new(obs.clone(), Array2::zeros((4, 1)), None).is_ok());
        assert!(
            PreferenceData::new(obs.clone(), Array2::zeros((4, 1)), Some(Array2::zeros((1, 2))))
                .is_err()
        );
        let data =
            PreferenceData::new(obs, Array2::zeros((4, 1)), Some(Array2::zeros((5, 2)))).unwrap();
        assert_eq!(data.n_people(), 5);
    }

    #[test]
    fn test_sample_indices() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let idx = sample_indices(100, 10, &mut rng);
        assert_eq!(idx.len(), 10);
        assert!(idx.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sample_indices(5, 10, &mut rng), vec![0, 1, 2, 3, 4]);

        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        assert_eq!(sample_indices(100, 10, &mut rng), idx);
    }
}
