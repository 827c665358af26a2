use crate::algorithm::CollabPrefModel;
use crate::consensus::Consensus;
use crate::data::PreferenceData;
use crate::errors::Result;
use crate::item_factors::ItemFactors;
use crate::parameters::CollabPrefValidParams;
use crate::person_factors::PersonFactors;
use crate::state::OrchestrationState;

use ndarray::{Array1, Array2};
use prefbox_gp::{unique_rows, InducingSpace};
use rand_xoshiro::Xoshiro256Plus;
use serde::{Deserialize, Serialize};
#[cfg(feature = "persistent")]
use std::fs;
#[cfg(feature = "persistent")]
use std::io::Write;
#[cfg(feature = "persistent")]
use std::path::Path;

/// Serializable state of a fitted [CollabPrefModel]: parameters, training data,
/// inducing locations and every posterior. Kernel matrices are not stored and
/// are recomputed on restore.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSnapshot {
    params: CollabPrefValidParams,
    data: PreferenceData,
    item_inducings: Array2<f64>,
    person_inducings: Option<Array2<f64>>,
    noise: Array1<f64>,
    consensus: Option<Consensus>,
    item_factors: ItemFactors,
    person_factors: PersonFactors,
    trained: Vec<bool>,
    state: OrchestrationState,
    rng: Xoshiro256Plus,
}

#[cfg(feature = "persistent")]
impl PosteriorSnapshot {
    /// JSON representation
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON representation
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl CollabPrefModel {
    /// Capture the posterior state
    pub fn snapshot(&self) -> PosteriorSnapshot {
        PosteriorSnapshot {
            params: self.params.clone(),
            data: self.data.clone(),
            item_inducings: self.items.inducings().to_owned(),
            person_inducings: self.person_space.as_ref().map(|s| s.inducings().to_owned()),
            noise: self.noise.clone(),
            consensus: self.consensus.clone(),
            item_factors: self.item_factors.clone(),
            person_factors: self.person_factors.clone(),
            trained: self.trained.clone(),
            state: self.state.clone(),
            rng: self.rng.clone(),
        }
    }

    /// Restore a model from a snapshot, recomputing kernel matrices
    pub fn from_snapshot(snapshot: PosteriorSnapshot) -> Result<Self> {
        let PosteriorSnapshot {
            params,
            data,
            item_inducings,
            person_inducings,
            noise,
            consensus,
            item_factors,
            person_factors,
            trained,
            state,
            rng,
        } = snapshot;
        let (unique_items, item_index) = unique_rows(data.item_features());
        let items = InducingSpace::new(
            params.kernel(),
            params.item_length_scales(),
            item_inducings,
            unique_items,
            params.jitter(),
        )?;
        let person_space = match (person_inducings, data.person_features()) {
            (Some(z), Some(pf)) => Some(InducingSpace::new(
                params.kernel(),
                params.person_length_scales(),
                z,
                pf.to_owned(),
                params.jitter(),
            )?),
            _ => None,
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
            state,
            rng,
        })
    }

    /// Save the model as a JSON snapshot in the given file
    #[cfg(feature = "persistent")]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = fs::File::create(path)?;
        let bytes = serde_json::to_vec(&self.snapshot())?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Load a model saved with [CollabPrefModel::save]
    #[cfg(feature = "persistent")]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path)?;
        let snapshot: PosteriorSnapshot = serde_json::from_slice(&data)?;
        Self::from_snapshot(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Comparison, Observations};
    #[cfg(feature = "persistent")]
    use crate::errors::PrefError;
    use approx::assert_abs_diff_eq;
    use linfa::ParamGuard;
    use ndarray::array;

    fn model() -> CollabPrefModel {
        let obs = Observations::from_comparisons(&[
            Comparison::new(0, 0, 1, 1.),
            Comparison::new(0, 1, 2, 0.),
            Comparison::new(1, 0, 2, 0.5),
            Comparison::new(2, 3, 1, 1.),
            Comparison::new(2, 2, 3, 0.),
        ])
        .unwrap();
        let data = PreferenceData::new(
            obs,
            array![[0.], [1.], [2.], [3.]],
            Some(array![[0.], [0.5], [3.]]),
        )
        .unwrap();
        CollabPrefModel::params(2)
            .max_iter(6)
            .seed(Some(42))
            .check()
            .unwrap()
            .fit(&data)
            .unwrap()
    }

    fn assert_same_predictions(a: &CollabPrefModel, b: &CollabPrefModel) {
        for (p, i, j) in [(0, 0, 1), (1, 2, 0), (2, 3, 2), (5, 1, 3)] {
            assert_abs_diff_eq!(a.predict(p, i, j).unwrap(), b.predict(p, i, j).unwrap(), epsilon = 1e-12);
            assert_abs_diff_eq!(a.predict_f(p, i).unwrap(), b.predict_f(p, i).unwrap(), epsilon = 1e-12);
        }
        assert_abs_diff_eq!(a.lowerbound().unwrap(), b.lowerbound().unwrap(), epsilon = 1e-9);
    }

    #[test]
    fn test_restore_from_snapshot() {
        let model = model();
        let restored = CollabPrefModel::from_snapshot(model.snapshot()).unwrap();
        assert_same_predictions(&model, &restored);
        assert_eq!(restored.snapshot(), model.snapshot());
    }

    #[cfg(feature = "persistent")]
    #[test]
    fn test_json_round_trip() {
        let model = model();
        let json = model.snapshot().to_json().unwrap();
        let restored = CollabPrefModel::from_snapshot(PosteriorSnapshot::from_json(&json).unwrap()).unwrap();
        assert_same_predictions(&model, &restored);
        assert_eq!(restored.person_inducings().unwrap(), model.person_inducings().unwrap());
        assert_eq!(restored.state(), model.state());
        assert!(matches!(
            PosteriorSnapshot::from_json("{}"),
            Err(PrefError::SnapshotError(_))
        ));
    }

    #[cfg(feature = "persistent")]
    #[test]
    fn test_save_load() {
        let model = model();
        let path = std::env::temp_dir().join("prefbox_collab_snapshot_test.json");
        model.save(&path).unwrap();
        let restored = CollabPrefModel::load(&path).unwrap();
        assert_same_predictions(&model, &restored);
        let _ = fs::remove_file(&path);
        assert!(matches!(
            CollabPrefModel::load(std::env::temp_dir().join("prefbox_missing_snapshot.json")),
            Err(PrefError::SnapshotIoError(_))
        ));
    }
}
