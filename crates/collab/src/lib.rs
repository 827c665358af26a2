//! Collaborative preference learning from pairwise comparisons.
//!
//! People compare pairs of items and state which one they prefer (label 1 for the
//! first item, 0 for the second, 0.5 when indifferent). The model learns
//!
//! * a consensus preference function `t` over item features, shared by everybody,
//! * personal deviations `w.y` of low rank, where item loadings `w` are sparse
//!   Gaussian processes over item features and person loadings `y` are either
//!   independent Gaussians or sparse Gaussian processes over person features.
//!
//! The probability that person `p` prefers item `a` to item `b` is
//! `Phi((f_ap - f_bp) / sqrt(2))` with `f = t + w.y`.
//!
//! Inference is variational: every latent function is summarized at inducing points
//! (see `prefbox-gp`) and its posterior is learnt by stochastic natural-gradient steps
//! on mini-batches of comparisons, the likelihood being linearized around the current
//! estimate. Output scales get Gamma posteriors and the variational lower bound is
//! monitored to detect convergence.
//!
//! # Example
//!
//! ```no_run
//! use prefbox_collab::{CollabPrefModel, Inference, Observations, PreferenceData};
//! use linfa::ParamGuard;
//! use ndarray::array;
//!
//! // rows of (person, item_a, item_b, label)
//! let obs = Observations::from_matrix(&array![
//!     [0., 0., 1., 1.],
//!     [0., 1., 2., 0.],
//!     [1., 0., 2., 0.5],
//! ]).unwrap();
//! let data = PreferenceData::new(obs, array![[0.], [1.], [2.]], None).unwrap();
//!
//! let model = CollabPrefModel::params(2)
//!     .inference(Inference::FullBatch)
//!     .seed(Some(42))
//!     .check()
//!     .unwrap()
//!     .fit(&data)
//!     .unwrap();
//!
//! println!("{model}");
//! println!("P(person 0 prefers item 0 to item 1) = {}", model.predict(0, 0, 1).unwrap());
//! println!("consensus value of item 2 = {}", model.predict_t(2));
//! ```
//!
//! # Features
//!
//! ## serializable
//!
//! The `serializable` feature enables serialization of parameters, data and
//! fitted posteriors based on [serde crate](https://serde.rs/), including the
//! `PosteriorSnapshot` of a fitted model.
//!
//! ## persistent
//!
//! The `persistent` feature enables `save()`/`load()` methods for a fitted model
//! as well as JSON conversion of its snapshot.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod consensus;
mod data;
mod errors;
mod hyperparameters;
mod item_factors;
pub mod likelihood;
mod output_scale;
mod parameters;
mod person_factors;
#[cfg(feature = "serializable")]
mod snapshot;
mod state;

pub use algorithm::*;
pub use data::{Comparison, Observations, PreferenceData};
pub use errors::*;
pub use hyperparameters::LengthScaleKind;
pub use output_scale::OutputScale;
pub use parameters::*;
#[cfg(feature = "serializable")]
pub use snapshot::PosteriorSnapshot;
pub use state::*;

pub use prefbox_gp::correlation_models::Kernel;
pub use prefbox_gp::Inducings;

/// Environment variable used by demos and benchmarks to set the log level
pub const PREFBOX_LOG: &str = "PREFBOX_LOG";
