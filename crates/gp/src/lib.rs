//! Sparse Gaussian Process building blocks for variational preference learning.
//!
//! A latent function is summarized by its values `u` at M inducing points; its value
//! at N training locations is recovered through the projection `K_nm K_mm^-1 u`,
//! which reduces the processing complexity from O(N^3) to O(N.M^2).
//!
//! * [correlation_models] provides Matern 3/2 and squared exponential kernels
//!   with their length-scale derivatives,
//! * [InducingSpace] holds the kernel matrices between inducing points and training
//!   locations (inducing points are placed by k-means, see [select_inducings]),
//! * [SviGaussian] is the Gaussian posterior over `u` updated by stochastic
//!   natural-gradient steps with the [svi_rate] Robbins-Monro schedule.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod correlation_models;
mod errors;
mod inducing;
mod svi;
mod utils;

pub use errors::*;
pub use inducing::*;
pub use svi::*;
pub use utils::{cholesky_inverse, log_det, row_quadratic_forms, symmetrize, unique_rows};
