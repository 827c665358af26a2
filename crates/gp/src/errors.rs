use thiserror::Error;

/// A result type for sparse GP primitives
pub type Result<T> = std::result::Result<T, GpError>;

/// An error raised by kernel evaluation, inducing point selection or SVI updates
#[derive(Error, Debug)]
pub enum GpError {
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a natural-parameter or kernel matrix cannot be inverted
    #[error("Ill-conditioned matrix: {0} (increase jitter or reduce the mini-batch size)")]
    IllConditioned(String),
    /// When k-means selection of inducing points fails
    #[error("Inducing points clustering error: {0}")]
    ClusteringError(#[from] linfa_clustering::KMeansError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When a kernel name is not recognized
    #[error("Unknown kernel: {0}")]
    UnknownKernel(String),
    /// When array dimensions are inconsistent
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    /// When error dur to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
