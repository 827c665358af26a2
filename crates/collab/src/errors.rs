use prefbox_gp::GpError;
use thiserror::Error;

/// A result type for collaborative preference learning
pub type Result<T> = std::result::Result<T, PrefError>;

/// An error when fitting or querying a [`CollabPrefModel`](crate::CollabPrefModel)
#[derive(Error, Debug)]
pub enum PrefError {
    /// When a sparse GP primitive fails (ill-conditioned update, clustering, kernel)
    #[error(transparent)]
    GpError(#[from] GpError),
    /// When the configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// When observations or features are inconsistent
    #[error("Invalid data: {0}")]
    InvalidData(String),
    /// When an operation needs training observations that are not available
    #[error("Missing observations: {0}")]
    MissingObservations(String),
    /// When snapshot (de)serialization fails
    #[cfg(feature = "persistent")]
    #[error("Snapshot error: {0}")]
    SnapshotError(#[from] serde_json::Error),
    /// When snapshot file IO fails
    #[cfg(feature = "persistent")]
    #[error("Snapshot IO error")]
    SnapshotIoError(#[from] std::io::Error),
}
