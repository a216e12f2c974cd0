use thiserror::Error;

/// Errors raised while preparing inputs, fitting the null model, or
/// regularizing covariance estimates.
#[derive(Debug, Error)]
pub enum VdError {
    /// Inconsistent or missing configuration, e.g. caching without an output directory.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("dimension mismatch: {0}")]
    Dimension(String),

    #[error("non-finite values in {0}")]
    NonFinite(String),

    /// The data carry no information for one of the variance components.
    #[error("degenerate input: {0}")]
    Degenerate(String),

    #[error("linear algebra backend failure: {0}")]
    Linalg(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VdError>;
