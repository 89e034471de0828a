/// Error types for x402-gate.
///
/// Only infrastructure faults travel through [`Error`]. Payment decisions
/// (rejection, denial, settlement failure) are typed outcomes, see
/// [`crate::core::GateOutcome`].
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),
}
