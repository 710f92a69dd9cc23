use thiserror::Error;

use super::reciprocal::ReciprocalError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Fatal SCF convergence failure: {eps:.5e} > {previous:.5e}")]
    ScfDivergence { eps: f64, previous: f64 },

    #[error("SCF failed to converge within {iterations} iterations")]
    ScfMaxIterations { iterations: usize },

    #[error("Reciprocal space convolution failed: {source}")]
    Reciprocal {
        #[from]
        source: ReciprocalError,
    },

    #[error("Internal logic error: {0}")]
    Internal(String),
}
