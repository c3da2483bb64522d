use thiserror::Error;

/// Errors produced while building, decoding or evaluating rate matrices.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RateMatrixError {
    /// Sizes of the rate matrix, stationary distribution, parameter vector or count
    /// matrix do not agree, or the stationary distribution is not a valid distribution.
    #[error("Dimension mismatch: {0}")]
    Dimension(String),

    /// A parameter vector could not be decoded into a valid rate matrix.
    #[error("Could not reconstruct rate matrix from parameters: {0}")]
    Reconstruction(String),

    /// The initial guess could not produce a real valued generator.
    #[error("Could not construct initial guess: {reason}")]
    SingularGuess { reason: String },

    /// The matrix exponential of a candidate rate matrix could not be computed.
    #[error("Numerical instability in matrix exponential: {0}")]
    NumericalInstability(String),

    /// A rate matrix violates the generator constraints.
    #[error("Invalid rate matrix: {0}")]
    InvalidGenerator(String),

    #[error("Invalid sampler settings: {0}")]
    InvalidSettings(String),
}

impl RateMatrixError {
    /// Recoverable errors during sampling are counted as rejected proposals,
    /// all other errors abort the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RateMatrixError::Reconstruction(_) | RateMatrixError::NumericalInstability(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RateMatrixError>;
