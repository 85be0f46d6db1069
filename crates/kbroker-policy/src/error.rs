//! Policy error types

use thiserror::Error;

/// Result type for policy operations
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Policy preparation and evaluation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// The rule module or query could not be prepared
    #[error("policy compilation failed: {0}")]
    Compile(String),

    /// Evaluation failed, produced no result, or produced the wrong shape
    #[error("policy evaluation failed: {0}")]
    Evaluation(String),
}

impl PolicyError {
    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            PolicyError::Compile(_) => "policy_compile",
            PolicyError::Evaluation(_) => "policy_evaluation",
        }
    }
}
