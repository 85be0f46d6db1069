//! Error types for principals, materialization and the keytab cache

use thiserror::Error;

/// Invalid principal names
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrincipalError {
    #[error("principal is empty")]
    Empty,

    #[error("principal length {0} outside 3..=254")]
    Length(usize),

    #[error("principal '{0}' is not of the form localpart@REALM")]
    Format(String),
}

/// Failures turning a password into keytab bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaterializeError {
    /// No way to produce keytabs on this host
    #[error("keytab materialization unsupported: {0}")]
    Unsupported(String),

    /// Temporary files or process plumbing failed
    #[error("I/O error: {0}")]
    Io(String),

    /// The external tool ran and failed
    #[error("{tool} failed ({status}): {stderr}")]
    Tool {
        tool: String,
        status: String,
        stderr: String,
    },

    /// Arguments the tool cannot be given safely
    #[error("invalid materializer input: {0}")]
    InvalidInput(String),
}

impl From<std::io::Error> for MaterializeError {
    fn from(error: std::io::Error) -> Self {
        MaterializeError::Io(error.to_string())
    }
}

/// Keytab cache failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeytabError {
    /// Malformed principal in a request
    #[error("invalid principal: {0}")]
    InvalidPrincipal(#[from] PrincipalError),

    /// The principal is not configured
    #[error("principal '{0}' is not configured")]
    NotFound(String),

    /// Configured, but no material exists for the current period yet
    #[error("keytab for '{0}' not generated yet")]
    NotReady(String),

    /// The last generation attempt failed; retried by the scheduler
    #[error("keytab generation for '{principal}' failed: {reason}")]
    GenerationFailed { principal: String, reason: String },

    /// The cache was constructed with unusable settings
    #[error("keytab cache configuration error: {0}")]
    Config(String),
}

impl KeytabError {
    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            KeytabError::InvalidPrincipal(_) => "invalid_principal",
            KeytabError::NotFound(_) => "principal_not_found",
            KeytabError::NotReady(_) => "keytab_not_ready",
            KeytabError::GenerationFailed { .. } => "keytab_generation_failed",
            KeytabError::Config(_) => "configuration_error",
        }
    }
}

impl MaterializeError {
    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            MaterializeError::Unsupported(_) => "materialize_unsupported",
            MaterializeError::Io(_) => "materialize_io",
            MaterializeError::Tool { .. } => "materialize_tool",
            MaterializeError::InvalidInput(_) => "materialize_invalid_input",
        }
    }
}
