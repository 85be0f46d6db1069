//! Broker error types
//!
//! [`BrokerError`] is what callers see. Authentication failures are
//! deliberately coalesced into [`BrokerError::AuthFail`] so a caller cannot
//! tell a bad signature from a missing nonce or a policy denial; the precise
//! cause is only logged. Operational failures collapse into
//! [`BrokerError::SystemFault`] the same way.

use kbroker_auth::KeyResolutionError;
use kbroker_keytab::{KeytabError, MaterializeError};
use kbroker_policy::PolicyError;
use std::path::PathBuf;
use thiserror::Error;

/// Request failures at the broker boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Empty or malformed token or principal; the caller can fix this
    #[error("invalid request: {0}")]
    DataValidation(String),

    /// Access denied, for whatever reason
    #[error("authentication failed")]
    AuthFail,

    /// The principal is not served by this broker
    #[error("principal '{0}' not found")]
    NotFound(String),

    /// The broker could not decide; treated as a denial
    #[error("internal error")]
    SystemFault,

    /// The caller gave up before the request completed
    #[error("request cancelled")]
    Cancelled,
}

impl BrokerError {
    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            BrokerError::DataValidation(_) => "data_validation",
            BrokerError::AuthFail => "auth_fail",
            BrokerError::NotFound(_) => "not_found",
            BrokerError::SystemFault => "system_fault",
            BrokerError::Cancelled => "cancelled",
        }
    }
}

/// Configuration and startup errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The broker config file does not exist
    #[error("broker config {} does not exist", .0.display())]
    FileNotFound(PathBuf),

    /// The extension names no known format
    #[error("broker config {} must end in .toml, .yaml, .yml or .json", .0.display())]
    UnsupportedFormat(PathBuf),

    /// The file or an environment override did not deserialize
    #[error("broker config rejected: {0}")]
    Parse(#[from] config::ConfigError),

    /// A value outside its allowed range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The policy did not compile
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// The keytab cache rejected its settings
    #[error("Keytab cache error: {0}")]
    Keytab(#[from] KeytabError),

    /// No usable keytab materializer
    #[error("Materializer error: {0}")]
    Materializer(#[from] MaterializeError),

    /// The HTTP client for key resolution could not be built
    #[error("HTTP client error: {0}")]
    Http(#[from] KeyResolutionError),

    /// The tracing subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),
}
