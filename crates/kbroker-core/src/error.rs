//! Error types for the foundation primitives

use thiserror::Error;

/// Errors raised by [`crate::ExpiringCache`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache key must not be empty")]
    EmptyKey,

    #[error("cache entity for key '{0}' is empty")]
    EmptyEntity(String),
}

/// Errors raised when constructing a [`crate::TimePeriod`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeriodError {
    #[error("time period length must be positive")]
    NonPositive,

    #[error("time period length must be a whole number of seconds, got {0:?}")]
    FractionalSeconds(std::time::Duration),
}

impl CacheError {
    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            CacheError::EmptyKey => "empty_key",
            CacheError::EmptyEntity(_) => "empty_entity",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        assert_eq!(CacheError::EmptyKey.to_string(), "cache key must not be empty");
        assert_eq!(
            PeriodError::FractionalSeconds(Duration::from_millis(1500)).to_string(),
            "time period length must be a whole number of seconds, got 1.5s"
        );
    }

    #[test]
    fn test_error_category() {
        assert_eq!(CacheError::EmptyKey.category(), "empty_key");
        assert_eq!(
            CacheError::EmptyEntity("k".to_string()).category(),
            "empty_entity"
        );
    }
}
