//! Error types for token verification, key resolution and nonces

use thiserror::Error;

/// Failures resolving an issuer's verification key
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyResolutionError {
    /// The issuer's key set has no key with this ID
    #[error("no key '{key_id}' published by issuer '{issuer}'")]
    NotFound { issuer: String, key_id: String },

    /// The key exists but is of a type or curve we cannot verify with
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// Issuer or key ID missing, or issuer not an acceptable URL
    #[error("invalid key request: {0}")]
    InvalidRequest(String),

    /// Transport failure or non-success HTTP status
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Discovery document or key set could not be understood
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Failures verifying a bearer token
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Empty or structurally broken token
    #[error("invalid token: {0}")]
    Invalid(String),

    /// A required header or claim is absent
    #[error("token is missing required field '{0}'")]
    MissingField(&'static str),

    /// The `iss` claim names an issuer the verifier will not contact
    #[error("issuer rejected: {0}")]
    IssuerRejected(String),

    /// Signature did not verify, or the algorithm does not fit the key
    #[error("token signature invalid: {0}")]
    SignatureInvalid(String),

    /// Token is past its `exp`
    #[error("token expired")]
    Expired,

    /// The verification key could not be resolved
    #[error("key resolution failed: {0}")]
    KeyResolution(#[from] KeyResolutionError),
}

/// Failures looking up or issuing nonces
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NonceError {
    /// Unknown, empty or expired nonce
    #[error("nonce not found")]
    NotFound,

    /// The nonce could not be stored
    #[error("nonce storage failed: {0}")]
    Storage(#[from] kbroker_core::CacheError),
}

impl KeyResolutionError {
    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            KeyResolutionError::NotFound { .. } => "key_not_found",
            KeyResolutionError::UnsupportedKeyType(_) => "unsupported_key_type",
            KeyResolutionError::InvalidRequest(_) => "invalid_key_request",
            KeyResolutionError::Http(_) => "http",
            KeyResolutionError::Malformed(_) => "malformed_document",
        }
    }
}

impl TokenError {
    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            TokenError::Invalid(_) => "invalid",
            TokenError::MissingField(_) => "missing_field",
            TokenError::IssuerRejected(_) => "issuer_rejected",
            TokenError::SignatureInvalid(_) => "signature_invalid",
            TokenError::Expired => "expired",
            TokenError::KeyResolution(e) => e.category(),
        }
    }

    /// Whether the failure is operational rather than a verdict on the token
    ///
    /// Network and document failures say nothing about the caller; an
    /// unknown key ID or unsupported key type does.
    pub fn is_system_fault(&self) -> bool {
        matches!(
            self,
            TokenError::KeyResolution(
                KeyResolutionError::Http(_) | KeyResolutionError::Malformed(_)
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KeyResolutionError::NotFound {
            issuer: "https://issuer.example/".to_string(),
            key_id: "k1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "no key 'k1' published by issuer 'https://issuer.example/'"
        );
        assert_eq!(
            TokenError::MissingField("kid").to_string(),
            "token is missing required field 'kid'"
        );
    }

    #[test]
    fn test_system_fault_classification() {
        assert!(TokenError::KeyResolution(KeyResolutionError::Http("503".into())).is_system_fault());
        assert!(!TokenError::Expired.is_system_fault());
        assert!(
            !TokenError::KeyResolution(KeyResolutionError::UnsupportedKeyType("oct".into()))
                .is_system_fault()
        );
    }

    #[test]
    fn test_categories_pass_through() {
        let err: TokenError = KeyResolutionError::Malformed("bad json".into()).into();
        assert_eq!(err.category(), "malformed_document");
        assert_eq!(TokenError::Expired.category(), "expired");
    }
}
