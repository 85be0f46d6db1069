//! JWT Infrastructure - key resolution and bearer token verification
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ TokenVerifier                        │
//! │  - structural checks (alg/kid/typ)   │
//! │  - issuer scheme policy              │
//! │  - signature + explicit expiry check │
//! │  - cache keyed by raw token          │
//! └──────────────────┬───────────────────┘
//!                    │ (issuer, kid)
//! ┌──────────────────▼───────────────────┐
//! │ PublicKeyResolver                    │
//! │  - cache keyed by issuer:kid (24h)   │
//! │  - JWK → native key conversion       │
//! └──────────────────┬───────────────────┘
//!                    │ issuer
//! ┌──────────────────▼───────────────────┐
//! │ JwksSource                           │
//! │  - OIDC discovery → jwks_uri → keys  │
//! └──────────────────────────────────────┘
//! ```

pub mod algorithm;
pub mod jwks;
pub mod resolver;
pub mod verifier;

pub use algorithm::JwsAlgorithm;
pub use jwks::{HttpConfig, JwksSource, OidcDiscoverySource, StaticJwksSource};
pub use resolver::{EcCurve, KeyType, PublicKeyResolver, VerificationKey};
pub use verifier::{TokenVerifier, VerifierConfig};

use chrono::{DateTime, Utc};
use kbroker_core::Expiring;
use serde::{Deserialize, Serialize};

/// A verified bearer token
///
/// Immutable once produced by [`TokenVerifier`]; handed out behind `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Issuer (iss)
    pub issuer: String,
    /// Key ID (kid) from the header
    pub key_id: String,
    /// Signing algorithm (alg) from the header
    pub algorithm: JwsAlgorithm,
    /// Token type (typ) from the header
    pub token_type: String,
    /// Expiration time (exp)
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expiry: DateTime<Utc>,
    /// Audiences (aud), normalized to a list
    pub audience: Vec<String>,
    /// Subject (sub), when present
    pub subject: Option<String>,
    /// Every claim in the payload, registered ones included
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl Token {
    /// Whether `aud` is one of the token's audiences
    pub fn has_audience(&self, aud: &str) -> bool {
        !aud.is_empty() && self.audience.iter().any(|a| a == aud)
    }

    /// The claims as a JSON object, the shape handed to policy evaluation
    pub fn claims_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.claims.clone())
    }
}

impl Expiring for Token {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry
    }
}
