//! JWS signing algorithms accepted from token headers
//!
//! The JWT library covers the RSA family plus ES256 and ES384. ES512
//! (P-521 with SHA-512) and ES224 (P-224 with SHA-224, not an IANA
//! registered name) are checked with the RustCrypto curve crates instead;
//! [`JwsAlgorithm::native`] tells the two apart.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Asymmetric `alg` header values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JwsAlgorithm {
    /// ECDSA on P-224 with SHA-224
    ES224,
    /// ECDSA on P-256 with SHA-256
    ES256,
    /// ECDSA on P-384 with SHA-384
    ES384,
    /// ECDSA on P-521 with SHA-512
    ES512,
    /// RSASSA-PKCS1-v1_5 with SHA-256
    RS256,
    /// RSASSA-PKCS1-v1_5 with SHA-384
    RS384,
    /// RSASSA-PKCS1-v1_5 with SHA-512
    RS512,
    /// RSASSA-PSS with SHA-256
    PS256,
    /// RSASSA-PSS with SHA-384
    PS384,
    /// RSASSA-PSS with SHA-512
    PS512,
}

impl JwsAlgorithm {
    /// Parse a header `alg`; symmetric and unknown names yield `None`
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "ES224" => Self::ES224,
            "ES256" => Self::ES256,
            "ES384" => Self::ES384,
            "ES512" => Self::ES512,
            "RS256" => Self::RS256,
            "RS384" => Self::RS384,
            "RS512" => Self::RS512,
            "PS256" => Self::PS256,
            "PS384" => Self::PS384,
            "PS512" => Self::PS512,
            _ => return None,
        })
    }

    /// The header spelling
    pub fn name(self) -> &'static str {
        match self {
            Self::ES224 => "ES224",
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
            Self::ES512 => "ES512",
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::RS512 => "RS512",
            Self::PS256 => "PS256",
            Self::PS384 => "PS384",
            Self::PS512 => "PS512",
        }
    }

    /// The JWT library's equivalent, when it has one
    pub fn native(self) -> Option<jsonwebtoken::Algorithm> {
        use jsonwebtoken::Algorithm;

        match self {
            Self::ES224 | Self::ES512 => None,
            Self::ES256 => Some(Algorithm::ES256),
            Self::ES384 => Some(Algorithm::ES384),
            Self::RS256 => Some(Algorithm::RS256),
            Self::RS384 => Some(Algorithm::RS384),
            Self::RS512 => Some(Algorithm::RS512),
            Self::PS256 => Some(Algorithm::PS256),
            Self::PS384 => Some(Algorithm::PS384),
            Self::PS512 => Some(Algorithm::PS512),
        }
    }
}

impl fmt::Display for JwsAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
