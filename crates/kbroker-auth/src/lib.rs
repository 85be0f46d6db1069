//! # kbroker-auth - Token Verification and Anti-Replay
//!
//! Everything the broker needs to trust a bearer token and bind two token
//! exchanges together:
//!
//! - [`jwt`] - JWKS sources, the caching [`PublicKeyResolver`] and the
//!   caching [`TokenVerifier`]
//! - [`nonce`] - [`NonceIssuer`], one-time values with a short lifetime
//! - [`error`] - typed failures for each of the above
//!
//! ## Flow
//!
//! ```text
//! raw JWT ──► TokenVerifier ──► PublicKeyResolver ──► JwksSource (OIDC discovery)
//!                 │                    │
//!                 ▼                    ▼
//!          ExpiringCache<Token>  ExpiringCache<VerificationKey>
//! ```
//!
//! ## Standards
//!
//! - **RFC 7519** - JSON Web Token (JWT)
//! - **RFC 7517** - JSON Web Key (JWK)
//! - **RFC 7518** - JSON Web Algorithms (JWA)
//! - **OpenID Connect Discovery 1.0** - `/.well-known/openid-configuration`

pub mod error;
pub mod jwt;
pub mod nonce;

#[doc(inline)]
pub use error::{KeyResolutionError, NonceError, TokenError};

#[doc(inline)]
pub use jwt::{
    EcCurve, HttpConfig, JwksSource, JwsAlgorithm, KeyType, OidcDiscoverySource,
    PublicKeyResolver, StaticJwksSource, Token, TokenVerifier, VerificationKey, VerifierConfig,
};

#[doc(inline)]
pub use nonce::{DEFAULT_NONCE_LIFETIME, NONCE_LENGTH, Nonce, NonceIssuer};
