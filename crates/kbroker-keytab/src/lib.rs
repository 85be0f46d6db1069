//! # kbroker-keytab - Keytab Derivation and Rotation
//!
//! Keytabs are never stored or distributed between replicas. Each replica
//! derives them from a shared seed, the principal name and the start of the
//! current time period, so the whole fleet rotates in lockstep.
//!
//! ## Architecture
//!
//! - [`principal`] - Principal name validation
//! - [`derive`] - TOTP-SHA512 based password derivation
//! - [`materialize`] - Turning a password into keytab bytes (`ktutil`, or a
//!   shared-secret fallback)
//! - [`cache`] - [`KeytabCache`], the per-principal store and its rotation
//!   scheduler
//!
//! ## Example
//!
//! ```rust,no_run
//! use kbroker_keytab::{KeytabCache, KeytabCacheConfig, SharedSecretMaterializer};
//! use kbroker_core::system_clock;
//! use secrecy::SecretString;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), kbroker_keytab::KeytabError> {
//! let cache = KeytabCache::new(
//!     KeytabCacheConfig {
//!         seed: SecretString::new("replace-with-a-long-random-seed".to_string()),
//!         principals: vec!["alice@EXAMPLE.COM".to_string()],
//!         lifetime: Duration::from_secs(300),
//!     },
//!     Arc::new(SharedSecretMaterializer),
//!     system_clock(),
//! )?;
//! cache.start().await;
//!
//! let keytab = cache.get("alice@EXAMPLE.COM")?;
//! println!("valid until {}", keytab.expires_at);
//!
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod derive;
pub mod error;
pub mod materialize;
pub mod principal;

pub use cache::{
    DEFAULT_KEYTAB_LIFETIME, Keytab, KeytabCache, KeytabCacheConfig, MIN_KEYTAB_LIFETIME,
    MIN_SEED_LEN, RefreshSummary,
};
pub use derive::derive_password;
pub use error::{KeytabError, MaterializeError, PrincipalError};
pub use materialize::{
    KeytabMaterializer, KtutilMaterializer, MaterializerConfig, MaterializerKind,
    SharedSecretMaterializer, UnsupportedMaterializer, detect_materializer,
};
pub use principal::{Principal, validate_principal};
