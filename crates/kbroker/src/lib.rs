//! # kbroker - OIDC to Kerberos Credential Broker
//!
//! Exchanges short-lived OAuth/OIDC bearer tokens for ephemeral keytabs,
//! gated by nonce-based replay protection and a Rego authorization policy.
//!
//! ## Flow
//!
//! 1. The client presents token A. The broker verifies it, asks the policy
//!    whether a nonce may be issued, and returns a nonce.
//! 2. The client obtains token B from its identity provider with the nonce
//!    as audience.
//! 3. The client presents token B and a principal. The broker verifies the
//!    token, confirms the nonce is live, asks the policy whether the principal
//!    is authorized, and returns the current keytab.
//!
//! ## Fleet Rotation
//!
//! Keytabs are derived from a shared seed, the principal and the start of
//! the current period, so every replica serves identical keytabs and rotates
//! at the same instant without coordination. See [`kbroker_keytab`].
//!
//! ## Crates
//!
//! - [`kbroker_core`] - clocks, the expiring cache, time periods
//! - [`kbroker_auth`] - key resolution, token verification, nonces
//! - [`kbroker_policy`] - the policy decision point
//! - [`kbroker_keytab`] - derivation, materialization and the keytab cache
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kbroker::{Broker, BrokerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(token_a: &str, token_b: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerConfig::from_file("kbroker.toml")?;
//! kbroker::logging::init(&config.logging)?;
//!
//! let broker = Broker::start(config).await?;
//! let cancel = CancellationToken::new();
//!
//! let nonce = broker.issue_nonce(&cancel, token_a).await?;
//! // ... obtain token_b with aud = nonce.value ...
//! let keytab = broker.issue_credential(&cancel, token_b, "alice@EXAMPLE.COM").await?;
//! println!("{} valid until {}", keytab.principal, keytab.expires_at);
//!
//! broker.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod logging;

pub use broker::{Broker, BrokerBuilder};
pub use config::{BrokerConfig, ENV_PREFIX, HttpSettings, LoggingConfig, PolicySettings};
pub use error::{BrokerError, ConfigError};

pub use kbroker_auth::Nonce;
pub use kbroker_keytab::{Keytab, MaterializerConfig, MaterializerKind};
