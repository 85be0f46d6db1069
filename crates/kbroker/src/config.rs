//! Broker configuration management

use crate::error::ConfigError;
use config::FileFormat;
use kbroker_core::{MAX_SWEEP_INTERVAL_SECS, MIN_SWEEP_INTERVAL_SECS};
use kbroker_keytab::{MIN_KEYTAB_LIFETIME, MIN_SEED_LEN, MaterializerConfig, validate_principal};
use kbroker_policy::PolicyDecisionPoint;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Allowed nonce lifetimes in seconds
pub const NONCE_LIFETIME_RANGE: RangeInclusive<u64> = 30..=86_400;

/// Environment prefix read by [`BrokerConfig::from_file`]
pub const ENV_PREFIX: &str = "KBROKER";

const SWEEP_INTERVAL_RANGE: RangeInclusive<u64> = MIN_SWEEP_INTERVAL_SECS..=MAX_SWEEP_INTERVAL_SECS;

/// Broker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Secret shared by every replica; keytabs derive from it
    pub seed: SecretString,
    /// Principals keytabs are generated for
    pub principals: Vec<String>,
    /// Nonce lifetime
    #[serde(default = "default_nonce_lifetime_secs")]
    pub nonce_lifetime_secs: u64,
    /// Keytab rotation period
    #[serde(default = "default_keytab_lifetime_secs")]
    pub keytab_lifetime_secs: u64,
    /// Verified token cache sweep interval
    #[serde(default = "default_token_sweep_interval_secs")]
    pub token_sweep_interval_secs: u64,
    /// Nonce cache sweep interval
    #[serde(default = "default_nonce_sweep_interval_secs")]
    pub nonce_sweep_interval_secs: u64,
    /// Public key cache sweep interval
    #[serde(default = "default_key_sweep_interval_secs")]
    pub key_sweep_interval_secs: u64,
    /// How long fetched issuer keys are trusted
    #[serde(default = "default_key_cache_ttl_secs")]
    pub key_cache_ttl_secs: u64,
    /// Accept `http://` issuers (local development only)
    #[serde(default)]
    pub allow_insecure_issuer: bool,
    /// Discovery and JWKS client settings
    #[serde(default)]
    pub http: HttpSettings,
    /// Authorization policy
    pub policy: PolicySettings,
    /// Keytab materialization
    #[serde(default)]
    pub materializer: MaterializerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP client settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HttpSettings {
    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Idle keep-alive connections kept per host
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

/// Rego policy and the query that binds its decision
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicySettings {
    /// Rego module source
    pub script: String,
    /// Query binding the grant flag and the principal set
    #[serde(default = "default_policy_query")]
    pub query: String,
    /// Variable holding the grant flag
    #[serde(default = "default_grant_binding")]
    pub grant_binding: String,
    /// Variable holding the principal set
    #[serde(default = "default_principals_binding")]
    pub principals_binding: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_nonce_lifetime_secs() -> u64 {
    60
}

fn default_keytab_lifetime_secs() -> u64 {
    300
}

fn default_token_sweep_interval_secs() -> u64 {
    60
}

fn default_nonce_sweep_interval_secs() -> u64 {
    30
}

fn default_key_sweep_interval_secs() -> u64 {
    3600
}

fn default_key_cache_ttl_secs() -> u64 {
    86_400
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_idle_per_host() -> usize {
    8
}

fn default_policy_query() -> String {
    PolicyDecisionPoint::DEFAULT_QUERY.to_string()
}

fn default_grant_binding() -> String {
    "grant".to_string()
}

fn default_principals_binding() -> String {
    "principals".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl PolicySettings {
    /// Settings for `script` with the default query and bindings
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            query: default_policy_query(),
            grant_binding: default_grant_binding(),
            principals_binding: default_principals_binding(),
        }
    }
}

impl BrokerConfig {
    /// Configuration with every optional field at its default
    pub fn new(seed: SecretString, principals: Vec<String>, policy: PolicySettings) -> Self {
        Self {
            seed,
            principals,
            nonce_lifetime_secs: default_nonce_lifetime_secs(),
            keytab_lifetime_secs: default_keytab_lifetime_secs(),
            token_sweep_interval_secs: default_token_sweep_interval_secs(),
            nonce_sweep_interval_secs: default_nonce_sweep_interval_secs(),
            key_sweep_interval_secs: default_key_sweep_interval_secs(),
            key_cache_ttl_secs: default_key_cache_ttl_secs(),
            allow_insecure_issuer: false,
            http: HttpSettings::default(),
            policy,
            materializer: MaterializerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load the broker configuration from `path`
    ///
    /// The extension picks the format (`.toml`, `.yaml`/`.yml` or `.json`).
    /// `KBROKER__`-prefixed environment variables are layered on top, with
    /// `__` descending into tables, so a deployment can inject the seed as
    /// `KBROKER__SEED` and keep it out of the file. The merged result must
    /// pass [`BrokerConfig::validate`].
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileNotFound`], [`ConfigError::UnsupportedFormat`],
    /// [`ConfigError::Parse`] when a required field is missing or mistyped,
    /// and [`ConfigError::Invalid`] from validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_prefix(path, ENV_PREFIX)
    }

    /// [`BrokerConfig::from_file`] reading overrides from `{env_prefix}__*`
    ///
    /// Lets several brokers share a host, and lets tests stay clear of the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Same as [`BrokerConfig::from_file`].
    pub fn from_file_with_prefix(
        path: impl AsRef<Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = source_format(path)?;
        if !path.is_file() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let merged = config::Config::builder()
            .add_source(config::File::from(path).format(format).required(true))
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let broker: Self = merged.try_deserialize()?;
        broker.validate()?;
        debug!(
            path = %path.display(),
            principals = broker.principals.len(),
            "broker configuration loaded"
        );
        Ok(broker)
    }

    /// Check every value against its allowed range
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.seed.expose_secret().len() < MIN_SEED_LEN {
            return Err(invalid(format!("seed must be at least {MIN_SEED_LEN} bytes")));
        }
        if self.principals.is_empty() {
            return Err(invalid("principals must not be empty"));
        }
        for principal in &self.principals {
            validate_principal(principal)
                .map_err(|e| invalid(format!("principals: {e}")))?;
        }
        if !NONCE_LIFETIME_RANGE.contains(&self.nonce_lifetime_secs) {
            return Err(invalid(format!(
                "nonce_lifetime_secs {} outside {NONCE_LIFETIME_RANGE:?}",
                self.nonce_lifetime_secs
            )));
        }
        if self.keytab_lifetime_secs < MIN_KEYTAB_LIFETIME.as_secs() {
            return Err(invalid(format!(
                "keytab_lifetime_secs {} below {}",
                self.keytab_lifetime_secs,
                MIN_KEYTAB_LIFETIME.as_secs()
            )));
        }
        for (name, value) in [
            ("token_sweep_interval_secs", self.token_sweep_interval_secs),
            ("nonce_sweep_interval_secs", self.nonce_sweep_interval_secs),
            ("key_sweep_interval_secs", self.key_sweep_interval_secs),
        ] {
            if !SWEEP_INTERVAL_RANGE.contains(&value) {
                return Err(invalid(format!(
                    "{name} {value} outside {SWEEP_INTERVAL_RANGE:?}"
                )));
            }
        }
        if self.key_cache_ttl_secs == 0 {
            return Err(invalid("key_cache_ttl_secs must be positive"));
        }
        if self.http.request_timeout_secs == 0 {
            return Err(invalid("http.request_timeout_secs must be positive"));
        }
        if self.http.max_idle_per_host == 0 {
            return Err(invalid("http.max_idle_per_host must be positive"));
        }
        for (name, value) in [
            ("policy.script", &self.policy.script),
            ("policy.query", &self.policy.query),
            ("policy.grant_binding", &self.policy.grant_binding),
            ("policy.principals_binding", &self.policy.principals_binding),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("{name} must not be empty")));
            }
        }
        if self.materializer.enctypes.is_empty() {
            return Err(invalid("materializer.enctypes must not be empty"));
        }
        Ok(())
    }

    /// Nonce lifetime as a [`Duration`]
    pub fn nonce_lifetime(&self) -> Duration {
        Duration::from_secs(self.nonce_lifetime_secs)
    }

    /// Keytab rotation period as a [`Duration`]
    pub fn keytab_lifetime(&self) -> Duration {
        Duration::from_secs(self.keytab_lifetime_secs)
    }
}

fn source_format(path: &Path) -> Result<FileFormat, ConfigError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => Ok(FileFormat::Toml),
        Some("yaml" | "yml") => Ok(FileFormat::Yaml),
        Some("json") => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
