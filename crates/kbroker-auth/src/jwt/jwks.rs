//! JWKS (JSON Web Key Set) sources
//!
//! A [`JwksSource`] turns an issuer URL into that issuer's raw key set.
//! Caching is not done here; [`super::PublicKeyResolver`] caches the keys it
//! converts.
//!
//! - [`OidcDiscoverySource`] follows OpenID Connect Discovery: it fetches
//!   `{issuer}/.well-known/openid-configuration`, checks that the document
//!   names the same issuer, then fetches `jwks_uri`.
//! - [`StaticJwksSource`] serves key sets pinned in memory.
//!
//! Keys are returned as raw JSON values so that one unparseable key does not
//! poison the rest of the set.

use crate::error::KeyResolutionError;
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

const DISCOVERY_PATH: &str = ".well-known/openid-configuration";

/// Where an issuer's key set comes from
#[async_trait]
pub trait JwksSource: Send + Sync + fmt::Debug {
    /// Fetch every key the issuer currently publishes
    async fn fetch_key_set(&self, issuer: &str) -> Result<Vec<Value>, KeyResolutionError>;
}

/// HTTP client settings for discovery and key set fetches
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Idle keep-alive connections kept per host
    pub max_idle_per_host: usize,
    /// Accept `http://` issuers and `jwks_uri`s (local development only)
    pub allow_http: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_idle_per_host: 8,
            allow_http: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct RawKeySet {
    keys: Vec<Value>,
}

/// Key sets fetched over HTTP via OpenID Connect Discovery
#[derive(Debug, Clone)]
pub struct OidcDiscoverySource {
    client: reqwest::Client,
    allow_http: bool,
}

impl OidcDiscoverySource {
    /// Build the HTTP client
    ///
    /// Redirects are not followed.
    pub fn new(config: &HttpConfig) -> Result<Self, KeyResolutionError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("kbroker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KeyResolutionError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allow_http: config.allow_http,
        })
    }

    /// The discovery document URL for an issuer
    pub fn discovery_url(issuer: &str) -> String {
        format!("{}/{DISCOVERY_PATH}", issuer.trim_end_matches('/'))
    }

    fn checked_url(&self, raw: &str) -> Result<Url, KeyResolutionError> {
        let url = Url::parse(raw)
            .map_err(|e| KeyResolutionError::InvalidRequest(format!("invalid URL '{raw}': {e}")))?;

        match url.scheme() {
            "https" => Ok(url),
            "http" if self.allow_http => Ok(url),
            scheme => Err(KeyResolutionError::InvalidRequest(format!(
                "URL scheme '{scheme}' not allowed for '{raw}'"
            ))),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, KeyResolutionError> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            error!(url = %url, error = %e, "request failed");
            KeyResolutionError::Http(format!("GET {url} failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            error!(url = %url, status = %status, "endpoint returned error status");
            return Err(KeyResolutionError::Http(format!("GET {url} returned {status}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| KeyResolutionError::Malformed(format!("{url}: {e}")))
    }
}

#[async_trait]
impl JwksSource for OidcDiscoverySource {
    async fn fetch_key_set(&self, issuer: &str) -> Result<Vec<Value>, KeyResolutionError> {
        let discovery_url = self.checked_url(&Self::discovery_url(issuer))?;
        debug!(issuer, url = %discovery_url, "fetching discovery document");

        let document: DiscoveryDocument = self.get_json(discovery_url).await?;

        if document.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(KeyResolutionError::Malformed(format!(
                "discovery document issuer '{}' does not match '{issuer}'",
                document.issuer
            )));
        }

        let jwks_url = self.checked_url(&document.jwks_uri)?;
        let key_set: RawKeySet = self.get_json(jwks_url).await?;

        debug!(issuer, keys = key_set.keys.len(), "fetched key set");
        Ok(key_set.keys)
    }
}

/// Key sets pinned in memory, per issuer
///
/// For deployments that distribute issuer keys out of band, and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticJwksSource {
    key_sets: HashMap<String, Vec<Value>>,
}

impl StaticJwksSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin an issuer's key set
    ///
    /// `jwks` is a JWKS document (`{"keys": [...]}`) or a bare list of keys.
    pub fn with_issuer(
        mut self,
        issuer: impl Into<String>,
        jwks: Value,
    ) -> Result<Self, KeyResolutionError> {
        let keys = match jwks {
            Value::Array(keys) => keys,
            other => {
                serde_json::from_value::<RawKeySet>(other)
                    .map_err(|e| KeyResolutionError::Malformed(e.to_string()))?
                    .keys
            }
        };
        self.key_sets.insert(issuer.into(), keys);
        Ok(self)
    }
}

#[async_trait]
impl JwksSource for StaticJwksSource {
    async fn fetch_key_set(&self, issuer: &str) -> Result<Vec<Value>, KeyResolutionError> {
        self.key_sets.get(issuer).cloned().ok_or_else(|| {
            KeyResolutionError::Http(format!("no key set configured for issuer '{issuer}'"))
        })
    }
}
