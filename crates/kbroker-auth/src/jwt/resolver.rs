//! Issuer public key resolution
//!
//! [`PublicKeyResolver`] maps `(issuer, kid)` to a ready-to-use
//! [`VerificationKey`], caching converted keys under `issuer:kid`. Signing
//! keys rotate slowly, so entries live for a day by default.
//!
//! On a miss the whole key set is fetched from the [`JwksSource`] and every
//! key that converts cleanly is cached. Each key is parsed on its own: a set
//! that also publishes, say, an Ed25519 or symmetric key still serves its EC
//! keys, and only a lookup of the unsupported `kid` reports
//! [`KeyResolutionError::UnsupportedKeyType`].
//!
//! # Misses
//!
//! Fetches are serialized per issuer, so a burst of lookups for a kid that
//! is not cached yet costs one round trip. After a successful fetch the
//! issuer's kid list is remembered for [`PublicKeyResolver::DEFAULT_REFETCH_INTERVAL`];
//! a kid the set did not publish fails from that memory instead of hitting
//! the issuer again.

use super::algorithm::JwsAlgorithm;
use super::jwks::JwksSource;
use crate::error::KeyResolutionError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk};
use kbroker_core::{Expiring, ExpiringCache, SharedClock};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Span, debug, warn};

/// Elliptic curves we can verify with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    /// NIST P-224
    P224,
    /// NIST P-256
    P256,
    /// NIST P-384
    P384,
    /// NIST P-521
    P521,
}

impl EcCurve {
    /// The one algorithm a key on this curve signs with
    pub fn algorithm(self) -> JwsAlgorithm {
        match self {
            EcCurve::P224 => JwsAlgorithm::ES224,
            EcCurve::P256 => JwsAlgorithm::ES256,
            EcCurve::P384 => JwsAlgorithm::ES384,
            EcCurve::P521 => JwsAlgorithm::ES512,
        }
    }
}

/// Key family of a verification key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Elliptic curve key
    Ec(EcCurve),
    /// RSA key
    Rsa,
}

impl KeyType {
    /// Whether a token signed with `alg` may be checked against this key
    ///
    /// EC keys take only their curve's algorithm; RSA keys take any RS or
    /// PS variant.
    pub fn accepts(&self, alg: JwsAlgorithm) -> bool {
        match self {
            KeyType::Ec(curve) => curve.algorithm() == alg,
            KeyType::Rsa => matches!(
                alg,
                JwsAlgorithm::RS256
                    | JwsAlgorithm::RS384
                    | JwsAlgorithm::RS512
                    | JwsAlgorithm::PS256
                    | JwsAlgorithm::PS384
                    | JwsAlgorithm::PS512
            ),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Ec(EcCurve::P224) => f.write_str("EC/P-224"),
            KeyType::Ec(EcCurve::P256) => f.write_str("EC/P-256"),
            KeyType::Ec(EcCurve::P384) => f.write_str("EC/P-384"),
            KeyType::Ec(EcCurve::P521) => f.write_str("EC/P-521"),
            KeyType::Rsa => f.write_str("RSA"),
        }
    }
}

/// Public key material, by the library that checks signatures with it
pub enum KeyMaterial {
    /// P-256, P-384 and RSA keys, checked by `jsonwebtoken`
    Native(DecodingKey),
    /// P-224 key for ES224
    P224(p224::ecdsa::VerifyingKey),
    /// P-521 key for ES512
    P521(p521::ecdsa::VerifyingKey),
}

/// A converted issuer key
pub struct VerificationKey {
    /// Issuer publishing the key
    pub issuer: String,
    /// Key ID within the issuer's set
    pub key_id: String,
    /// Key family
    pub key_type: KeyType,
    /// When the key set containing it was fetched
    pub fetched_at: DateTime<Utc>,
    /// When the cached copy stops being served
    pub expires_at: DateTime<Utc>,
    material: KeyMaterial,
}

impl VerificationKey {
    /// Key material in the form the signature check needs
    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }
}

// Key material has no useful Debug output
impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("issuer", &self.issuer)
            .field("key_id", &self.key_id)
            .field("key_type", &self.key_type)
            .field("fetched_at", &self.fetched_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Expiring for VerificationKey {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// What the last successful fetch of an issuer's key set contained
#[derive(Debug)]
struct RecentFetch {
    expires_at: DateTime<Utc>,
    published: HashSet<String>,
    rejected: HashMap<String, KeyResolutionError>,
}

impl RecentFetch {
    /// The answer for a kid the fetch settled, `None` when a refetch is needed
    fn settled(&self, issuer: &str, key_id: &str) -> Option<KeyResolutionError> {
        if let Some(e) = self.rejected.get(key_id) {
            return Some(e.clone());
        }
        (!self.published.contains(key_id)).then(|| not_found(issuer, key_id))
    }
}

impl Expiring for RecentFetch {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Caching `(issuer, kid)` → key resolver
pub struct PublicKeyResolver {
    source: Arc<dyn JwksSource>,
    cache: ExpiringCache<Arc<VerificationKey>>,
    recent: ExpiringCache<Arc<RecentFetch>>,
    fetch_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    key_ttl: chrono::Duration,
    refetch_interval: chrono::Duration,
    clock: SharedClock,
    span: Span,
}

impl fmt::Debug for PublicKeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKeyResolver")
            .field("source", &self.source)
            .field("cache", &self.cache)
            .field("key_ttl", &self.key_ttl)
            .field("refetch_interval", &self.refetch_interval)
            .finish_non_exhaustive()
    }
}

impl PublicKeyResolver {
    /// Default lifetime of a cached key
    pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    /// Default minimum gap between fetches of one issuer's key set for
    /// kids it did not publish
    pub const DEFAULT_REFETCH_INTERVAL: Duration = Duration::from_secs(30);

    /// Create a resolver over `source`
    pub fn new(source: Arc<dyn JwksSource>, clock: SharedClock) -> Self {
        let span = tracing::info_span!("public_key_resolver");
        Self {
            source,
            cache: ExpiringCache::new("public_keys", Arc::clone(&clock)).with_span(span.clone()),
            recent: ExpiringCache::new("key_set_fetches", Arc::clone(&clock))
                .with_span(span.clone()),
            fetch_locks: Mutex::new(HashMap::new()),
            key_ttl: to_chrono(Self::DEFAULT_KEY_TTL),
            refetch_interval: to_chrono(Self::DEFAULT_REFETCH_INTERVAL),
            clock,
            span,
        }
    }

    /// Override how long converted keys are served from cache
    pub fn with_key_ttl(mut self, ttl: Duration) -> Self {
        self.key_ttl = to_chrono(ttl);
        self
    }

    /// Override how long an unknown kid is answered without refetching
    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = to_chrono(interval);
        self
    }

    /// Log under the given span
    pub fn with_span(mut self, span: Span) -> Self {
        self.cache = self.cache.with_span(span.clone());
        self.recent = self.recent.with_span(span.clone());
        self.span = span;
        self
    }

    /// Start evicting expired keys and fetch records every `interval`
    pub fn start_sweeper(&self, interval: Duration) {
        self.cache.start_sweeper(interval);
        self.recent.start_sweeper(interval);
    }

    /// Number of cached keys
    pub fn cached_keys(&self) -> usize {
        self.cache.len()
    }

    /// Resolve a key
    ///
    /// Concurrent misses for one issuer share a single fetch.
    ///
    /// # Errors
    ///
    /// - [`KeyResolutionError::InvalidRequest`] for an empty issuer or kid
    /// - [`KeyResolutionError::NotFound`] when the set has no such kid
    /// - [`KeyResolutionError::UnsupportedKeyType`] when the kid names a key we cannot use
    /// - [`KeyResolutionError::Http`] / [`KeyResolutionError::Malformed`] from the source
    pub async fn get_key(
        &self,
        issuer: &str,
        key_id: &str,
    ) -> Result<Arc<VerificationKey>, KeyResolutionError> {
        if issuer.is_empty() {
            return Err(KeyResolutionError::InvalidRequest("empty issuer".to_string()));
        }
        if key_id.is_empty() {
            return Err(KeyResolutionError::InvalidRequest("empty key id".to_string()));
        }

        if let Some(answer) = self.lookup(issuer, key_id) {
            return answer;
        }

        let lock = self.fetch_lock(issuer);
        let _fetching = lock.lock().await;
        // Whoever held the lock before us may have fetched what we need
        if let Some(answer) = self.lookup(issuer, key_id) {
            return answer;
        }
        self.fetch(issuer, key_id).await
    }

    /// Stop the sweepers
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
        self.recent.shutdown().await;
    }

    fn lookup(
        &self,
        issuer: &str,
        key_id: &str,
    ) -> Option<Result<Arc<VerificationKey>, KeyResolutionError>> {
        let now = self.clock.now();
        if let Some(key) = self.cache.get(&cache_key(issuer, key_id))
            && key.is_valid(now)
        {
            return Some(Ok(key));
        }

        let recent = self.recent.get(issuer).filter(|r| r.is_valid(now))?;
        let error = recent.settled(issuer, key_id)?;
        debug!(parent: &self.span, issuer, key_id, error = %error, "answered from recent key set fetch");
        Some(Err(error))
    }

    fn fetch_lock(&self, issuer: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.fetch_locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(issuer.to_string()).or_default())
    }

    async fn fetch(
        &self,
        issuer: &str,
        key_id: &str,
    ) -> Result<Arc<VerificationKey>, KeyResolutionError> {
        debug!(parent: &self.span, issuer, key_id, "key cache miss, fetching key set");
        let raw_keys = self.source.fetch_key_set(issuer).await?;

        let fetched_at = self.clock.now();
        let expires_at = fetched_at
            .checked_add_signed(self.key_ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut found = None;
        let mut published = HashSet::new();
        let mut rejected = HashMap::new();

        for raw in &raw_keys {
            let Some(kid) = raw.get("kid").and_then(Value::as_str).filter(|k| !k.is_empty())
            else {
                debug!(parent: &self.span, issuer, "skipping key without kid");
                continue;
            };

            match convert(issuer, kid, raw, fetched_at, expires_at) {
                Ok(key) => {
                    let key = Arc::new(key);
                    if let Err(e) = self.cache.put(cache_key(issuer, kid), Arc::clone(&key)) {
                        warn!(parent: &self.span, issuer, kid, error = %e, "failed to cache key");
                    }
                    if kid == key_id {
                        found = Some(key);
                    }
                    published.insert(kid.to_string());
                }
                Err(e) => {
                    debug!(parent: &self.span, issuer, kid, error = %e, "skipping key");
                    rejected.insert(kid.to_string(), e);
                }
            }
        }

        let requested_error = rejected.get(key_id).cloned();
        let recent = RecentFetch {
            expires_at: fetched_at
                .checked_add_signed(self.refetch_interval)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            published,
            rejected,
        };
        if let Err(e) = self.recent.put(issuer, Arc::new(recent)) {
            warn!(parent: &self.span, issuer, error = %e, "failed to record key set fetch");
        }

        match (found, requested_error) {
            (Some(key), _) => Ok(key),
            (None, Some(e)) => Err(e),
            (None, None) => Err(not_found(issuer, key_id)),
        }
    }
}

fn cache_key(issuer: &str, key_id: &str) -> String {
    format!("{issuer}:{key_id}")
}

fn not_found(issuer: &str, key_id: &str) -> KeyResolutionError {
    KeyResolutionError::NotFound {
        issuer: issuer.to_string(),
        key_id: key_id.to_string(),
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn describe(raw: &Value) -> String {
    let kty = raw.get("kty").and_then(Value::as_str).unwrap_or("unknown");
    match raw.get("crv").and_then(Value::as_str) {
        Some(crv) => format!("{kty}/{crv}"),
        None => kty.to_string(),
    }
}

fn convert(
    issuer: &str,
    key_id: &str,
    raw: &Value,
    fetched_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<VerificationKey, KeyResolutionError> {
    let kty = raw.get("kty").and_then(Value::as_str);
    let crv = raw.get("crv").and_then(Value::as_str);
    let (key_type, material) = match (kty, crv) {
        (Some("EC"), Some("P-224")) => {
            let point = uncompressed_point(raw, key_id, 28)?;
            let key = p224::ecdsa::VerifyingKey::from_sec1_bytes(&point)
                .map_err(|_| off_curve(key_id, "P-224"))?;
            (KeyType::Ec(EcCurve::P224), KeyMaterial::P224(key))
        }
        (Some("EC"), Some("P-521")) => {
            let point = uncompressed_point(raw, key_id, 66)?;
            let key = p521::ecdsa::VerifyingKey::from_sec1_bytes(&point)
                .map_err(|_| off_curve(key_id, "P-521"))?;
            (KeyType::Ec(EcCurve::P521), KeyMaterial::P521(key))
        }
        _ => native(key_id, raw)?,
    };

    Ok(VerificationKey {
        issuer: issuer.to_string(),
        key_id: key_id.to_string(),
        key_type,
        fetched_at,
        expires_at,
        material,
    })
}

/// P-256, P-384 and RSA through the JWT library's own JWK support
fn native(key_id: &str, raw: &Value) -> Result<(KeyType, KeyMaterial), KeyResolutionError> {
    // Key types the library does not model fail to deserialize
    let jwk: Jwk = serde_json::from_value(raw.clone())
        .map_err(|_| KeyResolutionError::UnsupportedKeyType(describe(raw)))?;

    let key_type = match &jwk.algorithm {
        AlgorithmParameters::EllipticCurve(params) => match params.curve {
            EllipticCurve::P256 => KeyType::Ec(EcCurve::P256),
            EllipticCurve::P384 => KeyType::Ec(EcCurve::P384),
            _ => return Err(KeyResolutionError::UnsupportedKeyType(describe(raw))),
        },
        AlgorithmParameters::RSA(_) => KeyType::Rsa,
        _ => return Err(KeyResolutionError::UnsupportedKeyType(describe(raw))),
    };

    let decoding_key = DecodingKey::from_jwk(&jwk)
        .map_err(|e| KeyResolutionError::Malformed(format!("key '{key_id}': {e}")))?;
    Ok((key_type, KeyMaterial::Native(decoding_key)))
}

/// SEC1 `04 || x || y` from the JWK coordinates, each exactly `len` bytes
fn uncompressed_point(
    raw: &Value,
    key_id: &str,
    len: usize,
) -> Result<Vec<u8>, KeyResolutionError> {
    let mut point = Vec::with_capacity(1 + 2 * len);
    point.push(0x04);
    for name in ["x", "y"] {
        let encoded = raw.get(name).and_then(Value::as_str).ok_or_else(|| {
            KeyResolutionError::Malformed(format!("key '{key_id}': missing '{name}'"))
        })?;
        let coordinate = URL_SAFE_NO_PAD.decode(encoded).map_err(|e| {
            KeyResolutionError::Malformed(format!("key '{key_id}': '{name}' is not base64url: {e}"))
        })?;
        if coordinate.len() != len {
            return Err(KeyResolutionError::Malformed(format!(
                "key '{key_id}': '{name}' is {} bytes, expected {len}",
                coordinate.len()
            )));
        }
        point.extend_from_slice(&coordinate);
    }
    Ok(point)
}

fn off_curve(key_id: &str, curve: &str) -> KeyResolutionError {
    KeyResolutionError::Malformed(format!("key '{key_id}': not a point on {curve}"))
}
