//! Bearer token verification with a cache keyed by the raw token
//!
//! # Verification order
//!
//! 1. Empty input is [`TokenError::Invalid`]
//! 2. Cache hit: served while unexpired, [`TokenError::Expired`] afterwards
//! 3. Unverified parse of header and payload; `alg`, `kid`, `typ`, `iss`
//!    and `exp` must be present
//! 4. `iss` must be an `https` URL unless insecure issuers are allowed,
//!    otherwise [`TokenError::IssuerRejected`]
//! 5. Key resolution, then an algorithm check against the key type; EC keys
//!    take only their curve's algorithm
//! 6. Signature check; time-based failures from the JWT library are ignored
//!    here and decided by step 7 against our own clock. ES224 and ES512 are
//!    checked with the RustCrypto curve crates, which never look at claims
//! 7. Expiry check, then cache and return

use super::Token;
use super::algorithm::JwsAlgorithm;
use super::resolver::{KeyMaterial, PublicKeyResolver, VerificationKey};
use crate::error::TokenError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::DateTime;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::Validation;
use kbroker_core::{Expiring, ExpiringCache, SharedClock};
use serde_json::{Map, Value};
use signature::Verifier;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Span, debug};
use url::Url;

/// Verifier settings
#[derive(Debug, Clone, Default)]
pub struct VerifierConfig {
    /// Accept `http://` issuers (local development only)
    pub allow_insecure_issuer: bool,
}

/// Caching bearer token verifier
pub struct TokenVerifier {
    resolver: Arc<PublicKeyResolver>,
    cache: ExpiringCache<Arc<Token>>,
    config: VerifierConfig,
    clock: SharedClock,
    span: Span,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Create a verifier resolving keys through `resolver`
    pub fn new(resolver: Arc<PublicKeyResolver>, config: VerifierConfig, clock: SharedClock) -> Self {
        let span = tracing::info_span!("token_verifier");
        Self {
            resolver,
            cache: ExpiringCache::new("tokens", Arc::clone(&clock)).with_span(span.clone()),
            config,
            clock,
            span,
        }
    }

    /// Log under the given span
    pub fn with_span(mut self, span: Span) -> Self {
        self.cache = self.cache.with_span(span.clone());
        self.span = span;
        self
    }

    /// The key resolver in use
    pub fn resolver(&self) -> &Arc<PublicKeyResolver> {
        &self.resolver
    }

    /// Start evicting expired tokens every `interval`
    pub fn start_sweeper(&self, interval: Duration) {
        self.cache.start_sweeper(interval);
    }

    /// Number of cached tokens, expired-but-unswept included
    pub fn cached_tokens(&self) -> usize {
        self.cache.len()
    }

    /// Verify a compact JWT
    ///
    /// Dropping the returned future abandons any in-flight key fetch without
    /// touching the cache.
    pub async fn verify(&self, raw: &str) -> Result<Arc<Token>, TokenError> {
        if raw.is_empty() {
            return Err(TokenError::Invalid("empty token".to_string()));
        }

        if let Some(token) = self.cache.get(raw) {
            return if token.is_valid(self.clock.now()) {
                Ok(token)
            } else {
                Err(TokenError::Expired)
            };
        }

        let unverified = Unverified::parse(raw)?;
        self.check_issuer(&unverified.issuer)?;

        let key = self
            .resolver
            .get_key(&unverified.issuer, &unverified.key_id)
            .await?;

        let alg = JwsAlgorithm::from_name(&unverified.alg)
            .filter(|alg| key.key_type.accepts(*alg))
            .ok_or_else(|| {
                TokenError::SignatureInvalid(format!(
                    "algorithm {} cannot be used with {} key '{}'",
                    unverified.alg, key.key_type, key.key_id
                ))
            })?;
        check_signature(raw, &key, alg, &self.span)?;

        let token = Arc::new(unverified.into_token(alg)?);
        if !token.is_valid(self.clock.now()) {
            debug!(parent: &self.span, issuer = %token.issuer, "rejecting expired token");
            return Err(TokenError::Expired);
        }

        self.cache
            .put(raw, Arc::clone(&token))
            .map_err(|e| TokenError::Invalid(e.to_string()))?;
        debug!(parent: &self.span, issuer = %token.issuer, kid = %token.key_id, "token verified");
        Ok(token)
    }

    /// Stop the sweeper
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
    }

    fn check_issuer(&self, issuer: &str) -> Result<(), TokenError> {
        let url = Url::parse(issuer)
            .map_err(|e| TokenError::IssuerRejected(format!("'{issuer}' is not a URL: {e}")))?;
        match url.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_insecure_issuer => Ok(()),
            scheme => Err(TokenError::IssuerRejected(format!(
                "issuer scheme '{scheme}' not allowed"
            ))),
        }
    }
}

/// Header and claims before any signature check
struct Unverified {
    alg: String,
    key_id: String,
    token_type: String,
    issuer: String,
    exp: i64,
    claims: Map<String, Value>,
}

impl Unverified {
    fn parse(raw: &str) -> Result<Self, TokenError> {
        let mut segments = raw.split('.');
        let (Some(header_b64), Some(payload_b64), Some(_), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(TokenError::Invalid("expected three segments".to_string()));
        };

        let header = decode_object(header_b64, "header")?;
        let claims = decode_object(payload_b64, "payload")?;

        let alg = header_field(&header, "alg")?;
        let key_id = header_field(&header, "kid")?;
        let token_type = header_field(&header, "typ")?;
        let issuer = claims
            .get("iss")
            .and_then(Value::as_str)
            .filter(|i| !i.is_empty())
            .ok_or(TokenError::MissingField("iss"))?
            .to_string();
        let exp = claims
            .get("exp")
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .ok_or(TokenError::MissingField("exp"))?;

        Ok(Self {
            alg,
            key_id,
            token_type,
            issuer,
            exp,
            claims,
        })
    }

    fn into_token(self, algorithm: JwsAlgorithm) -> Result<Token, TokenError> {
        let expiry = DateTime::from_timestamp(self.exp, 0)
            .ok_or_else(|| TokenError::Invalid(format!("exp {} out of range", self.exp)))?;

        let audience = match self.claims.get("aud") {
            Some(Value::String(aud)) => vec![aud.clone()],
            Some(Value::Array(auds)) => auds
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        let subject = self
            .claims
            .get("sub")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Token {
            issuer: self.issuer,
            key_id: self.key_id,
            algorithm,
            token_type: self.token_type,
            expiry,
            audience,
            subject,
            claims: self.claims,
        })
    }
}

fn header_field(header: &Map<String, Value>, name: &'static str) -> Result<String, TokenError> {
    match header.get(name) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
        Some(Value::String(_)) | None => Err(TokenError::MissingField(name)),
        Some(_) => Err(TokenError::Invalid(format!("header '{name}' is not a string"))),
    }
}

fn decode_object(segment: &str, what: &str) -> Result<Map<String, Value>, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| TokenError::Invalid(format!("{what} is not base64url: {e}")))?;
    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(TokenError::Invalid(format!("{what} is not a JSON object"))),
        Err(e) => Err(TokenError::Invalid(format!("{what} is not JSON: {e}"))),
    }
}

fn check_signature(
    raw: &str,
    key: &VerificationKey,
    alg: JwsAlgorithm,
    span: &Span,
) -> Result<(), TokenError> {
    match key.material() {
        KeyMaterial::Native(decoding_key) => {
            let native = alg.native().ok_or_else(|| {
                TokenError::SignatureInvalid(format!("no native verifier for {alg}"))
            })?;
            let mut validation = Validation::new(native);
            validation.validate_aud = false;
            validation.required_spec_claims.clear();
            validation.leeway = 0;

            match jsonwebtoken::decode::<Value>(raw, decoding_key, &validation) {
                Ok(_) => Ok(()),
                Err(e) => match e.kind() {
                    // The signature itself checked out; expiry is decided against our clock
                    ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => {
                        debug!(parent: span, reason = %e, "deferring time-based rejection");
                        Ok(())
                    }
                    _ => Err(TokenError::SignatureInvalid(e.to_string())),
                },
            }
        }
        KeyMaterial::P224(verifying_key) => {
            check_ecdsa::<p224::ecdsa::Signature, _>(raw, verifying_key)
        }
        KeyMaterial::P521(verifying_key) => {
            check_ecdsa::<p521::ecdsa::Signature, _>(raw, verifying_key)
        }
    }
}

/// Check the fixed-width `r || s` signature over `header.payload`
fn check_ecdsa<S, K>(raw: &str, key: &K) -> Result<(), TokenError>
where
    S: for<'a> TryFrom<&'a [u8], Error = signature::Error>,
    K: Verifier<S>,
{
    let (signing_input, encoded) = raw
        .rsplit_once('.')
        .ok_or_else(|| TokenError::Invalid("expected three segments".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| TokenError::SignatureInvalid(format!("signature is not base64url: {e}")))?;
    let signature = S::try_from(bytes.as_slice())
        .map_err(|_| TokenError::SignatureInvalid(format!("{}-byte signature", bytes.len())))?;
    key.verify(signing_input.as_bytes(), &signature)
        .map_err(|_| TokenError::SignatureInvalid("ECDSA verification failed".to_string()))
}
