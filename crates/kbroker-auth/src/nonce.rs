//! One-time nonces binding two token exchanges
//!
//! A client trades its first token for a nonce, then obtains a second token
//! whose audience is that nonce. The nonce is only resolvable until it
//! expires; there is no grace period.
//!
//! Values are 64 characters drawn from `[A-Za-z0-9]` by the thread-local
//! CSPRNG, roughly 381 bits of entropy, so collisions between sessions are
//! not a practical concern.

use crate::error::NonceError;
use chrono::{DateTime, Utc};
use kbroker_core::{Expiring, ExpiringCache, SharedClock};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Span, debug};

/// Length of every nonce value
pub const NONCE_LENGTH: usize = 64;

/// Default nonce lifetime
pub const DEFAULT_NONCE_LIFETIME: Duration = Duration::from_secs(60);

/// A one-time value and its expiry
///
/// Serializes as `{"value": "...", "exp": <unix seconds>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce {
    /// The opaque value, also the lookup key
    pub value: String,
    /// Expiry
    #[serde(rename = "exp", with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

impl Expiring for Nonce {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Mints and looks up nonces
#[derive(Debug)]
pub struct NonceIssuer {
    cache: ExpiringCache<Arc<Nonce>>,
    lifetime: Duration,
    clock: SharedClock,
    span: Span,
}

impl NonceIssuer {
    /// Create an issuer whose nonces live for `lifetime`
    pub fn new(lifetime: Duration, clock: SharedClock) -> Self {
        let span = tracing::info_span!("nonce_issuer");
        Self {
            cache: ExpiringCache::new("nonces", Arc::clone(&clock)).with_span(span.clone()),
            lifetime,
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

    /// Configured nonce lifetime
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Start evicting expired nonces every `interval`
    pub fn start_sweeper(&self, interval: Duration) {
        self.cache.start_sweeper(interval);
    }

    /// Number of stored nonces, expired-but-unswept included
    pub fn cached_nonces(&self) -> usize {
        self.cache.len()
    }

    /// Mint and store a fresh nonce
    pub fn new_nonce(&self) -> Result<Arc<Nonce>, NonceError> {
        let lifetime = chrono::Duration::from_std(self.lifetime).unwrap_or(chrono::Duration::MAX);
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let nonce = Arc::new(Nonce {
            value: random_value(),
            expires_at,
        });

        self.cache.put(nonce.value.clone(), Arc::clone(&nonce))?;
        debug!(parent: &self.span, exp = %nonce.expires_at, "nonce issued");
        Ok(nonce)
    }

    /// Look up a live nonce
    ///
    /// Expiry is checked here as well, so a nonce is unresolvable the moment
    /// it expires even if the sweeper has not run yet. Lookup does not
    /// consume the nonce.
    pub fn get_nonce(&self, value: &str) -> Result<Arc<Nonce>, NonceError> {
        if value.is_empty() {
            return Err(NonceError::NotFound);
        }
        match self.cache.get(value) {
            Some(nonce) if nonce.is_valid(self.clock.now()) => Ok(nonce),
            _ => Err(NonceError::NotFound),
        }
    }

    /// Stop the sweeper
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
    }
}

fn random_value() -> String {
    let rng = rand::rng();
    require_crypto_rng(&rng);
    rng.sample_iter(&Alphanumeric)
        .take(NONCE_LENGTH)
        .map(char::from)
        .collect()
}

// Fails to compile if the thread RNG ever stops being a CSPRNG
fn require_crypto_rng<R: rand::CryptoRng>(_: &R) {}
