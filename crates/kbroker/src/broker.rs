//! The broker facade
//!
//! ```text
//!  token A ──► TokenVerifier ──► PolicyDecisionPoint ──► NonceIssuer ──► nonce
//!
//!  token B ──► TokenVerifier ──► NonceIssuer (aud is a live nonce?)
//!   (aud = nonce)            └─► PolicyDecisionPoint (principal authorized?)
//!                            └─► KeytabCache ──► keytab
//! ```
//!
//! Every denial on the authentication path surfaces as
//! [`BrokerError::AuthFail`]; the specific cause is logged at `info` under the
//! broker span.

use crate::config::BrokerConfig;
use crate::error::{BrokerError, ConfigError};
use kbroker_auth::{
    HttpConfig, JwksSource, Nonce, NonceIssuer, OidcDiscoverySource, PublicKeyResolver, Token,
    TokenError, TokenVerifier, VerifierConfig,
};
use kbroker_core::{SharedClock, system_clock};
use kbroker_keytab::{
    Keytab, KeytabCache, KeytabCacheConfig, KeytabError, KeytabMaterializer, detect_materializer,
    validate_principal,
};
use kbroker_policy::{PolicyDecision, PolicyDecisionPoint, QueryBindings};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, error, info, warn};

/// Assembles a [`Broker`], with seams for the JWKS source, materializer and
/// clock
pub struct BrokerBuilder {
    config: BrokerConfig,
    jwks_source: Option<Arc<dyn JwksSource>>,
    materializer: Option<Arc<dyn KeytabMaterializer>>,
    clock: SharedClock,
    span: Span,
}

impl fmt::Debug for BrokerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerBuilder")
            .field("config", &self.config)
            .field("jwks_source", &self.jwks_source)
            .field("materializer", &self.materializer.as_ref().map(|m| m.name()))
            .finish_non_exhaustive()
    }
}

impl BrokerBuilder {
    /// Start from `config`; discovery over HTTPS, detected materializer,
    /// system clock
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            jwks_source: None,
            materializer: None,
            clock: system_clock(),
            span: tracing::info_span!("kbroker"),
        }
    }

    /// Fetch issuer keys from `source` instead of OIDC discovery
    pub fn jwks_source(mut self, source: Arc<dyn JwksSource>) -> Self {
        self.jwks_source = Some(source);
        self
    }

    /// Materialize keytabs with `materializer` instead of the detected one
    pub fn materializer(mut self, materializer: Arc<dyn KeytabMaterializer>) -> Self {
        self.materializer = Some(materializer);
        self
    }

    /// Read time from `clock`
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Parent span for every component's logs
    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Build every component, start background tasks and generate the
    /// first keytabs
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the configuration is out of range, the policy
    /// does not compile, the HTTP client cannot be built, or the
    /// materializer cannot be set up.
    pub async fn start(self) -> Result<Broker, ConfigError> {
        let BrokerBuilder {
            config,
            jwks_source,
            materializer,
            clock,
            span,
        } = self;
        config.validate()?;

        let child = |name: &'static str| tracing::info_span!(parent: &span, "component", component = name);

        let source: Arc<dyn JwksSource> = match jwks_source {
            Some(source) => source,
            None => Arc::new(OidcDiscoverySource::new(&HttpConfig {
                request_timeout: Duration::from_secs(config.http.request_timeout_secs),
                max_idle_per_host: config.http.max_idle_per_host,
                allow_http: config.allow_insecure_issuer,
            })?),
        };
        let resolver = Arc::new(
            PublicKeyResolver::new(source, Arc::clone(&clock))
                .with_key_ttl(Duration::from_secs(config.key_cache_ttl_secs))
                .with_span(child("public_key_resolver")),
        );
        let verifier = TokenVerifier::new(
            Arc::clone(&resolver),
            VerifierConfig {
                allow_insecure_issuer: config.allow_insecure_issuer,
            },
            Arc::clone(&clock),
        )
        .with_span(child("token_verifier"));

        let nonces = NonceIssuer::new(config.nonce_lifetime(), Arc::clone(&clock))
            .with_span(child("nonce_issuer"));

        let policy = PolicyDecisionPoint::build_with_bindings(
            &config.policy.script,
            &config.policy.query,
            QueryBindings {
                grant: config.policy.grant_binding.clone(),
                principals: config.policy.principals_binding.clone(),
            },
        )?
        .with_span(child("policy_decision_point"));

        let materializer = match materializer {
            Some(materializer) => materializer,
            None => detect_materializer(&config.materializer)?,
        };
        let keytabs = KeytabCache::new(
            KeytabCacheConfig {
                seed: config.seed.clone(),
                principals: config.principals.clone(),
                lifetime: config.keytab_lifetime(),
            },
            materializer,
            Arc::clone(&clock),
        )?
        .with_span(child("keytab_cache"));

        resolver.start_sweeper(Duration::from_secs(config.key_sweep_interval_secs));
        verifier.start_sweeper(Duration::from_secs(config.token_sweep_interval_secs));
        nonces.start_sweeper(Duration::from_secs(config.nonce_sweep_interval_secs));
        keytabs.start().await;

        info!(
            parent: &span,
            principals = config.principals.len(),
            keytab_lifetime_secs = config.keytab_lifetime_secs,
            nonce_lifetime_secs = config.nonce_lifetime_secs,
            "broker started"
        );

        Ok(Broker {
            verifier,
            nonces,
            policy,
            keytabs,
            span,
            stopped: AtomicBool::new(false),
        })
    }
}

/// Exchanges verified bearer tokens for nonces and keytabs
pub struct Broker {
    verifier: TokenVerifier,
    nonces: NonceIssuer,
    policy: PolicyDecisionPoint,
    keytabs: KeytabCache,
    span: Span,
    stopped: AtomicBool,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("verifier", &self.verifier)
            .field("nonces", &self.nonces)
            .field("policy", &self.policy)
            .field("keytabs", &self.keytabs)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl Broker {
    /// Start a broker with production collaborators
    ///
    /// # Errors
    ///
    /// See [`BrokerBuilder::start`].
    pub async fn start(config: BrokerConfig) -> Result<Self, ConfigError> {
        BrokerBuilder::new(config).start().await
    }

    /// Assemble a broker with custom collaborators
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// Mint a nonce for the holder of `token`
    ///
    /// # Errors
    ///
    /// - [`BrokerError::DataValidation`] for an empty or malformed token
    /// - [`BrokerError::AuthFail`] when the token does not verify or the
    ///   policy withholds the grant
    /// - [`BrokerError::SystemFault`] when keys cannot be resolved or the
    ///   policy misbehaves
    /// - [`BrokerError::Cancelled`] when `cancel` fires first
    pub async fn issue_nonce(
        &self,
        cancel: &CancellationToken,
        token: &str,
    ) -> Result<Arc<Nonce>, BrokerError> {
        let token = self.verify(cancel, token).await?;
        let decision = self.decide(&token)?;
        if !decision.grant_nonce {
            info!(parent: &self.span, issuer = %token.issuer, reason = "policy_denied_nonce", "auth failed");
            return Err(BrokerError::AuthFail);
        }

        let nonce = self.nonces.new_nonce().map_err(|e| {
            error!(parent: &self.span, category = e.category(), error = %e, "nonce issuance failed");
            BrokerError::SystemFault
        })?;
        debug!(parent: &self.span, issuer = %token.issuer, "nonce issued");
        Ok(nonce)
    }

    /// Hand the current keytab for `principal` to the holder of `token`
    ///
    /// `token` must carry a live nonce from [`Broker::issue_nonce`] among its
    /// audiences, and the policy must authorize `principal` for it.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::DataValidation`] for an empty or malformed token or
    ///   principal
    /// - [`BrokerError::AuthFail`] when the token does not verify, carries no
    ///   live nonce, or is not authorized for `principal`
    /// - [`BrokerError::NotFound`] when `principal` is not served here
    /// - [`BrokerError::SystemFault`] when keys cannot be resolved, the
    ///   policy misbehaves, or the keytab is unavailable
    /// - [`BrokerError::Cancelled`] when `cancel` fires first
    pub async fn issue_credential(
        &self,
        cancel: &CancellationToken,
        token: &str,
        principal: &str,
    ) -> Result<Arc<Keytab>, BrokerError> {
        validate_principal(principal).map_err(|e| BrokerError::DataValidation(e.to_string()))?;
        let token = self.verify(cancel, token).await?;

        if !token.audience.iter().any(|aud| self.nonces.get_nonce(aud).is_ok()) {
            info!(parent: &self.span, issuer = %token.issuer, reason = "no_live_nonce", "auth failed");
            return Err(BrokerError::AuthFail);
        }

        let decision = self.decide(&token)?;
        if !decision.has_principal(principal) {
            info!(
                parent: &self.span,
                issuer = %token.issuer,
                principal,
                reason = "principal_not_authorized",
                "auth failed"
            );
            return Err(BrokerError::AuthFail);
        }

        self.keytabs.get(principal).map_err(|e| match e {
            KeytabError::InvalidPrincipal(e) => BrokerError::DataValidation(e.to_string()),
            KeytabError::NotFound(principal) => BrokerError::NotFound(principal),
            e => {
                error!(parent: &self.span, principal, category = e.category(), error = %e, "keytab unavailable");
                BrokerError::SystemFault
            }
        })
    }

    /// The keytab cache, for readiness checks and diagnostics
    pub fn keytabs(&self) -> &KeytabCache {
        &self.keytabs
    }

    /// Stop every background task and wait for them to exit
    ///
    /// Safe to call repeatedly; only the first call does any work.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.keytabs.shutdown().await;
        self.nonces.shutdown().await;
        self.verifier.shutdown().await;
        self.verifier.resolver().shutdown().await;
        info!(parent: &self.span, "broker stopped");
    }

    async fn verify(&self, cancel: &CancellationToken, raw: &str) -> Result<Arc<Token>, BrokerError> {
        if raw.is_empty() {
            return Err(BrokerError::DataValidation("empty token".to_string()));
        }

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(parent: &self.span, "verification cancelled");
                return Err(BrokerError::Cancelled);
            }
            result = self.verifier.verify(raw) => result,
        };

        result.map_err(|e| self.token_failure(&e))
    }

    fn token_failure(&self, e: &TokenError) -> BrokerError {
        if e.is_system_fault() {
            error!(parent: &self.span, category = e.category(), error = %e, "key resolution failed");
            return BrokerError::SystemFault;
        }
        match e {
            TokenError::Invalid(_) | TokenError::MissingField(_) => {
                info!(parent: &self.span, category = e.category(), error = %e, "malformed token");
                BrokerError::DataValidation("malformed token".to_string())
            }
            _ => {
                info!(parent: &self.span, category = e.category(), error = %e, "auth failed");
                BrokerError::AuthFail
            }
        }
    }

    fn decide(&self, token: &Token) -> Result<PolicyDecision, BrokerError> {
        self.policy.render_decision(&token.claims_json()).map_err(|e| {
            error!(parent: &self.span, category = e.category(), error = %e, "policy evaluation failed");
            BrokerError::SystemFault
        })
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::Relaxed) {
            warn!(parent: &self.span, "broker dropped without shutdown");
        }
    }
}
