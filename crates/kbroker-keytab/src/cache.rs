//! Time-period synchronized keytab cache
//!
//! # Rotation
//!
//! One [`TimePeriod`] drives every principal. At each period boundary `T`
//! the password for each principal is derived from `(seed, principal, T)`
//! and materialized; the resulting keytab expires at `T + lifetime`.
//! Replicas sharing the seed produce identical keytabs for the same period
//! with no coordination.
//!
//! # Scheduling
//!
//! - [`KeytabCache::start`] generates for the current period right away when
//!   the next boundary is more than 30s off, so requests never find an empty
//!   cache for long
//! - A 1s tick watches the next boundary. Within 30s of it, the next period's
//!   keytabs are generated and staged; each slot swaps to its staged keytab
//!   the moment the boundary passes
//! - When a boundary passes with nothing staged (a stalled scheduler, a clock
//!   step), the pass runs late and each principal keeps being served the
//!   previous period's keytab until its replacement lands
//! - Principals whose generation failed are retried every 30s; the derivation
//!   is pure, so retries are idempotent
//!
//! # Locking
//!
//! The principal set is fixed at construction, so the slot map itself is
//! never written. Each slot has its own mutex: a request for one principal
//! never waits on another, and nobody sees a half-updated slot. Generation
//! passes are serialized by an async lock and never hold a slot lock across
//! an await.

use crate::derive::derive_password;
use crate::error::KeytabError;
use crate::materialize::KeytabMaterializer;
use crate::principal::{Principal, validate_principal};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use kbroker_core::{SharedClock, TimePeriod};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

/// Shortest allowed keytab lifetime
pub const MIN_KEYTAB_LIFETIME: Duration = Duration::from_secs(60);

/// Default keytab lifetime
pub const DEFAULT_KEYTAB_LIFETIME: Duration = Duration::from_secs(300);

/// Minimum seed length in bytes
pub const MIN_SEED_LEN: usize = 16;

/// Skip the startup pass when the next boundary is at most this far away
const INITIAL_PASS_THRESHOLD: chrono::Duration = chrono::Duration::seconds(30);

/// How far ahead of a boundary the next period's keytabs are staged
const STAGING_LEAD: chrono::Duration = chrono::Duration::seconds(30);

/// Delay between retries of failed principals
const RETRY_INTERVAL: chrono::Duration = chrono::Duration::seconds(30);

const TICK: Duration = Duration::from_secs(1);

/// Keytab material for one principal and one period
///
/// Serializes as `{"principal", "material", "exp"}` with base64 material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keytab {
    /// Principal the material authenticates
    pub principal: String,
    /// Base64 (standard alphabet) of the materialized blob
    pub material: String,
    /// End of the period the material belongs to
    #[serde(rename = "exp", with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

impl Keytab {
    /// Whether the material is still current at `now`
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl fmt::Debug for Keytab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keytab")
            .field("principal", &self.principal)
            .field("material", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Keytab cache settings
pub struct KeytabCacheConfig {
    /// Secret shared by every replica
    pub seed: SecretString,
    /// Principals keytabs are generated for
    pub principals: Vec<String>,
    /// Period length; also the keytab lifetime
    pub lifetime: Duration,
}

impl fmt::Debug for KeytabCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeytabCacheConfig")
            .field("seed", &"[REDACTED]")
            .field("principals", &self.principals)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// Outcome of a generation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Principals with fresh material
    pub generated: usize,
    /// Principals whose generation failed
    pub failed: usize,
}

struct Failure {
    boundary: DateTime<Utc>,
    reason: String,
    attempted_at: DateTime<Utc>,
}

#[derive(Default)]
struct SlotState {
    /// Newest keytab whose period has begun
    current: Option<Arc<Keytab>>,
    /// Keytab for a period that has not begun yet
    staged: Option<Arc<Keytab>>,
    /// Cleared by a success for the same or a later period
    failure: Option<Failure>,
}

impl SlotState {
    fn promote(&mut self, now: DateTime<Utc>, lifetime: chrono::Duration) {
        if self
            .staged
            .as_ref()
            .is_some_and(|staged| staged.expires_at - lifetime <= now)
        {
            self.current = self.staged.take();
        }
    }

    fn record(
        &mut self,
        boundary: DateTime<Utc>,
        outcome: Result<Arc<Keytab>, String>,
        now: DateTime<Utc>,
    ) {
        match outcome {
            Ok(keytab) if boundary > now => {
                self.staged = Some(keytab);
                self.clear_failure(boundary);
            }
            Ok(keytab) => {
                if self
                    .current
                    .as_ref()
                    .is_none_or(|current| current.expires_at <= keytab.expires_at)
                {
                    self.current = Some(keytab);
                }
                self.clear_failure(boundary);
            }
            Err(reason) => {
                // A failed rotation leaves nothing from older periods behind
                if boundary <= now
                    && self
                        .current
                        .as_ref()
                        .is_some_and(|current| current.expires_at <= boundary)
                {
                    self.current = None;
                }
                self.failure = Some(Failure {
                    boundary,
                    reason,
                    attempted_at: now,
                });
            }
        }
    }

    fn clear_failure(&mut self, boundary: DateTime<Utc>) {
        if self.failure.as_ref().is_some_and(|f| f.boundary <= boundary) {
            self.failure = None;
        }
    }
}

struct Slot {
    state: Mutex<SlotState>,
}

struct Inner {
    seed: SecretString,
    period: TimePeriod,
    lifetime: chrono::Duration,
    slots: HashMap<String, Slot>,
    materializer: Arc<dyn KeytabMaterializer>,
    clock: SharedClock,
    span: Span,
    generation: tokio::sync::Mutex<()>,
}

struct Scheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-principal keytabs, rotated on synchronized period boundaries
pub struct KeytabCache {
    inner: Arc<Inner>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl fmt::Debug for KeytabCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeytabCache")
            .field("principals", &self.inner.slots.len())
            .field("period", &self.inner.period)
            .field("materializer", &self.inner.materializer.name())
            .field("running", &self.scheduler.lock().is_some())
            .finish()
    }
}

impl KeytabCache {
    /// Create a cache with every principal pending
    ///
    /// # Errors
    ///
    /// [`KeytabError::Config`] for a short seed, an empty principal list or a
    /// lifetime under a minute or with a sub-second part;
    /// [`KeytabError::InvalidPrincipal`] for a malformed principal.
    pub fn new(
        config: KeytabCacheConfig,
        materializer: Arc<dyn KeytabMaterializer>,
        clock: SharedClock,
    ) -> Result<Self, KeytabError> {
        if config.seed.expose_secret().len() < MIN_SEED_LEN {
            return Err(KeytabError::Config(format!(
                "seed must be at least {MIN_SEED_LEN} bytes"
            )));
        }
        if config.principals.is_empty() {
            return Err(KeytabError::Config("no principals configured".to_string()));
        }
        if config.lifetime < MIN_KEYTAB_LIFETIME {
            return Err(KeytabError::Config(format!(
                "keytab lifetime {:?} is below {:?}",
                config.lifetime, MIN_KEYTAB_LIFETIME
            )));
        }
        let period =
            TimePeriod::new(config.lifetime).map_err(|e| KeytabError::Config(e.to_string()))?;

        let principals = config
            .principals
            .into_iter()
            .map(Principal::new)
            .collect::<Result<BTreeSet<_>, _>>()?;
        let slots = principals
            .into_iter()
            .map(|p| {
                let slot = Slot {
                    state: Mutex::new(SlotState::default()),
                };
                (String::from(p), slot)
            })
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                seed: config.seed,
                period,
                lifetime: chrono::Duration::seconds(config.lifetime.as_secs() as i64),
                slots,
                materializer,
                clock,
                span: tracing::info_span!("keytab_cache"),
                generation: tokio::sync::Mutex::new(()),
            }),
            scheduler: Mutex::new(None),
        })
    }

    /// Log under the given span
    ///
    /// Only effective before [`KeytabCache::start`].
    pub fn with_span(mut self, span: Span) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.span = span;
        }
        self
    }

    /// Configured principals, sorted
    pub fn principals(&self) -> Vec<&str> {
        let mut principals: Vec<&str> = self.inner.slots.keys().map(String::as_str).collect();
        principals.sort_unstable();
        principals
    }

    /// The rotation period
    pub fn period(&self) -> TimePeriod {
        self.inner.period
    }

    /// Run the startup pass if due, then start the rotation scheduler
    ///
    /// Must be called from within a tokio runtime. Calling it again while
    /// running does nothing.
    pub async fn start(&self) {
        let running = self.scheduler.lock().is_some();
        if running {
            return;
        }

        let now = self.inner.clock.now();
        let next = self.inner.period.next(now);
        if next - now > INITIAL_PASS_THRESHOLD {
            let boundary = self.inner.period.period_start(now);
            self.inner.refresh(boundary).await;
        } else {
            info!(parent: &self.inner.span, next = %next, "boundary imminent, skipping startup pass");
        }

        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            run_scheduler(Arc::clone(&self.inner), next, cancel.clone())
                .instrument(self.inner.span.clone()),
        );
        *scheduler = Some(Scheduler { cancel, handle });
    }

    /// Regenerate every principal for the period starting at `boundary`
    pub async fn refresh(&self, boundary: DateTime<Utc>) -> RefreshSummary {
        self.inner.refresh(boundary).await
    }

    /// Current keytab for `principal`
    ///
    /// # Errors
    ///
    /// - [`KeytabError::InvalidPrincipal`] for an empty or malformed name
    /// - [`KeytabError::NotFound`] for a principal that is not configured
    /// Right after a boundary, while the new period's keytab is still being
    /// generated, the previous period's keytab is returned; its `expires_at`
    /// is then already past.
    ///
    /// - [`KeytabError::NotReady`] before the first generation, or when the
    ///   newest material is more than one period old
    /// - [`KeytabError::GenerationFailed`] after a failed generation
    pub fn get(&self, principal: &str) -> Result<Arc<Keytab>, KeytabError> {
        validate_principal(principal)?;
        let slot = self
            .inner
            .slots
            .get(principal)
            .ok_or_else(|| KeytabError::NotFound(principal.to_string()))?;

        let now = self.inner.clock.now();
        let period_start = self.inner.period.period_start(now);
        let mut state = slot.state.lock();
        state.promote(now, self.inner.lifetime);

        if let Some(keytab) = &state.current {
            if keytab.is_valid(now) {
                return Ok(Arc::clone(keytab));
            }
            let rotation_failed = state
                .failure
                .as_ref()
                .is_some_and(|f| f.boundary >= period_start);
            if keytab.expires_at == period_start && !rotation_failed {
                debug!(parent: &self.inner.span, principal, "rotation pending, serving previous keytab");
                return Ok(Arc::clone(keytab));
            }
        }

        match &state.failure {
            Some(failure) => Err(KeytabError::GenerationFailed {
                principal: principal.to_string(),
                reason: failure.reason.clone(),
            }),
            None => Err(KeytabError::NotReady(principal.to_string())),
        }
    }

    /// Whether the rotation scheduler is running
    pub fn is_running(&self) -> bool {
        self.scheduler.lock().is_some()
    }

    /// Stop the scheduler and wait for it to exit
    ///
    /// A generation pass in progress is allowed to finish. Safe to call
    /// repeatedly.
    pub async fn shutdown(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(Scheduler { cancel, handle }) = scheduler {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(parent: &self.inner.span, error = %e, "scheduler task ended abnormally");
            }
            debug!(parent: &self.inner.span, "keytab scheduler stopped");
        }
    }
}

impl Drop for KeytabCache {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.get_mut().as_ref() {
            scheduler.cancel.cancel();
        }
    }
}

impl Inner {
    async fn refresh(&self, boundary: DateTime<Utc>) -> RefreshSummary {
        let principals: Vec<&str> = self.slots.keys().map(String::as_str).collect();
        let summary = self.generate(&principals, boundary).await;
        info!(
            parent: &self.span,
            boundary = %boundary,
            staged = boundary > self.clock.now(),
            generated = summary.generated,
            failed = summary.failed,
            "keytab generation pass finished"
        );
        summary
    }

    fn promote_all(&self, now: DateTime<Utc>) {
        for slot in self.slots.values() {
            slot.state.lock().promote(now, self.lifetime);
        }
    }

    async fn retry_failed(&self, now: DateTime<Utc>) {
        let period_start = self.period.period_start(now);
        let mut due: BTreeMap<DateTime<Utc>, Vec<&str>> = BTreeMap::new();
        for (principal, slot) in &self.slots {
            let state = slot.state.lock();
            if let Some(failure) = &state.failure
                && now - failure.attempted_at >= RETRY_INTERVAL
            {
                due.entry(failure.boundary.max(period_start))
                    .or_default()
                    .push(principal.as_str());
            }
        }

        for (boundary, principals) in due {
            let summary = self.generate(&principals, boundary).await;
            info!(
                parent: &self.span,
                boundary = %boundary,
                retried = principals.len(),
                recovered = summary.generated,
                "retried failed keytab generation"
            );
        }
    }

    async fn generate(&self, principals: &[&str], boundary: DateTime<Utc>) -> RefreshSummary {
        let _pass = self.generation.lock().await;
        let expires_at = boundary + self.lifetime;

        let outcomes = join_all(principals.iter().map(|principal| async move {
            let password = derive_password(&self.seed, principal, boundary);
            let result = self.materializer.materialize(principal, &password).await;
            (*principal, result)
        }))
        .await;

        let now = self.clock.now();
        let mut summary = RefreshSummary::default();
        for (principal, result) in outcomes {
            let Some(slot) = self.slots.get(principal) else {
                continue;
            };
            let outcome = match result {
                Ok(blob) => {
                    summary.generated += 1;
                    Ok(Arc::new(Keytab {
                        principal: principal.to_string(),
                        material: STANDARD.encode(blob),
                        expires_at,
                    }))
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        parent: &self.span,
                        principal,
                        boundary = %boundary,
                        category = e.category(),
                        error = %e,
                        "keytab generation failed"
                    );
                    Err(e.to_string())
                }
            };
            slot.state.lock().record(boundary, outcome, now);
        }
        summary
    }
}

async fn run_scheduler(inner: Arc<Inner>, mut next: DateTime<Utc>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut staged_for: Option<DateTime<Utc>> = None;
    debug!(next = %next, "keytab scheduler started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = inner.clock.now();
                if now >= next {
                    let boundary = inner.period.period_start(now);
                    if staged_for == Some(boundary) {
                        inner.promote_all(now);
                        debug!(boundary = %boundary, "staged keytabs took over");
                    } else {
                        warn!(boundary = %boundary, "boundary passed with nothing staged, rotating late");
                        inner.refresh(boundary).await;
                    }
                    next = inner.period.next(now);
                } else if next - now <= STAGING_LEAD && staged_for != Some(next) {
                    inner.refresh(next).await;
                    staged_for = Some(next);
                } else {
                    inner.retry_failed(now).await;
                }
            }
        }
    }
}
