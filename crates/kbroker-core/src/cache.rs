//! Generic TTL-swept cache
//!
//! [`ExpiringCache`] is the single cache implementation behind the token,
//! nonce and public-key caches. Entities decide their own validity through
//! the [`Expiring`] trait; a background sweeper periodically evicts the
//! invalid ones.
//!
//! # Locking
//!
//! - `get` takes the read lock and never mutates
//! - `put` and the sweep take the write lock
//! - The sweeper is a single tokio task stopped by [`ExpiringCache::shutdown`]

use crate::clock::SharedClock;
use crate::error::CacheError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

/// Something with a validity predicate
pub trait Expiring {
    /// Whether the entity is still valid at `now`
    fn is_valid(&self, now: DateTime<Utc>) -> bool;

    /// Whether the entity carries no meaningful content and must not be stored
    fn is_empty(&self) -> bool {
        false
    }
}

impl<T: Expiring + ?Sized> Expiring for Arc<T> {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        (**self).is_valid(now)
    }

    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }
}

/// Background sweep task handle
struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Thread-safe key/value store whose entries are evicted once invalid
///
/// Store `Arc<T>` values to hand out cheap immutable snapshots.
///
/// # Example
///
/// ```rust
/// use chrono::{DateTime, Utc};
/// use kbroker_core::{Expiring, ExpiringCache, system_clock};
/// use std::sync::Arc;
///
/// #[derive(Debug)]
/// struct Lease(DateTime<Utc>);
///
/// impl Expiring for Lease {
///     fn is_valid(&self, now: DateTime<Utc>) -> bool {
///         now < self.0
///     }
/// }
///
/// let cache: ExpiringCache<Arc<Lease>> = ExpiringCache::new("leases", system_clock());
/// cache.put("a", Arc::new(Lease(Utc::now()))).unwrap();
/// assert!(cache.get("a").is_some());
/// assert_eq!(cache.sweep(), 1);
/// ```
pub struct ExpiringCache<V> {
    name: &'static str,
    entries: Arc<RwLock<HashMap<String, V>>>,
    clock: SharedClock,
    span: Span,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<V> fmt::Debug for ExpiringCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("name", &self.name)
            .field("entries", &self.entries.read().len())
            .field("sweeping", &self.sweeper.lock().is_some())
            .finish()
    }
}

impl<V> ExpiringCache<V>
where
    V: Expiring + Clone + Send + Sync + 'static,
{
    /// Create an empty cache without a running sweeper
    pub fn new(name: &'static str, clock: SharedClock) -> Self {
        Self {
            name,
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
            span: tracing::info_span!("expiring_cache", cache = name),
            sweeper: Mutex::new(None),
        }
    }

    /// Log under the given span instead of the default one
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Start the background sweeper
    ///
    /// Must be called from within a tokio runtime. Calling it while a sweeper
    /// is already running does nothing.
    pub fn start_sweeper(&self, interval: Duration) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let entries = Arc::clone(&self.entries);
        let clock = Arc::clone(&self.clock);
        let name = self.name;

        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately
                ticker.tick().await;

                loop {
                    tokio::select! {
                        () = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            evict(name, &entries, clock.now());
                        }
                    }
                }
                debug!("sweeper stopped");
            }
            .instrument(self.span.clone()),
        );

        debug!(parent: &self.span, interval_secs = interval.as_secs(), "sweeper started");
        *sweeper = Some(Sweeper { cancel, handle });
    }

    /// Insert or replace an entity
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::EmptyKey`] for an empty key and
    /// [`CacheError::EmptyEntity`] for an entity reporting itself empty.
    pub fn put(&self, key: impl Into<String>, entity: V) -> Result<(), CacheError> {
        let key = key.into();
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        if entity.is_empty() {
            return Err(CacheError::EmptyEntity(key));
        }

        self.entries.write().insert(key, entity);
        Ok(())
    }

    /// Look up an entity
    ///
    /// Invalid-but-not-yet-swept entities are still returned; callers decide
    /// what an elapsed entity means for them.
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Evict every invalid entity now, returning how many were removed
    pub fn sweep(&self) -> usize {
        evict(self.name, &self.entries, self.clock.now())
    }

    /// Number of stored entities, valid or not
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entities
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Whether a background sweeper is running
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Stop the sweeper and wait for it to exit
    ///
    /// Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(Sweeper { cancel, handle }) = sweeper {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(parent: &self.span, error = %e, "sweeper task ended abnormally");
            }
        }
    }
}

impl<V> Drop for ExpiringCache<V> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().as_ref() {
            sweeper.cancel.cancel();
        }
    }
}

fn evict<V: Expiring>(
    name: &'static str,
    entries: &RwLock<HashMap<String, V>>,
    now: DateTime<Utc>,
) -> usize {
    let mut entries = entries.write();
    let before = entries.len();
    entries.retain(|_, entity| entity.is_valid(now));
    let evicted = before - entries.len();

    if evicted > 0 {
        info!(cache = name, evicted, remaining = entries.len(), "evicted expired entries");
    } else {
        debug!(cache = name, remaining = entries.len(), "sweep found nothing to evict");
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[derive(Debug, Clone, PartialEq)]
    struct Lease {
        label: String,
        expires_at: DateTime<Utc>,
    }

    impl Expiring for Lease {
        fn is_valid(&self, now: DateTime<Utc>) -> bool {
            now < self.expires_at
        }

        fn is_empty(&self) -> bool {
            self.label.is_empty()
        }
    }

    fn lease(label: &str, clock: &ManualClock, ttl_secs: i64) -> Arc<Lease> {
        Arc::new(Lease {
            label: label.to_string(),
            expires_at: clock.now() + chrono::Duration::seconds(ttl_secs),
        })
    }

    #[test]
    fn test_put_and_get() {
        let clock = ManualClock::at_timestamp(1_000);
        let cache = ExpiringCache::new("test", clock.clone());

        cache.put("a", lease("a", &clock, 10)).unwrap();
        assert_eq!(cache.get("a").unwrap().label, "a");
        assert!(cache.get("b").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_rejects_empty_key_and_entity() {
        let clock = ManualClock::at_timestamp(1_000);
        let cache = ExpiringCache::new("test", clock.clone());

        assert_eq!(
            cache.put("", lease("a", &clock, 10)),
            Err(CacheError::EmptyKey)
        );
        assert_eq!(
            cache.put("k", lease("", &clock, 10)),
            Err(CacheError::EmptyEntity("k".to_string()))
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_returns_unswept_expired_entity() {
        let clock = ManualClock::at_timestamp(1_000);
        let cache = ExpiringCache::new("test", clock.clone());
        cache.put("a", lease("a", &clock, 5)).unwrap();

        clock.advance(Duration::from_secs(6));
        let entity = cache.get("a").unwrap();
        assert!(!entity.is_valid(clock.now()));
    }

    #[test]
    fn test_manual_sweep_evicts_only_invalid() {
        let clock = ManualClock::at_timestamp(1_000);
        let cache = ExpiringCache::new("test", clock.clone());
        cache.put("short", lease("short", &clock, 5)).unwrap();
        cache.put("long", lease("long", &clock, 500)).unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.sweep(), 1);
        assert!(cache.get("short").is_none());
        assert!(cache.get("long").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_evicts() {
        let clock = ManualClock::at_timestamp(1_000);
        let cache = ExpiringCache::new("test", clock.clone());
        cache.start_sweeper(Duration::from_secs(15));
        cache.put("a", lease("a", &clock, 5)).unwrap();

        clock.advance(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(16)).await;

        assert!(cache.is_empty());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let clock = ManualClock::at_timestamp(1_000);
        let cache: ExpiringCache<Arc<Lease>> = ExpiringCache::new("test", clock);
        cache.start_sweeper(Duration::from_secs(15));
        assert!(cache.is_sweeping());

        cache.shutdown().await;
        assert!(!cache.is_sweeping());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_sweeper_twice_keeps_one_task() {
        let clock = ManualClock::at_timestamp(1_000);
        let cache: ExpiringCache<Arc<Lease>> = ExpiringCache::new("test", clock);
        cache.start_sweeper(Duration::from_secs(15));
        cache.start_sweeper(Duration::from_secs(30));
        assert!(cache.is_sweeping());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_readers_and_writers() {
        let clock = ManualClock::at_timestamp(1_000);
        let cache = Arc::new(ExpiringCache::new("test", clock.clone()));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let cache = Arc::clone(&cache);
            let clock = Arc::clone(&clock);
            tasks.push(tokio::spawn(async move {
                let key = format!("k{i}");
                cache.put(key.clone(), lease(&key, &clock, 60)).unwrap();
                cache.get(&key).is_some()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(cache.len(), 16);
    }
}
