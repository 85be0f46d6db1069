//! # kbroker-core - Foundation Layer
//!
//! Shared primitives used by every other kbroker crate:
//!
//! - [`clock`] - Injectable wall clock (`SystemClock`, plus `ManualClock` behind `test-util`)
//! - [`cache`] - [`ExpiringCache`], a thread-safe TTL-swept key/value store
//! - [`period`] - [`TimePeriod`], clock-aligned rotation windows shared by all replicas
//!
//! ## Design Principles
//!
//! - **One cache implementation**: token, nonce and public-key caches are all
//!   instances of [`ExpiringCache`], parameterized by [`Expiring`]
//! - **No global state**: clocks and tracing spans are handed in by the owner
//! - **Cooperative shutdown**: background tasks stop on request and are awaited

pub mod cache;
pub mod clock;
pub mod error;
pub mod period;

pub use cache::{Expiring, ExpiringCache};
pub use clock::{Clock, SharedClock, SystemClock, system_clock};
pub use error::{CacheError, PeriodError};
pub use period::TimePeriod;

#[cfg(any(test, feature = "test-util"))]
pub use clock::ManualClock;

/// Recommended lower bound for cache sweep intervals
pub const MIN_SWEEP_INTERVAL_SECS: u64 = 15;

/// Recommended upper bound for cache sweep intervals
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 3600;
