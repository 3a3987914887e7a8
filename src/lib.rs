//! Redbucket - Distributed Token-Bucket Rate Limiting
//!
//! Requests carry one key per named limit. Each `(zone, key)` pair owns a
//! virtual token counter that replenishes continuously and lives in a shared
//! store, so independent processes enforce one consistent limit. A request is
//! accepted immediately, accepted after a delay, or rejected, and a rejected
//! request never consumes capacity from any limit it touched.
//!
//! Two backends provide that guarantee: [`ratelimit::AtomicBackend`] lets the
//! store evaluate the whole batch in one round trip, and
//! [`ratelimit::OptimisticBackend`] uses watch / compare-and-swap with retries.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod retry;
pub mod store;

pub use error::{RedbucketError, Result};
pub use ratelimit::{RateLimit, RateLimiter, Request, Response, Zone};
