//! Zones, rate limits and the named set of limits a limiter enforces.
//!
//! All validation happens here, at configuration time, so nothing on the
//! request path can fail because of a bad limit.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::warn;

use crate::error::{RedbucketError, Result};

/// Default lifetime of an idle counter in the store.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(60);

/// A namespace of independent per-key counters sharing one base rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    name: String,
    rate: f64,
    expiry: Duration,
}

impl Zone {
    /// Create a zone replenishing `rate` requests per second.
    pub fn new(name: impl Into<String>, rate: f64) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(RedbucketError::Config("zone name must not be empty".to_string()));
        }
        if !rate.is_finite() || rate <= 0.0 {
            return Err(RedbucketError::Config(format!(
                "zone {:?}: rate must be a positive number, got {}",
                name, rate
            )));
        }
        Ok(Self {
            name,
            rate,
            expiry: DEFAULT_EXPIRY,
        })
    }

    /// Set how long an idle counter lives in the store. Whole seconds, at least one.
    pub fn with_expiry(mut self, expiry: Duration) -> Result<Self> {
        if expiry < Duration::from_secs(1) {
            return Err(RedbucketError::Config(format!(
                "zone {:?}: expiry must be at least one second, got {:?}",
                self.name, expiry
            )));
        }
        self.expiry = Duration::from_secs(expiry.as_secs());
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }
}

/// Burst and delay allowance applied to a zone.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimit {
    zone: Zone,
    burst: u32,
    delay: u32,
}

impl RateLimit {
    /// Strict limit: one request per `1 / rate` seconds, no burst, no delay.
    pub fn new(zone: Zone) -> Self {
        Self {
            zone,
            burst: 0,
            delay: 0,
        }
    }

    /// Requests accepted immediately above the steady rate.
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    /// Requests accepted with a computed delay once the burst is spent.
    pub fn with_delay(mut self, delay: u32) -> Self {
        self.delay = delay;
        self
    }

    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    pub fn rate(&self) -> f64 {
        self.zone.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub fn delay(&self) -> u32 {
        self.delay
    }

    /// Upper bound of the virtual counter (`burst + 1`).
    pub fn capacity(&self) -> f64 {
        f64::from(self.burst) + 1.0
    }

    /// Lower bound a committed counter may reach (`-delay`).
    pub fn floor(&self) -> f64 {
        -f64::from(self.delay)
    }

    /// Shortest expiry that lets a fully drained counter refill before it is evicted.
    pub fn recommended_expiry(&self) -> Duration {
        let span = f64::from(self.burst) + f64::from(self.delay) + 1.0;
        Duration::from_secs((span / self.zone.rate).ceil() as u64)
    }
}

/// The named limits a [`RateLimiter`](super::RateLimiter) enforces.
///
/// Names are unique and each zone is governed by exactly one limit.
#[derive(Debug, Clone, Default)]
pub struct LimitSet {
    limits: BTreeMap<String, RateLimit>,
}

impl LimitSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from `(name, limit)` pairs, failing on the first invalid entry.
    pub fn from_limits<I, N>(limits: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, RateLimit)>,
        N: Into<String>,
    {
        let mut set = Self::new();
        for (name, limit) in limits {
            set.insert(name, limit)?;
        }
        Ok(set)
    }

    /// Add a limit under `name`.
    pub fn insert(&mut self, name: impl Into<String>, limit: RateLimit) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(RedbucketError::Config("limit name must not be empty".to_string()));
        }
        if self.limits.contains_key(&name) {
            return Err(RedbucketError::Config(format!(
                "duplicate rate limit name {:?}",
                name
            )));
        }
        if let Some((other, _)) = self
            .limits
            .iter()
            .find(|(_, existing)| existing.zone.name == limit.zone.name)
        {
            return Err(RedbucketError::Config(format!(
                "multiple rate limits for zone {:?}: {:?} and {:?}",
                limit.zone.name, other, name
            )));
        }

        let recommended = limit.recommended_expiry();
        if limit.zone.expiry < recommended {
            warn!(
                zone = %limit.zone.name,
                limit = %name,
                expiry_secs = limit.zone.expiry.as_secs(),
                recommended_secs = recommended.as_secs(),
                "Zone expiry is less than recommended minimum"
            );
        }

        self.limits.insert(name, limit);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RateLimit> {
        self.limits.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RateLimit)> {
        self.limits.iter().map(|(name, limit)| (name.as_str(), limit))
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}
