//! Virtual counter state and the token-bucket decision engine.
//!
//! Everything here is pure: given a limit, the stored state (if any) and the
//! current time, it computes the outcome and the state to commit. Backends
//! only move bytes in and out of the store around these functions.

use serde::{Deserialize, Serialize};

use super::rules::RateLimit;

/// Smallest time difference counters resolve, in seconds.
///
/// Epoch timestamps carry about 2.4e-7 s of rounding, so a wait of exactly
/// `1/rate` can come out a hair short. Levels within `rate * CLOCK_RESOLUTION`
/// of a threshold count as reaching it. Redis `TIME` has the same resolution.
pub const CLOCK_RESOLUTION: f64 = 1e-6;

/// Persisted state of one `(zone, key)` counter.
///
/// `value` is the token level at `timestamp` (seconds since the Unix epoch).
/// It is stored without clamping; bounds are applied when it is read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
    pub value: f64,
    pub timestamp: f64,
}

impl CounterState {
    pub fn new(value: f64, timestamp: f64) -> Self {
        Self { value, timestamp }
    }

    /// Token level at `now` under `limit`, capped at its capacity.
    ///
    /// Elapsed time is clamped at zero so a clock that moved backwards never
    /// drains the bucket.
    pub fn replenished(&self, limit: &RateLimit, now: f64) -> f64 {
        let elapsed = (now - self.timestamp).max(0.0);
        (self.value + limit.rate() * elapsed).min(limit.capacity())
    }
}

/// Outcome of one counter's evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Accept after `delay` seconds (zero for an immediate accept) and commit `next`.
    Accept { delay: f64, next: CounterState },
    /// Reject; the stored state must stay untouched.
    Reject,
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept { .. })
    }
}

/// Evaluate one request against one counter.
///
/// A missing counter is a full bucket observed at `now`.
pub fn decide(limit: &RateLimit, stored: Option<CounterState>, now: f64) -> Decision {
    let current = stored.unwrap_or_else(|| CounterState::new(limit.capacity(), now));
    let level = current.replenished(limit, now) - 1.0;
    let slack = limit.rate() * CLOCK_RESOLUTION;

    if level < limit.floor() - slack {
        return Decision::Reject;
    }

    let delay = if level >= -slack { 0.0 } else { -level / limit.rate() };
    Decision::Accept {
        delay,
        next: CounterState::new(level, now),
    }
}

/// Combined outcome of every counter a request touches.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchDecision {
    /// Every counter accepted; commit `states` (in input order) and wait the longest delay.
    Accept { delay: f64, states: Vec<CounterState> },
    /// The counter at `index` rejected; nothing may be committed.
    Reject { index: usize },
}

/// Evaluate a request against all of its counters at one instant.
///
/// Stops at the first rejecting counter since a single reject decides the batch.
pub fn decide_batch<'a, I>(entries: I, now: f64) -> BatchDecision
where
    I: IntoIterator<Item = (&'a RateLimit, Option<CounterState>)>,
{
    let mut delay: f64 = 0.0;
    let mut states = Vec::new();

    for (index, (limit, stored)) in entries.into_iter().enumerate() {
        match decide(limit, stored, now) {
            Decision::Reject => return BatchDecision::Reject { index },
            Decision::Accept { delay: d, next } => {
                delay = delay.max(d);
                states.push(next);
            }
        }
    }

    BatchDecision::Accept { delay, states }
}
