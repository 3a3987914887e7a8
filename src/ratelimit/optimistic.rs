//! Optimistic backend for stores without server-side scripting.
//!
//! Each attempt watches the batch's keys, reads them, decides locally and then
//! commits with a compare-and-swap over the whole batch. A conflicting writer
//! aborts the commit and the attempt is retried after a jittered backoff.
//!
//! "Now" is the caller's clock here, since plain reads and writes cannot ask
//! the store for its time. Callers with drifting clocks see slightly
//! different counter timelines.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::{load_state, Backend, BackendKind, Counter};
use super::codec::Codec;
use super::counter::{decide_batch, BatchDecision, CounterState};
use super::limiter::Response;
use crate::clock::{Clock, SystemClock};
use crate::error::{RedbucketError, Result};
use crate::retry::RetryPolicy;
use crate::store::{StoreWrite, WatchStore};

/// Backend using watch / compare-and-swap with bounded retries.
#[derive(Debug, Clone)]
pub struct OptimisticBackend<S> {
    store: S,
    codec: Codec,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<S: WatchStore> OptimisticBackend<S> {
    /// Create a backend using the system clock and the default retry policy.
    pub fn new(store: S, codec: Codec) -> Self {
        Self {
            store,
            codec,
            clock: Arc::new(SystemClock::new()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    fn decode_all(
        &self,
        batch: &[Counter<'_>],
        raw: Vec<Option<Vec<u8>>>,
    ) -> Result<Vec<Option<CounterState>>> {
        batch
            .iter()
            .zip(raw)
            .map(|(counter, blob)| match blob {
                Some(blob) => self
                    .codec
                    .decode(&blob)
                    .map(Some)
                    .map_err(|e| RedbucketError::corruption(&counter.store_key, e)),
                None => Ok(None),
            })
            .collect()
    }

    /// One watch / read / decide / commit round. `Ok(None)` means the commit lost a race.
    async fn attempt(&self, batch: &[Counter<'_>], keys: &[Vec<u8>]) -> Result<Option<Response>> {
        let mut watch = self.store.watch(keys).await?;
        let raw = self.store.read(&mut watch).await?;

        let stored = match self.decode_all(batch, raw) {
            Ok(stored) => stored,
            Err(err) => {
                self.store.unwatch(watch).await?;
                return Err(err);
            }
        };

        let now = self.clock.now();
        let entries = batch.iter().map(|c| c.limit).zip(stored);
        match decide_batch(entries, now) {
            BatchDecision::Reject { index } => {
                self.store.unwatch(watch).await?;
                debug!(limit = %batch[index].name, "Rate limit exceeded");
                Ok(Some(Response::rejected()))
            }
            BatchDecision::Accept { delay, states } => {
                let writes = batch
                    .iter()
                    .zip(states)
                    .map(|(counter, state)| StoreWrite {
                        key: counter.store_key.clone(),
                        value: self.codec.encode(&state),
                        ttl: counter.limit.zone().expiry(),
                    })
                    .collect();

                if self.store.commit(watch, writes).await? {
                    Ok(Some(Response::accepted(delay)))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

#[async_trait]
impl<S: WatchStore> Backend for OptimisticBackend<S> {
    async fn evaluate(&self, batch: &[Counter<'_>]) -> Result<Response> {
        if batch.is_empty() {
            return Ok(Response::accepted(0.0));
        }

        let keys: Vec<Vec<u8>> = batch.iter().map(|c| c.store_key.clone()).collect();
        let attempts = self.retry.max_attempts();

        for attempt in 0..attempts {
            let wait = self.retry.delay(attempt);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            trace!(
                counters = batch.len(),
                attempt = attempt + 1,
                "Evaluating batch optimistically"
            );

            if let Some(response) = self.attempt(batch, &keys).await? {
                return Ok(response);
            }
            debug!(attempt = attempt + 1, max_attempts = attempts, "Write conflict, retrying");
        }

        warn!(
            attempts = attempts,
            limits = ?batch.iter().map(|c| c.name).collect::<Vec<_>>(),
            "Giving up after repeated write conflicts"
        );
        Err(RedbucketError::Contention { attempts })
    }

    async fn load(&self, store_key: &[u8]) -> Result<Option<CounterState>> {
        load_state(&self.store, self.codec, store_key).await
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Optimistic
    }
}
