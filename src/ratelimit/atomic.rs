//! Atomic backend: one round trip, evaluated inside the store.
//!
//! "Now" comes from the store's clock, so application hosts with skewed
//! clocks still agree on every counter's timeline.

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::{load_state, Backend, BackendKind, Counter};
use super::codec::Codec;
use super::counter::CounterState;
use super::limiter::Response;
use crate::error::Result;
use crate::store::ScriptStore;

/// Backend delegating each batch to the store's atomic evaluation.
#[derive(Debug, Clone)]
pub struct AtomicBackend<S> {
    store: S,
    codec: Codec,
}

impl<S: ScriptStore> AtomicBackend<S> {
    pub fn new(store: S, codec: Codec) -> Self {
        Self { store, codec }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }
}

#[async_trait]
impl<S: ScriptStore> Backend for AtomicBackend<S> {
    async fn evaluate(&self, batch: &[Counter<'_>]) -> Result<Response> {
        if batch.is_empty() {
            return Ok(Response::accepted(0.0));
        }

        trace!(
            counters = batch.len(),
            codec = self.codec.name(),
            "Evaluating batch atomically"
        );

        let response = self.store.evaluate_atomic(self.codec, batch).await?;
        if !response.accepted {
            debug!(
                limits = ?batch.iter().map(|c| c.name).collect::<Vec<_>>(),
                "Rate limit exceeded"
            );
        }
        Ok(response)
    }

    async fn load(&self, store_key: &[u8]) -> Result<Option<CounterState>> {
        load_state(&self.store, self.codec, store_key).await
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Atomic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::RedbucketError;
    use crate::ratelimit::rules::{RateLimit, Zone};
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;
    use std::time::Duration;

    const T0: f64 = 1_582_534_960.0;

    fn setup(codec: Codec) -> (AtomicBackend<MemoryStore>, MemoryStore, ManualClock) {
        let clock = ManualClock::new(T0);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        (AtomicBackend::new(store.clone(), codec), store, clock)
    }

    fn counter<'a>(name: &'a str, limit: &'a RateLimit, key: &str) -> Counter<'a> {
        Counter {
            name,
            limit,
            store_key: format!("rb:{}:{}", limit.zone().name(), key).into_bytes(),
        }
    }

    #[tokio::test]
    async fn test_empty_batch_accepts_without_store() {
        let (backend, store, _) = setup(Codec::PackedBinary);
        let response = backend.evaluate(&[]).await.unwrap();
        assert_eq!(response, Response::accepted(0.0));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_commits_on_accept() {
        let (backend, _, _) = setup(Codec::Text);
        let limit = RateLimit::new(Zone::new("z1", 2.0).unwrap()).with_burst(1);
        let batch = [counter("k1", &limit, "foo")];

        assert_eq!(backend.evaluate(&batch).await.unwrap(), Response::accepted(0.0));
        let state = backend.load(&batch[0].store_key).await.unwrap();
        assert_eq!(state, Some(CounterState::new(1.0, T0)));
    }

    #[tokio::test]
    async fn test_reject_leaves_state_untouched() {
        let (backend, _, clock) = setup(Codec::PackedBinary);
        let limit = RateLimit::new(Zone::new("z1", 2.0).unwrap());
        let batch = [counter("k1", &limit, "foo")];

        assert!(backend.evaluate(&batch).await.unwrap().accepted);
        let before = backend.load(&batch[0].store_key).await.unwrap();

        clock.advance(Duration::from_millis(300));
        assert_eq!(backend.evaluate(&batch).await.unwrap(), Response::rejected());
        assert_eq!(backend.load(&batch[0].store_key).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_cross_limit_atomicity() {
        let (backend, _, _) = setup(Codec::PackedBinary);
        let a = RateLimit::new(Zone::new("a", 1.0).unwrap());
        let b = RateLimit::new(Zone::new("b", 1.0).unwrap()).with_burst(5);

        assert!(backend.evaluate(&[counter("a", &a, "x")]).await.unwrap().accepted);
        let b_key = counter("b", &b, "x").store_key;
        assert_eq!(backend.load(&b_key).await.unwrap(), None);

        let batch = [counter("a", &a, "x"), counter("b", &b, "x")];
        assert!(!backend.evaluate(&batch).await.unwrap().accepted);
        assert_eq!(backend.load(&b_key).await.unwrap(), None, "b must not be consumed");
    }

    #[tokio::test]
    async fn test_corrupt_state_is_an_error() {
        let (backend, store, _) = setup(Codec::PackedBinary);
        let limit = RateLimit::new(Zone::new("z1", 1.0).unwrap());
        let batch = [counter("k1", &limit, "foo")];
        store.set(&batch[0].store_key, b"garbage".to_vec(), Duration::from_secs(60));

        let err = backend.evaluate(&batch).await.unwrap_err();
        assert!(matches!(err, RedbucketError::StateCorruption { .. }));
        assert_eq!(
            store.get(&batch[0].store_key).await.unwrap(),
            Some(b"garbage".to_vec()),
            "corrupt state must not be overwritten"
        );
    }

    #[tokio::test]
    async fn test_writes_use_zone_expiry() {
        let (backend, store, clock) = setup(Codec::PackedBinary);
        let zone = Zone::new("z1", 1.0)
            .unwrap()
            .with_expiry(Duration::from_secs(2))
            .unwrap();
        let limit = RateLimit::new(zone);
        let batch = [counter("k1", &limit, "foo")];

        backend.evaluate(&batch).await.unwrap();
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_secs(2));
        assert!(store.is_empty());
        assert_eq!(backend.load(&batch[0].store_key).await.unwrap(), None);
    }
}
