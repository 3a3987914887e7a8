//! Backend trait abstracting the atomic and optimistic strategies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::codec::Codec;
use super::counter::CounterState;
use super::limiter::Response;
use super::rules::RateLimit;
use crate::error::{RedbucketError, Result};
use crate::store::Store;

/// One counter touched by a request: the limit governing it and where it lives.
#[derive(Debug, Clone)]
pub struct Counter<'a> {
    /// Configured limit name, for diagnostics.
    pub name: &'a str,
    pub limit: &'a RateLimit,
    /// Rendered store key of the `(zone, key)` pair.
    pub store_key: Vec<u8>,
}

/// Selectable consistency strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One round trip; the store evaluates and commits the batch itself.
    #[default]
    Atomic,
    /// Read, decide locally, compare-and-swap; retried on conflict.
    Optimistic,
}

/// Trait for rate limiting backends.
///
/// Both implementations share the same contract: evaluate the whole batch,
/// and commit every counter's new state if and only if no counter rejects.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Evaluate a request's counters and commit them when accepted.
    async fn evaluate(&self, batch: &[Counter<'_>]) -> Result<Response>;

    /// Read and decode the stored state of one counter.
    async fn load(&self, store_key: &[u8]) -> Result<Option<CounterState>>;

    fn kind(&self) -> BackendKind;
}

/// Fetch and decode one counter, reporting undecodable blobs as corruption.
pub(crate) async fn load_state<S: Store + ?Sized>(
    store: &S,
    codec: Codec,
    store_key: &[u8],
) -> Result<Option<CounterState>> {
    match store.get(store_key).await? {
        Some(raw) => codec
            .decode(&raw)
            .map(Some)
            .map_err(|e| RedbucketError::corruption(store_key, e)),
        None => Ok(None),
    }
}
