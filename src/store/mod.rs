//! Shared-store boundary.
//!
//! A store holds one opaque blob per counter. Beyond plain reads, a backend
//! needs one of two capabilities: [`ScriptStore`] evaluates and commits a whole
//! batch inside the store's own atomicity boundary, [`WatchStore`] offers
//! watch / compare-and-swap so the caller can do the same optimistically.

mod memory;
#[cfg(feature = "redis-store")]
mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::{Codec, Counter, Response};

pub use memory::{MemoryStore, MemoryWatch, SWEEP_INTERVAL};
#[cfg(feature = "redis-store")]
pub use self::redis::{RedisStore, RedisWatch, IDLE_WATCH_CONNECTIONS};

/// One blob to write as part of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreWrite {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Store-native expiry of the written key.
    pub ttl: Duration,
}

/// Plain key-value access.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch the blob stored under `key`, if any.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Server-side evaluate-and-conditionally-commit.
#[async_trait]
pub trait ScriptStore: Store {
    /// Evaluate every counter in `batch` against the store's own clock and,
    /// only if all of them accept, write every new state. Runs as one
    /// indivisible operation: no other client can observe or interleave with
    /// the intermediate state.
    async fn evaluate_atomic(&self, codec: Codec, batch: &[Counter<'_>]) -> Result<Response>;
}

/// Watch plus conditional multi-key write.
#[async_trait]
pub trait WatchStore: Store {
    /// Handle tying a read to the commit that depends on it.
    type Watch: Send;

    /// Start watching `keys`; a later commit fails if any of them changes.
    async fn watch(&self, keys: &[Vec<u8>]) -> Result<Self::Watch>;

    /// Read the current blobs of the watched keys, in watch order.
    async fn read(&self, watch: &mut Self::Watch) -> Result<Vec<Option<Vec<u8>>>>;

    /// Apply `writes` if no watched key changed. `Ok(false)` means a conflict.
    async fn commit(&self, watch: Self::Watch, writes: Vec<StoreWrite>) -> Result<bool>;

    /// Abandon the watch without writing.
    async fn unwatch(&self, watch: Self::Watch) -> Result<()>;
}
