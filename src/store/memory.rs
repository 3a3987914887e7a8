//! In-process store.
//!
//! Implements every store capability over a single mutex-guarded map, so it is
//! trivially linearizable. Each write bumps a per-slot version, which is what
//! watches compare against. Expired slots are treated as absent on access and
//! swept out of the map every [`SWEEP_INTERVAL`] writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{ScriptStore, Store, StoreWrite, WatchStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{RedbucketError, Result};
use crate::ratelimit::counter::{decide_batch, BatchDecision, CounterState};
use crate::ratelimit::{Codec, Counter, Response};

/// Writes between sweeps of expired slots.
pub const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug)]
struct Slot {
    value: Vec<u8>,
    version: u64,
    expires_at: f64,
}

#[derive(Debug, Default)]
struct Slots {
    map: HashMap<Vec<u8>, Slot>,
    last_version: u64,
}

impl Slots {
    fn live(&self, key: &[u8], now: f64) -> Option<&Slot> {
        self.map.get(key).filter(|slot| slot.expires_at > now)
    }

    /// Version of a live slot; `0` stands for "absent".
    fn version(&self, key: &[u8], now: f64) -> u64 {
        self.live(key, now).map_or(0, |slot| slot.version)
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>, ttl: Duration, now: f64) {
        self.last_version += 1;
        if self.last_version % SWEEP_INTERVAL == 0 {
            self.sweep(now);
        }
        let slot = Slot {
            value,
            version: self.last_version,
            expires_at: now + ttl.as_secs_f64(),
        };
        self.map.insert(key, slot);
    }

    /// Drop expired slots, returning how many went.
    fn sweep(&mut self, now: f64) -> usize {
        let before = self.map.len();
        self.map.retain(|_, slot| slot.expires_at > now);
        let removed = before - self.map.len();
        if removed > 0 {
            trace!(removed, remaining = self.map.len(), "Swept expired slots");
        }
        removed
    }
}

/// Thread-safe in-memory store. Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    slots: Arc<Mutex<Slots>>,
    clock: Arc<dyn Clock>,
}

/// Versions observed when a [`MemoryStore`] watch started.
#[derive(Debug)]
pub struct MemoryWatch {
    keys: Vec<Vec<u8>>,
    versions: Vec<u64>,
}

impl MemoryStore {
    /// Create a store that uses the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store that uses `clock` for expiry and server-side evaluation.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots::default())),
            clock,
        }
    }

    /// Write a blob unconditionally, as any other client of the store could.
    pub fn set(&self, key: &[u8], value: Vec<u8>, ttl: Duration) {
        let now = self.clock.now();
        self.slots.lock().put(key.to_vec(), value, ttl, now);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let slots = self.slots.lock();
        slots.map.values().filter(|slot| slot.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired keys now instead of waiting for the next sweep.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        self.slots.lock().sweep(now)
    }

    /// Drop every key.
    pub fn clear(&self) {
        self.slots.lock().map.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        let slots = self.slots.lock();
        Ok(slots.live(key, now).map(|slot| slot.value.clone()))
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn evaluate_atomic(&self, codec: Codec, batch: &[Counter<'_>]) -> Result<Response> {
        let mut slots = self.slots.lock();
        let now = self.clock.now();

        let mut stored: Vec<Option<CounterState>> = Vec::with_capacity(batch.len());
        for counter in batch {
            let state = match slots.live(&counter.store_key, now) {
                Some(slot) => Some(
                    codec
                        .decode(&slot.value)
                        .map_err(|e| RedbucketError::corruption(&counter.store_key, e))?,
                ),
                None => None,
            };
            stored.push(state);
        }

        let entries = batch.iter().map(|c| c.limit).zip(stored);
        match decide_batch(entries, now) {
            BatchDecision::Reject { index } => {
                trace!(limit = %batch[index].name, "Memory store rejected batch");
                Ok(Response::rejected())
            }
            BatchDecision::Accept { delay, states } => {
                for (counter, state) in batch.iter().zip(states) {
                    slots.put(
                        counter.store_key.clone(),
                        codec.encode(&state),
                        counter.limit.zone().expiry(),
                        now,
                    );
                }
                Ok(Response::accepted(delay))
            }
        }
    }
}

#[async_trait]
impl WatchStore for MemoryStore {
    type Watch = MemoryWatch;

    async fn watch(&self, keys: &[Vec<u8>]) -> Result<MemoryWatch> {
        let now = self.clock.now();
        let slots = self.slots.lock();
        let versions = keys.iter().map(|key| slots.version(key, now)).collect();
        Ok(MemoryWatch {
            keys: keys.to_vec(),
            versions,
        })
    }

    async fn read(&self, watch: &mut MemoryWatch) -> Result<Vec<Option<Vec<u8>>>> {
        let now = self.clock.now();
        let slots = self.slots.lock();
        Ok(watch
            .keys
            .iter()
            .map(|key| slots.live(key, now).map(|slot| slot.value.clone()))
            .collect())
    }

    async fn commit(&self, watch: MemoryWatch, writes: Vec<StoreWrite>) -> Result<bool> {
        let now = self.clock.now();
        let mut slots = self.slots.lock();

        let changed = watch
            .keys
            .iter()
            .zip(&watch.versions)
            .any(|(key, version)| slots.version(key, now) != *version);
        if changed {
            debug!(keys = watch.keys.len(), "Watched key changed, commit aborted");
            return Ok(false);
        }

        for write in writes {
            slots.put(write.key, write.value, write.ttl, now);
        }
        Ok(true)
    }

    async fn unwatch(&self, _watch: MemoryWatch) -> Result<()> {
        Ok(())
    }
}
