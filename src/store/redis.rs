//! Redis-backed store.
//!
//! ## Atomic evaluation
//!
//! [`ScriptStore`] is implemented with a Lua script that reads every counter,
//! applies the same token-bucket arithmetic as
//! [`decide`](crate::ratelimit::decide) (including the
//! [`CLOCK_RESOLUTION`](crate::ratelimit::counter::CLOCK_RESOLUTION) slack),
//! and writes all new states only if
//! none rejects. Redis runs scripts without interleaving other commands, and
//! `TIME` inside the script gives every client the same clock.
//!
//! Per-key arguments are passed as `ARGV` in groups of four
//! (`rate`, `burst`, `delay`, `expiry_secs`) after the codec name, and rates
//! are formatted with Rust's shortest round-trip representation so the
//! script computes with exactly the same doubles.
//!
//! ## Optimistic transactions
//!
//! `WATCH` state belongs to a TCP connection, so every [`RedisWatch`] holds a
//! dedicated connection instead of borrowing the shared multiplexed one.
//! `EXEC` and `UNWATCH` leave a connection clean, after which it returns to a
//! small idle pool; up to [`IDLE_WATCH_CONNECTIONS`] are kept, so steady
//! optimistic traffic does not open a connection per attempt. A watch dropped
//! mid-transaction (e.g. after a failed read) closes its connection instead,
//! which also discards the watch.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::{ScriptStore, Store, StoreWrite, WatchStore};
use crate::error::{RedbucketError, Result};
use crate::ratelimit::{Codec, CodecError, Counter, Response};

/// Idle watch connections kept for reuse.
pub const IDLE_WATCH_CONNECTIONS: usize = 16;

const EVALUATE_SCRIPT: &str = r#"
if redis.replicate_commands then
  redis.replicate_commands()
end

local codec = ARGV[1]

local function decode(raw)
  local timestamp, value
  if codec == "packed-binary" then
    if #raw ~= 16 then
      return nil
    end
    timestamp, value = struct.unpack("<dd", raw)
  else
    local ok, state = pcall(cjson.decode, raw)
    if not ok or type(state) ~= "table" then
      return nil
    end
    timestamp, value = state.timestamp, state.value
    if type(timestamp) ~= "number" or type(value) ~= "number" then
      return nil
    end
  end
  if timestamp ~= timestamp or value ~= value
      or math.abs(timestamp) == math.huge or math.abs(value) == math.huge then
    return nil
  end
  return timestamp, value
end

local function encode(timestamp, value)
  if codec == "packed-binary" then
    return struct.pack("<dd", timestamp, value)
  end
  return string.format('{"timestamp":%.17g,"value":%.17g}', timestamp, value)
end

local time = redis.call("TIME")
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000
local stored = redis.call("MGET", unpack(KEYS))

local delay = 0
local levels = {}
for i = 1, #KEYS do
  local offset = 1 + (i - 1) * 4
  local rate = tonumber(ARGV[offset + 1])
  local capacity = tonumber(ARGV[offset + 2]) + 1
  local floor = -tonumber(ARGV[offset + 3])

  local timestamp, value = now, capacity
  if stored[i] then
    timestamp, value = decode(stored[i])
    if timestamp == nil then
      return redis.error_reply("CORRUPT " .. KEYS[i])
    end
  end

  local elapsed = math.max(now - timestamp, 0)
  local level = math.min(value + rate * elapsed, capacity) - 1
  local slack = rate * 1e-6
  if level < floor - slack then
    return false
  end
  if level < -slack then
    delay = math.max(delay, -level / rate)
  end
  levels[i] = level
end

for i = 1, #KEYS do
  local expiry = tonumber(ARGV[1 + (i - 1) * 4 + 4])
  redis.call("SET", KEYS[i], encode(now, levels[i]), "EX", expiry)
end

return string.format("%.17g", delay)
"#;

/// Redis store shared by every backend instance in the process.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    script: Script,
    idle: Arc<Mutex<Vec<MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("script", &self.script.get_hash())
            .field("idle_watch_connections", &self.idle.lock().len())
            .finish_non_exhaustive()
    }
}

/// A watch held on a dedicated Redis connection.
pub struct RedisWatch {
    connection: MultiplexedConnection,
    keys: Vec<Vec<u8>>,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client.clone()).await?;
        info!(url = %url, "Connected to Redis");

        Ok(Self {
            client,
            connection,
            script: Script::new(EVALUATE_SCRIPT),
            idle: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Number of clean watch connections waiting for reuse.
    pub fn idle_watch_connections(&self) -> usize {
        self.idle.lock().len()
    }

    async fn watch_connection(&self) -> Result<MultiplexedConnection> {
        let pooled = self.idle.lock().pop();
        match pooled {
            Some(connection) => Ok(connection),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }

    /// Return a connection with no pending watch to the pool.
    fn release(&self, connection: MultiplexedConnection) {
        let mut idle = self.idle.lock();
        if idle.len() < IDLE_WATCH_CONNECTIONS {
            idle.push(connection);
        }
    }
}

/// Translate script errors, recognising the script's own corruption reply.
fn script_error(err: redis::RedisError) -> RedbucketError {
    if err.code() == Some("CORRUPT") {
        return RedbucketError::StateCorruption {
            key: err.detail().unwrap_or_default().to_string(),
            source: CodecError::Rejected(err.to_string()),
        };
    }
    err.into()
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }
}

#[async_trait]
impl ScriptStore for RedisStore {
    async fn evaluate_atomic(&self, codec: Codec, batch: &[Counter<'_>]) -> Result<Response> {
        let mut invocation = self.script.prepare_invoke();
        invocation.arg(codec.name());
        for counter in batch {
            let limit = counter.limit;
            invocation
                .key(counter.store_key.as_slice())
                .arg(limit.rate().to_string())
                .arg(limit.burst())
                .arg(limit.delay())
                .arg(limit.zone().expiry().as_secs());
        }

        let mut conn = self.connection.clone();
        let reply: Option<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(script_error)?;

        match reply {
            None => Ok(Response::rejected()),
            Some(delay) => delay.parse::<f64>().map(Response::accepted).map_err(|_| {
                RedbucketError::StoreUnavailable(format!(
                    "unexpected reply from evaluation script: {:?}",
                    delay
                ))
            }),
        }
    }
}

#[async_trait]
impl WatchStore for RedisStore {
    type Watch = RedisWatch;

    async fn watch(&self, keys: &[Vec<u8>]) -> Result<RedisWatch> {
        let mut connection = self.watch_connection().await?;

        let mut cmd = redis::cmd("WATCH");
        for key in keys {
            cmd.arg(key.as_slice());
        }
        let _: () = cmd.query_async(&mut connection).await?;

        Ok(RedisWatch {
            connection,
            keys: keys.to_vec(),
        })
    }

    async fn read(&self, watch: &mut RedisWatch) -> Result<Vec<Option<Vec<u8>>>> {
        let mut cmd = redis::cmd("MGET");
        for key in &watch.keys {
            cmd.arg(key.as_slice());
        }
        let values: Vec<Option<Vec<u8>>> = cmd.query_async(&mut watch.connection).await?;
        Ok(values)
    }

    async fn commit(&self, mut watch: RedisWatch, writes: Vec<StoreWrite>) -> Result<bool> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for write in &writes {
            pipe.cmd("SET")
                .arg(write.key.as_slice())
                .arg(write.value.as_slice())
                .arg("EX")
                .arg(write.ttl.as_secs().max(1));
        }

        // EXEC replies nil when a watched key changed.
        let reply: Option<Vec<redis::Value>> = pipe.query_async(&mut watch.connection).await?;
        if reply.is_none() {
            debug!(keys = watch.keys.len(), "Redis transaction aborted by WATCH");
        }
        self.release(watch.connection);
        Ok(reply.is_some())
    }

    async fn unwatch(&self, mut watch: RedisWatch) -> Result<()> {
        let _: () = redis::cmd("UNWATCH").query_async(&mut watch.connection).await?;
        self.release(watch.connection);
        Ok(())
    }
}
