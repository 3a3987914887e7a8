//! Configuration management for Redbucket.
//!
//! ```yaml
//! store:
//!   url: redis://127.0.0.1/
//!   key_format: "redbucket:{zone}:{key}"
//! backend: atomic        # or optimistic
//! codec: packed-binary   # or text
//! zones:
//!   ip: { rate: 5, expiry_secs: 60 }
//! limits:
//!   per_ip: { zone: ip, burst: 10, delay: 0 }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RedbucketError, Result};
use crate::ratelimit::{
    AtomicBackend, BackendKind, Codec, KeyFormat, LimitSet, OptimisticBackend, RateLimit,
    RateLimiter, Zone, DEFAULT_KEY_FORMAT,
};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::store::{ScriptStore, WatchStore};

/// Prefix of environment variables overriding file settings, e.g. `REDBUCKET__BACKEND`.
pub const ENV_PREFIX: &str = "REDBUCKET";

/// Main configuration for a Redbucket rate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedbucketConfig {
    /// Store connection configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Consistency strategy
    #[serde(default)]
    pub backend: BackendKind,

    /// Counter state encoding
    #[serde(default)]
    pub codec: Codec,

    /// Conflict retry policy of the optimistic backend
    #[serde(default)]
    pub retry: RetryConfig,

    /// Zones by name
    #[serde(default)]
    pub zones: BTreeMap<String, ZoneConfig>,

    /// Limits by name
    #[serde(default)]
    pub limits: BTreeMap<String, LimitConfig>,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `memory://` for an in-process store, `redis://…` for Redis
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Store key template
    #[serde(default = "default_key_format")]
    pub key_format: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_format: default_key_format(),
        }
    }
}

fn default_store_url() -> String {
    "memory://".to_string()
}

fn default_key_format() -> String {
    DEFAULT_KEY_FORMAT.to_string()
}

/// Zone configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Requests per second
    pub rate: f64,

    /// Lifetime of idle counters in seconds
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
}

fn default_expiry_secs() -> u64 {
    crate::ratelimit::DEFAULT_EXPIRY.as_secs()
}

/// Limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Name of the zone this limit governs
    pub zone: String,

    #[serde(default)]
    pub burst: u32,

    #[serde(default)]
    pub delay: u32,
}

impl RedbucketConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RedbucketError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional file layered under `REDBUCKET__*`
    /// environment variables (`__` separates nested keys).
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            let path = path.as_ref();
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RedbucketError::Config(format!("Failed to load configuration: {}", e)))
    }

    /// Build and validate the zones and limits.
    pub fn limit_set(&self) -> Result<LimitSet> {
        let mut zones = BTreeMap::new();
        for (name, zone) in &self.zones {
            let built =
                Zone::new(name.clone(), zone.rate)?.with_expiry(Duration::from_secs(zone.expiry_secs))?;
            zones.insert(name.as_str(), built);
        }

        let mut limits = LimitSet::new();
        for (name, limit) in &self.limits {
            let zone = zones.get(limit.zone.as_str()).ok_or_else(|| {
                RedbucketError::Config(format!(
                    "limit {:?} references unknown zone {:?}",
                    name, limit.zone
                ))
            })?;
            let rate_limit = RateLimit::new(zone.clone())
                .with_burst(limit.burst)
                .with_delay(limit.delay);
            limits.insert(name.clone(), rate_limit)?;
        }
        Ok(limits)
    }

    pub fn key_format(&self) -> Result<KeyFormat> {
        KeyFormat::new(&self.store.key_format)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::try_from(&self.retry)
    }

    /// Build a limiter over `store` using the configured backend and codec.
    pub fn build_limiter<S>(&self, store: S) -> Result<RateLimiter>
    where
        S: ScriptStore + WatchStore + 'static,
    {
        let limits = self.limit_set()?;
        let key_format = self.key_format()?;

        let limiter = match self.backend {
            BackendKind::Atomic => RateLimiter::new(limits, AtomicBackend::new(store, self.codec)),
            BackendKind::Optimistic => {
                let backend =
                    OptimisticBackend::new(store, self.codec).with_retry(self.retry_policy()?);
                RateLimiter::with_backend(limits, Arc::new(backend))
            }
        };
        Ok(limiter.with_key_format(key_format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const FULL: &str = r#"
store:
  url: redis://127.0.0.1:6379/
  key_format: "app:{zone}:{key}"
backend: optimistic
codec: text
retry:
  max_attempts: 3
zones:
  ip:
    rate: 5
  user:
    rate: 0.5
    expiry_secs: 120
limits:
  per_ip:
    zone: ip
    burst: 10
  per_user:
    zone: user
    delay: 4
"#;

    #[test]
    fn test_parse_full_config() {
        let config = RedbucketConfig::from_yaml(FULL).unwrap();
        assert_eq!(config.store.url, "redis://127.0.0.1:6379/");
        assert_eq!(config.backend, BackendKind::Optimistic);
        assert_eq!(config.codec, Codec::Text);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1);

        let limits = config.limit_set().unwrap();
        let per_ip = limits.get("per_ip").unwrap();
        assert_eq!(per_ip.rate(), 5.0);
        assert_eq!(per_ip.burst(), 10);
        assert_eq!(per_ip.delay(), 0);
        assert_eq!(per_ip.zone().expiry(), Duration::from_secs(60));

        let per_user = limits.get("per_user").unwrap();
        assert_eq!(per_user.delay(), 4);
        assert_eq!(per_user.zone().expiry(), Duration::from_secs(120));
    }

    #[test]
    fn test_defaults() {
        let config = RedbucketConfig::from_yaml("{}").unwrap();
        assert_eq!(config.store.url, "memory://");
        assert_eq!(config.store.key_format, DEFAULT_KEY_FORMAT);
        assert_eq!(config.backend, BackendKind::Atomic);
        assert_eq!(config.codec, Codec::PackedBinary);
        assert!(config.limit_set().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_zone() {
        let yaml = r#"
limits:
  per_ip: { zone: ip }
"#;
        let config = RedbucketConfig::from_yaml(yaml).unwrap();
        let err = config.limit_set().unwrap_err();
        assert!(err.to_string().contains("unknown zone"));
    }

    #[test]
    fn test_invalid_values() {
        let negative_burst = r#"
zones: { ip: { rate: 1 } }
limits: { per_ip: { zone: ip, burst: -1 } }
"#;
        assert!(matches!(
            RedbucketConfig::from_yaml(negative_burst),
            Err(RedbucketError::Config(_))
        ));

        let zero_rate = r#"
zones: { ip: { rate: 0 } }
"#;
        let config = RedbucketConfig::from_yaml(zero_rate).unwrap();
        assert!(config.limit_set().is_err());

        let bad_codec = "codec: msgpack";
        assert!(RedbucketConfig::from_yaml(bad_codec).is_err());
    }

    #[test]
    fn test_shared_zone_rejected() {
        let yaml = r#"
zones: { ip: { rate: 1 } }
limits:
  a: { zone: ip }
  b: { zone: ip, burst: 2 }
"#;
        let config = RedbucketConfig::from_yaml(yaml).unwrap();
        assert!(config.limit_set().is_err());
    }

    #[test]
    fn test_invalid_key_format() {
        let config = RedbucketConfig::from_yaml("store: { key_format: 'no fields' }").unwrap();
        assert!(config.key_format().is_err());
        assert!(config.build_limiter(MemoryStore::new()).is_err());
    }

    #[tokio::test]
    async fn test_build_limiter() {
        let config = RedbucketConfig::from_yaml(FULL).unwrap();
        let store = MemoryStore::new();
        let limiter = config.build_limiter(store.clone()).unwrap();
        assert_eq!(limiter.backend_kind(), BackendKind::Optimistic);

        let response = limiter
            .request_keys([("per_ip", "10.0.0.1"), ("per_user", "alice")])
            .await
            .unwrap();
        assert!(response.accepted);
        assert_eq!(store.len(), 2);
        assert!(limiter.counter_state("per_ip", "10.0.0.1").await.unwrap().is_some());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("redbucket-config-{}.yaml", std::process::id()));
        std::fs::write(&path, FULL).unwrap();

        let loaded = RedbucketConfig::load(Some(&path));
        let from_file = RedbucketConfig::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        let loaded = loaded.unwrap();
        assert_eq!(loaded.codec, Codec::Text);
        assert_eq!(loaded.limits.len(), 2);
        assert_eq!(from_file.unwrap().zones.len(), 2);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            RedbucketConfig::from_file("/nonexistent/redbucket.yaml"),
            Err(RedbucketError::Io(_))
        ));
    }
}
