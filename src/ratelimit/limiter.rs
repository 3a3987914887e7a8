//! Public rate limiter API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, trace};

use super::backend::{Backend, BackendKind, Counter};
use super::counter::CounterState;
use super::key::KeyFormat;
use super::rules::{LimitSet, RateLimit};
use crate::error::{RedbucketError, Result};

/// Decision for a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Response {
    /// Whether the request was accepted
    pub accepted: bool,
    /// Seconds the caller should wait before serving the request.
    /// Always zero for rejected requests.
    pub delay: f64,
}

impl Response {
    pub fn accepted(delay: f64) -> Self {
        Self {
            accepted: true,
            delay,
        }
    }

    pub fn rejected() -> Self {
        Self {
            accepted: false,
            delay: 0.0,
        }
    }

    /// The delay as a `Duration`, for handing to a timer.
    ///
    /// Saturates at `Duration::MAX` for delays too long to represent, which
    /// very small rates can produce.
    pub fn delay_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.delay.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Keys a request presents, by limit name.
///
/// Limits not named here are neither evaluated nor consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    keys: BTreeMap<String, Vec<u8>>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Present `key` to the limit called `limit`, replacing any earlier key for it.
    pub fn with(mut self, limit: impl Into<String>, key: impl AsRef<[u8]>) -> Self {
        self.insert(limit, key);
        self
    }

    pub fn insert(&mut self, limit: impl Into<String>, key: impl AsRef<[u8]>) {
        self.keys.insert(limit.into(), key.as_ref().to_vec());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.keys.iter().map(|(name, key)| (name.as_str(), key.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<N, K> FromIterator<(N, K)> for Request
where
    N: Into<String>,
    K: AsRef<[u8]>,
{
    fn from_iter<I: IntoIterator<Item = (N, K)>>(iter: I) -> Self {
        let mut request = Request::new();
        for (limit, key) in iter {
            request.insert(limit, key);
        }
        request
    }
}

/// A fixed set of named limits enforced through one backend.
///
/// Limits are validated when the limiter is built and never change afterwards.
/// Several independently configured limiters may share one store.
#[derive(Clone)]
pub struct RateLimiter {
    limits: Arc<LimitSet>,
    key_format: KeyFormat,
    backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limits", &self.limits)
            .field("key_format", &self.key_format.template())
            .field("backend", &self.backend.kind())
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter over an already validated limit set.
    pub fn new(limits: LimitSet, backend: impl Backend + 'static) -> Self {
        Self::with_backend(limits, Arc::new(backend))
    }

    /// Create a limiter over a shared backend.
    pub fn with_backend(limits: LimitSet, backend: Arc<dyn Backend>) -> Self {
        info!(
            limits = limits.len(),
            backend = ?backend.kind(),
            "Rate limiter configured"
        );
        Self {
            limits: Arc::new(limits),
            key_format: KeyFormat::default(),
            backend,
        }
    }

    /// Validate `(name, limit)` pairs and create a limiter.
    ///
    /// Fails on duplicate names, or on two limits sharing a zone.
    pub fn configure<I, N>(limits: I, backend: impl Backend + 'static) -> Result<Self>
    where
        I: IntoIterator<Item = (N, RateLimit)>,
        N: Into<String>,
    {
        Ok(Self::new(LimitSet::from_limits(limits)?, backend))
    }

    /// Use a custom store key template.
    pub fn with_key_format(mut self, key_format: KeyFormat) -> Self {
        self.key_format = key_format;
        self
    }

    pub fn limits(&self) -> &LimitSet {
        &self.limits
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Request a permit.
    ///
    /// A rejection is a normal `Ok` response. Enforcing a returned delay is the
    /// caller's responsibility.
    pub async fn request(&self, request: &Request) -> Result<Response> {
        let batch = self.resolve(request)?;
        if batch.is_empty() {
            return Ok(Response::accepted(0.0));
        }

        let response = self.backend.evaluate(&batch).await?;
        trace!(
            counters = batch.len(),
            accepted = response.accepted,
            delay = response.delay,
            "Request evaluated"
        );
        Ok(response)
    }

    /// Convenience wrapper around [`request`](Self::request) for `(limit, key)` pairs.
    pub async fn request_keys<I, N, K>(&self, keys: I) -> Result<Response>
    where
        I: IntoIterator<Item = (N, K)>,
        N: Into<String>,
        K: AsRef<[u8]>,
    {
        self.request(&keys.into_iter().collect()).await
    }

    /// Current stored state of the counter `limit` keeps for `key`.
    pub async fn counter_state(
        &self,
        limit: &str,
        key: impl AsRef<[u8]>,
    ) -> Result<Option<CounterState>> {
        let rate_limit = self.lookup(limit)?;
        let store_key = self.key_format.render(rate_limit.zone().name(), key.as_ref());
        self.backend.load(&store_key).await
    }

    fn lookup(&self, name: &str) -> Result<&RateLimit> {
        self.limits
            .get(name)
            .ok_or_else(|| RedbucketError::Config(format!("unknown rate limit {:?}", name)))
    }

    /// Map every named key to its counter, failing on unknown names.
    fn resolve<'a>(&'a self, request: &'a Request) -> Result<Vec<Counter<'a>>> {
        request
            .iter()
            .map(|(name, key)| {
                let limit = self.lookup(name)?;
                Ok(Counter {
                    name,
                    limit,
                    store_key: self.key_format.render(limit.zone().name(), key),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::ratelimit::{AtomicBackend, Codec, OptimisticBackend, Zone};
    use crate::store::{MemoryStore, Store};
    use tokio_test::{assert_err, assert_ok};

    const T0: f64 = 123.4;

    fn limits() -> Vec<(&'static str, RateLimit)> {
        vec![
            ("k1", RateLimit::new(Zone::new("z1", 1.0).unwrap())),
            ("k2", RateLimit::new(Zone::new("z2", 2.0).unwrap()).with_burst(2)),
        ]
    }

    fn atomic() -> (RateLimiter, MemoryStore, ManualClock) {
        let clock = ManualClock::new(T0);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let backend = AtomicBackend::new(store.clone(), Codec::PackedBinary);
        let limiter = RateLimiter::configure(limits(), backend).unwrap();
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_request_initial() {
        let (limiter, store, clock) = atomic();

        let response = limiter.request(&Request::new().with("k1", "foo")).await.unwrap();
        assert_eq!(response, Response::accepted(0.0));

        clock.advance(Duration::from_millis(100));
        let response = limiter
            .request_keys([("k1", "bar"), ("k2", "baz")])
            .await
            .unwrap();
        assert_eq!(response, Response::accepted(0.0));

        assert_eq!(
            limiter.counter_state("k1", "foo").await.unwrap(),
            Some(CounterState::new(0.0, T0))
        );
        assert_eq!(
            limiter.counter_state("k1", "bar").await.unwrap(),
            Some(CounterState::new(0.0, clock.now()))
        );
        assert_eq!(
            limiter.counter_state("k2", "baz").await.unwrap(),
            Some(CounterState::new(2.0, clock.now()))
        );
        assert!(store.get(b"redbucket:z2:baz").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_omitted_limits_untouched() {
        let (limiter, store, _) = atomic();
        assert_ok!(limiter.request_keys([("k2", "baz")]).await);
        assert_eq!(store.len(), 1);
        assert_eq!(limiter.counter_state("k1", "baz").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_limit_fails_fast() {
        let (limiter, store, _) = atomic();
        let err = assert_err!(limiter.request_keys([("k1", "a"), ("nope", "b")]).await);
        assert!(matches!(err, RedbucketError::Config(_)));
        assert!(store.is_empty(), "nothing evaluated for an invalid request");

        assert_err!(limiter.counter_state("nope", "a").await);
    }

    #[tokio::test]
    async fn test_empty_request_accepted() {
        let (limiter, store, _) = atomic();
        let response = limiter.request(&Request::new()).await.unwrap();
        assert_eq!(response, Response::accepted(0.0));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_configure_rejects_duplicates() {
        let backend = AtomicBackend::new(MemoryStore::new(), Codec::Text);
        let result = RateLimiter::configure(
            [
                ("k1", RateLimit::new(Zone::new("z1", 1.0).unwrap())),
                ("k1", RateLimit::new(Zone::new("z2", 1.0).unwrap())),
            ],
            backend,
        );
        assert!(matches!(result, Err(RedbucketError::Config(_))));
    }

    #[tokio::test]
    async fn test_binary_keys_and_custom_format() {
        let clock = ManualClock::new(T0);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let backend = OptimisticBackend::new(store.clone(), Codec::PackedBinary)
            .with_clock(Arc::new(clock));
        let limiter = RateLimiter::configure(limits(), backend)
            .unwrap()
            .with_key_format(KeyFormat::new("app/{zone}/{key}").unwrap());

        let key: &[u8] = &[0xde, 0xad, 0xbe, 0xef];
        assert!(limiter.request(&Request::new().with("k1", key)).await.unwrap().accepted);
        assert!(!limiter.request(&Request::new().with("k1", key)).await.unwrap().accepted);

        let mut expected = b"app/z1/".to_vec();
        expected.extend_from_slice(key);
        assert!(store.get(&expected).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_request_later_key_replaces_earlier() {
        let request: Request = [("k1", "a"), ("k1", "b")].into_iter().collect();
        assert_eq!(request.len(), 1);
        assert_eq!(request.iter().next(), Some(("k1", &b"b"[..])));
    }

    #[test]
    fn test_response_delay_duration() {
        assert_eq!(Response::accepted(0.25).delay_duration(), Duration::from_millis(250));
        assert_eq!(Response::rejected().delay_duration(), Duration::ZERO);
    }

    #[test]
    fn test_huge_delay_saturates() {
        let limit = RateLimit::new(Zone::new("tiny", 1e-19).unwrap()).with_delay(10);
        let in_debt = CounterState::new(-8.0, T0);
        let delay = match crate::ratelimit::decide(&limit, Some(in_debt), T0) {
            crate::ratelimit::Decision::Accept { delay, .. } => delay,
            crate::ratelimit::Decision::Reject => panic!("expected delayed accept"),
        };
        assert!(delay > u64::MAX as f64);

        assert_eq!(Response::accepted(delay).delay_duration(), Duration::MAX);
        assert_eq!(Response::accepted(f64::INFINITY).delay_duration(), Duration::MAX);
    }
}
