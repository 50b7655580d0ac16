//! The access client: cached, coalesced, retrying requests over a [`Transport`].
//!
//! A single logical request flows through three stages:
//!
//! 1. cache lookup (GET requests with caching enabled),
//! 2. coalescing with any identical request already in flight,
//! 3. the transport call, retried with exponential backoff.
//!
//! A successful cacheable response is stored before it is handed to the
//! callers that were waiting on it.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::request::{cache_key, full_url, Method, RequestDescriptor, RequestOptions};
use super::retry::RetryPolicy;
use super::transport::{ReqwestTransport, RequestInit, Transport};
use super::ApiError;
use crate::cache::ttl::{deadline, FAR_FUTURE};
use crate::cache::{CacheStats, TtlCache};
use crate::config::ClientConfig;
use crate::dedup::Deduplicator;

type SharedOutcome = Result<Value, ApiError>;

const CONTENT_TYPE: &str = "Content-Type";
const JSON_CONTENT_TYPE: &str = "application/json";

fn has_header(headers: &BTreeMap<String, String>, name: &str) -> bool {
    headers.keys().any(|key| key.eq_ignore_ascii_case(name))
}

struct Inner {
    base_url: String,
    default_headers: BTreeMap<String, String>,
    default_retries: u32,
    retry_policy: RetryPolicy,
    transport: Arc<dyn Transport>,
    cache: Arc<TtlCache<Value>>,
    dedup: Deduplicator<SharedOutcome>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

/// Resilient client for a JSON backend.
///
/// Clone is cheap - all clones share one cache, one in-flight map and one
/// sweep task. The sweep task stops when the last clone is dropped or
/// [`AccessClient::stop_sweeper`] is called.
#[derive(Clone)]
pub struct AccessClient {
    inner: Arc<Inner>,
}

impl AccessClient {
    /// Create a client that talks HTTP through `reqwest`.
    ///
    /// Must be called from within a tokio runtime (the cache sweep task is
    /// spawned here).
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::new(config.request_timeout())?;
        Ok(Self::with_transport(config, transport))
    }

    /// Create a client over any transport.
    pub fn with_transport(config: ClientConfig, transport: impl Transport) -> Self {
        let cache = Arc::new(TtlCache::new(config.default_cache_ttl()));
        let sweeper = config
            .sweep_interval()
            .map(|period| Self::spawn_sweeper(Arc::downgrade(&cache), period));

        let inner = Inner {
            retry_policy: config.retry_policy(),
            base_url: config.base_url,
            default_headers: config.default_headers,
            default_retries: config.default_retries,
            transport: Arc::new(transport),
            cache,
            dedup: Deduplicator::new(),
            sweeper: Mutex::new(sweeper),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    fn spawn_sweeper(weak_cache: Weak<TtlCache<Value>>, period: Duration) -> JoinHandle<()> {
        // The interval adds `period` to every deadline it computes
        let period = period.min(FAR_FUTURE);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(deadline(Instant::now(), period), period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(cache) = weak_cache.upgrade() else {
                    break;
                };
                cache.sweep();
            }
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Issue one logical request and deserialize the JSON response into `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let value = self.request_value(endpoint, options).await?;
        serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn request_value(&self, endpoint: &str, options: RequestOptions) -> SharedOutcome {
        let url = full_url(&self.inner.base_url, endpoint);
        let serialized_body = options.serialized_body();
        let key = cache_key(options.method, &url, &serialized_body);
        let cacheable = options.is_cacheable();

        if cacheable {
            if let Some(value) = self.inner.cache.get(&key) {
                return Ok(value);
            }
        }

        let body = options.body.is_some().then_some(serialized_body);
        let mut headers = self.inner.default_headers.clone();
        if body.is_some() && !has_header(&headers, CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string());
        }
        headers.extend(options.headers);
        let init = RequestInit {
            method: options.method,
            headers,
            body,
        };

        let retries = options.retry.unwrap_or(self.inner.default_retries);
        let policy = self.inner.retry_policy;
        let transport = Arc::clone(&self.inner.transport);
        let cache = cacheable.then(|| (Arc::clone(&self.inner.cache), key.clone()));
        let ttl = options.cache_ttl;

        let outcome = self.inner.dedup.execute(key, move || async move {
            let outcome = send_with_retry(transport.as_ref(), policy, &url, init, retries).await;
            if let (Ok(value), Some((cache, key))) = (&outcome, cache) {
                cache.set(key, value.clone(), ttl);
            }
            outcome
        });

        outcome.await.unwrap_or_else(|_abandoned| Err(ApiError::Abandoned))
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        self.request(endpoint, options.method(Method::Get)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        data: &B,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let body = Self::to_body(data)?;
        self.request(endpoint, options.method(Method::Post).body(body))
            .await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        data: &B,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let body = Self::to_body(data)?;
        self.request(endpoint, options.method(Method::Put).body(body))
            .await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        self.request(endpoint, options.method(Method::Delete)).await
    }

    fn to_body<B: Serialize + ?Sized>(data: &B) -> Result<Value, ApiError> {
        serde_json::to_value(data).map_err(|e| ApiError::Serialization(e.to_string()))
    }

    /// Run all requests concurrently; fails with the first error observed.
    ///
    /// Results are returned in the order the requests were given. Requests
    /// still running when another fails are not cancelled, their outcome is
    /// simply no longer awaited.
    pub async fn batch<T: DeserializeOwned>(
        &self,
        requests: Vec<RequestDescriptor>,
    ) -> Result<Vec<T>, ApiError> {
        debug!(count = requests.len(), "Dispatching batch");
        try_join_all(requests.into_iter().map(|descriptor| async move {
            self.request(&descriptor.endpoint, descriptor.options).await
        }))
        .await
    }

    /// Warm the cache for `endpoint`. Never fails; errors are only logged.
    ///
    /// Only GET responses are cached, so the request is always sent as a GET
    /// without a body, whatever method `options` carries.
    pub async fn prefetch(&self, endpoint: &str, options: RequestOptions) {
        if options.method != Method::Get || options.body.is_some() {
            debug!(endpoint = endpoint, method = %options.method, "Prefetching as a plain GET");
        }
        let options = RequestOptions {
            body: None,
            ..options.method(Method::Get).use_cache(true)
        };
        match self.request::<Value>(endpoint, options).await
        {
            Ok(_) => debug!(endpoint = endpoint, "Prefetch complete"),
            Err(e) => warn!(endpoint = endpoint, error = %e, "Prefetch failed"),
        }
    }

    /// Prefetch on a detached task.
    pub fn spawn_prefetch(&self, endpoint: impl Into<String>, options: RequestOptions) -> JoinHandle<()> {
        let client = self.clone();
        let endpoint = endpoint.into();
        tokio::spawn(async move { client.prefetch(&endpoint, options).await })
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        info!("Response cache cleared");
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Number of distinct requests currently in flight
    pub fn pending_requests(&self) -> usize {
        self.inner.dedup.pending()
    }

    /// Stop the periodic cache sweep. Expired entries are still dropped on read.
    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
            debug!("Cache sweeper stopped");
        }
    }
}

/// Up to `retries + 1` attempts, sleeping `policy.backoff(n)` before retry `n`.
async fn send_with_retry(
    transport: &dyn Transport,
    policy: RetryPolicy,
    url: &str,
    init: RequestInit,
    retries: u32,
) -> SharedOutcome {
    let max_attempts = retries.saturating_add(1);
    let mut attempt = 1;

    loop {
        let err = match transport.send(url, init.clone()).await {
            Ok(response) if response.is_success() => return response.json(),
            Ok(response) => ApiError::from_status(response.status, &response.body),
            Err(e) => e,
        };

        if !policy.should_retry(&err) {
            debug!(url = url, error = %err, "Request failed, not retrying");
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(url = url, attempts = attempt, error = %err, "Request failed, giving up");
            return Err(ApiError::MaxRetriesExceeded {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let backoff = policy.backoff(attempt);
        warn!(
            url = url,
            attempt = attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Request failed, backing off"
        );
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::retry::RetryOn;
    use crate::api::transport::TransportResponse;
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time;

    type Handler = dyn Fn(&str, usize) -> (Duration, Result<TransportResponse, ApiError>) + Send + Sync;

    /// Transport whose behavior is decided per call by a closure receiving
    /// the URL and the zero-based call number.
    struct MockTransport {
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<(String, RequestInit)>>>,
        handler: Box<Handler>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, url: &str, init: RequestInit) -> Result<TransportResponse, ApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push((url.to_string(), init));
            let (delay, result) = (self.handler)(url, n);
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            result
        }
    }

    struct Harness {
        client: AccessClient,
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<(String, RequestInit)>>>,
    }

    impl Harness {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn test_config() -> ClientConfig {
        ClientConfig {
            backoff_unit_ms: 100,
            ..ClientConfig::with_base_url("https://api.test")
        }
    }

    fn harness_with(
        config: ClientConfig,
        handler: impl Fn(&str, usize) -> (Duration, Result<TransportResponse, ApiError>)
            + Send
            + Sync
            + 'static,
    ) -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport {
            calls: calls.clone(),
            seen: seen.clone(),
            handler: Box::new(handler),
        };
        Harness {
            client: AccessClient::with_transport(config, transport),
            calls,
            seen,
        }
    }

    fn harness(
        handler: impl Fn(&str, usize) -> (Duration, Result<TransportResponse, ApiError>)
            + Send
            + Sync
            + 'static,
    ) -> Harness {
        harness_with(test_config(), handler)
    }

    fn ok(body: Value) -> Result<TransportResponse, ApiError> {
        Ok(TransportResponse::new(200, body.to_string()))
    }

    fn status(code: u16) -> Result<TransportResponse, ApiError> {
        Ok(TransportResponse::new(code, "error"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_get_hits_transport_once() {
        let h = harness(|_, n| (Duration::ZERO, ok(json!({"n": n}))));
        let opts = RequestOptions::new()
            .use_cache(true)
            .cache_ttl(Duration::from_millis(1000));

        let first: Value = h.client.get("/api/x", opts.clone()).await.unwrap();
        let second: Value = h.client.get("/api/x", opts).await.unwrap();

        assert_eq!(h.calls(), 1);
        assert_eq!(first, json!({"n": 0}));
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_get_refetches_after_ttl() {
        let h = harness(|_, n| (Duration::ZERO, ok(json!(n))));
        let opts = RequestOptions::new().cache_ttl(Duration::from_millis(1000));

        let first: u64 = h.client.get("/api/x", opts.clone()).await.unwrap();
        time::advance(Duration::from_millis(1001)).await;
        let second: u64 = h.client.get("/api/x", opts).await.unwrap();

        assert_eq!((first, second), (0, 1));
        assert_eq!(h.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncached_get_always_fetches() {
        let h = harness(|_, n| (Duration::ZERO, ok(json!(n))));
        let opts = RequestOptions::new().use_cache(false);

        let _: u64 = h.client.get("/api/x", opts.clone()).await.unwrap();
        let _: u64 = h.client.get("/api/x", opts).await.unwrap();
        assert_eq!(h.calls(), 2);
        assert_eq!(h.client.cache_stats().total_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_requests_are_coalesced() {
        let h = harness(|_, _| (Duration::from_millis(200), ok(json!({"id": 1}))));
        let opts = RequestOptions::new().use_cache(false);

        let requests = (0..8).map(|_| h.client.get::<Value>("/api/x", opts.clone()));
        let results = futures::future::join_all(requests).await;

        assert_eq!(h.calls(), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap() == &json!({"id": 1})));
        assert_eq!(h.client.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_callers_share_the_error() {
        let h = harness(|_, _| (Duration::from_millis(50), status(500)));
        let opts = RequestOptions::new().retry(0);

        let (a, b, c) = futures::join!(
            h.client.get::<Value>("/api/x", opts.clone()),
            h.client.get::<Value>("/api/x", opts.clone()),
            h.client.get::<Value>("/api/x", opts),
        );

        assert_eq!(h.calls(), 1);
        let a = a.unwrap_err();
        assert_eq!(a.status(), Some(500));
        assert_eq!(Some(&a), b.as_ref().err());
        assert_eq!(Some(&a), c.as_ref().err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_after_settle_starts_fresh() {
        let h = harness(|_, n| (Duration::ZERO, ok(json!(n))));
        let opts = RequestOptions::new().use_cache(false);

        let first: u64 = h.client.get("/api/x", opts.clone()).await.unwrap();
        let second: u64 = h.client.get("/api/x", opts).await.unwrap();
        assert_eq!((first, second), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_within_budget() {
        let h = harness(|_, n| {
            let result = if n < 2 {
                Err(ApiError::Network("connection reset".into()))
            } else {
                ok(json!("ok"))
            };
            (Duration::ZERO, result)
        });

        let value: String = h
            .client
            .get("/api/x", RequestOptions::new().retry(2))
            .await
            .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(h.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_too_small_fails() {
        let h = harness(|_, n| {
            let result = if n < 2 { status(503) } else { ok(json!("ok")) };
            (Duration::ZERO, result)
        });

        let err = h
            .client
            .get::<String>("/api/x", RequestOptions::new().retry(1))
            .await
            .unwrap_err();
        match err {
            ApiError::MaxRetriesExceeded { attempts, last } => {
                assert_eq!(attempts, 2);
                assert_eq!(last.status(), Some(503));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_always_failing_attempts_three_times() {
        let h = harness(|_, _| (Duration::ZERO, Err(ApiError::Network("unreachable".into()))));

        let err = h
            .client
            .post::<Value, _>("/api/y", &json!({"a": 1}), RequestOptions::new().retry(2))
            .await
            .unwrap_err();

        assert_eq!(h.calls(), 3);
        assert!(matches!(err, ApiError::MaxRetriesExceeded { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_exponentially() {
        let h = harness(|_, _| (Duration::ZERO, status(502)));
        let start = Instant::now();

        let _ = h
            .client
            .get::<Value>("/api/x", RequestOptions::new().retry(3))
            .await;

        // 100ms unit: waits of 200, 400 and 800ms between the four attempts
        assert_eq!(h.calls(), 4);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1400), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1500), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_retried_by_default() {
        let h = harness(|_, _| (Duration::ZERO, status(404)));
        let err = h
            .client
            .get::<Value>("/api/missing", RequestOptions::new().retry(2))
            .await
            .unwrap_err();
        assert_eq!(h.calls(), 3);
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_only_policy_fails_fast_on_client_errors() {
        let config = ClientConfig {
            retry_on: RetryOn::TransientOnly,
            ..test_config()
        };
        let h = harness_with(config, |_, _| (Duration::ZERO, status(422)));

        let err = h
            .client
            .post::<Value, _>("/api/y", &json!({}), RequestOptions::new().retry(3))
            .await
            .unwrap_err();
        assert_eq!(h.calls(), 1);
        assert!(matches!(err, ApiError::Http { status: 422, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_json_is_not_retried() {
        let h = harness(|_, _| (Duration::ZERO, Ok(TransportResponse::new(200, "<html>"))));
        let err = h
            .client
            .get::<Value>("/api/x", RequestOptions::new().retry(3))
            .await
            .unwrap_err();
        assert_eq!(h.calls(), 1);
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_deserialization() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Course {
            id: u32,
            title: String,
        }

        let h = harness(|_, _| (Duration::ZERO, ok(json!({"id": 3, "title": "Rust"}))));
        let course: Course = h.client.get("/courses/3", RequestOptions::new()).await.unwrap();
        assert_eq!(
            course,
            Course {
                id: 3,
                title: "Rust".to_string()
            }
        );

        // Served from cache, but the shape does not match
        let err = h
            .client
            .get::<Vec<Course>>("/courses/3", RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_sends_body_and_merged_headers() {
        let h = harness(|_, n| (Duration::ZERO, ok(json!(n))));
        let opts = RequestOptions::new().header("Authorization", "Bearer t");

        let _: u64 = h.client.post("/api/y", &json!({"a": 1}), opts.clone()).await.unwrap();
        let _: u64 = h.client.post("/api/y", &json!({"a": 1}), opts).await.unwrap();
        // Non-GET responses are never served from the cache
        assert_eq!(h.calls(), 2);

        let seen = h.seen.lock();
        let (url, init) = &seen[0];
        assert_eq!(url, "https://api.test/api/y");
        assert_eq!(init.method, Method::Post);
        assert_eq!(init.body.as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(init.headers.get("Authorization").map(String::as_str), Some("Bearer t"));
        assert_eq!(
            init.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_and_delete_use_their_methods() {
        let h = harness(|_, _| (Duration::ZERO, Ok(TransportResponse::new(204, ""))));

        let _: Value = h.client.put("/api/y/1", &json!({"a": 2}), RequestOptions::new()).await.unwrap();
        let _: Value = h.client.delete("/api/y/1", RequestOptions::new()).await.unwrap();

        let seen = h.seen.lock();
        assert_eq!(seen[0].1.method, Method::Put);
        assert_eq!(
            seen[0].1.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(seen[1].1.method, Method::Delete);
        assert_eq!(seen[1].1.body, None);
        assert!(!seen[1].1.headers.contains_key("Content-Type"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bodyless_requests_carry_no_content_type() {
        let config = ClientConfig {
            default_headers: [("Accept".to_string(), "application/json".to_string())].into(),
            ..test_config()
        };
        let h = harness_with(config, |_, _| (Duration::ZERO, ok(json!(null))));

        let _: Value = h.client.get("/api/x", RequestOptions::new()).await.unwrap();
        let _: Value = h.client.delete("/api/x", RequestOptions::new()).await.unwrap();

        let seen = h.seen.lock();
        assert_eq!(seen.len(), 2);
        for (_, init) in seen.iter() {
            assert_eq!(init.body, None);
            assert!(!init.headers.contains_key("Content-Type"));
            assert_eq!(init.headers.get("Accept").map(String::as_str), Some("application/json"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_content_type_is_not_duplicated() {
        let h = harness(|_, _| (Duration::ZERO, ok(json!(null))));
        let opts = RequestOptions::new().header("content-type", "application/merge-patch+json");

        let _: Value = h.client.put("/api/y/1", &json!({"a": 3}), opts).await.unwrap();

        let seen = h.seen.lock();
        let headers = &seen[0].1.headers;
        assert_eq!(headers.len(), 1);
        assert_eq!(
            headers.get("content-type").map(String::as_str),
            Some("application/merge-patch+json")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_preserves_order() {
        let h = harness(|url, _| {
            let delay = if url.ends_with("/a") { 300 } else { 10 };
            (Duration::from_millis(delay), ok(json!(url.rsplit('/').next())))
        });

        let results: Vec<String> = h
            .client
            .batch(vec![
                RequestDescriptor::get("/a"),
                RequestDescriptor::get("/b"),
                RequestDescriptor::get("/c"),
            ])
            .await
            .unwrap();
        assert_eq!(results, vec!["a", "b", "c"]);
        assert_eq!(h.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_fails_fast() {
        let h = harness(|url, _| {
            if url.ends_with("/slow") {
                (Duration::from_secs(10), ok(json!("slow")))
            } else {
                (Duration::from_millis(10), status(500))
            }
        });
        let start = Instant::now();

        let err = h
            .client
            .batch::<Value>(vec![
                RequestDescriptor::get("/slow"),
                RequestDescriptor::new("/broken", RequestOptions::new().retry(0)),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::MaxRetriesExceeded { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_swallows_failures() {
        let h = harness(|_, _| (Duration::ZERO, Err(ApiError::Network("down".into()))));

        h.client.prefetch("/api/z", RequestOptions::new().retry(1)).await;
        assert_eq!(h.calls(), 2);

        h.client
            .spawn_prefetch("/api/z", RequestOptions::new().retry(0))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_warms_cache() {
        let h = harness(|_, _| (Duration::ZERO, ok(json!({"warm": true}))));

        h.client
            .prefetch("/api/z", RequestOptions::new().use_cache(false))
            .await;
        let value: Value = h.client.get("/api/z", RequestOptions::new()).await.unwrap();

        assert_eq!(value, json!({"warm": true}));
        assert_eq!(h.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_with_write_options_warms_get_cache() {
        let h = harness(|_, _| (Duration::ZERO, ok(json!({"warm": true}))));
        let opts = RequestOptions::new()
            .method(Method::Post)
            .body(json!({"ignored": true}));

        h.client.prefetch("/api/z", opts).await;
        let value: Value = h.client.get("/api/z", RequestOptions::new()).await.unwrap();

        assert_eq!(value, json!({"warm": true}));
        assert_eq!(h.calls(), 1);
        let seen = h.seen.lock();
        assert_eq!(seen[0].1.method, Method::Get);
        assert_eq!(seen[0].1.body, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cache_forces_refetch() {
        let h = harness(|_, n| (Duration::ZERO, ok(json!(n))));

        let _: u64 = h.client.get("/api/x", RequestOptions::new()).await.unwrap();
        h.client.clear_cache();
        let second: u64 = h.client.get("/api/x", RequestOptions::new()).await.unwrap();

        assert_eq!(second, 1);
        assert_eq!(h.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_unread_entries() {
        let config = ClientConfig {
            sweep_interval_secs: 1,
            ..test_config()
        };
        let h = harness_with(config, |_, _| (Duration::ZERO, ok(json!(1))));
        let opts = RequestOptions::new().cache_ttl(Duration::from_millis(500));

        let _: u64 = h.client.get("/api/once", opts).await.unwrap();
        assert_eq!(h.client.cache_stats().total_entries, 1);

        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.client.cache_stats().total_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_and_sweep_interval_still_serve_responses() {
        let config = ClientConfig {
            default_cache_ttl_secs: u64::MAX,
            sweep_interval_secs: u64::MAX,
            ..test_config()
        };
        let h = harness_with(config, |_, _| (Duration::ZERO, Ok(TransportResponse::new(200, "1"))));

        let first: u64 = h.client.get("/api/x", RequestOptions::new()).await.unwrap();
        let explicit: u64 = h
            .client
            .get("/api/y", RequestOptions::new().cache_ttl(Duration::MAX))
            .await
            .unwrap();
        assert_eq!((first, explicit), (1, 1));

        time::sleep(Duration::from_secs(86400)).await;
        let second: u64 = h.client.get("/api/x", RequestOptions::new()).await.unwrap();
        assert_eq!(second, 1);
        assert_eq!(h.calls(), 2);
        assert_eq!(h.client.cache_stats().valid_entries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_sweeper_leaves_entries_for_lazy_eviction() {
        let config = ClientConfig {
            sweep_interval_secs: 1,
            ..test_config()
        };
        let h = harness_with(config, |_, _| (Duration::ZERO, ok(json!(1))));
        h.client.stop_sweeper();

        let opts = RequestOptions::new().cache_ttl(Duration::from_millis(500));
        let _: u64 = h.client.get("/api/once", opts.clone()).await.unwrap();
        time::sleep(Duration::from_millis(1500)).await;

        let stats = h.client.cache_stats();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.expired_entries, 1);

        // The expired entry is never returned
        let _: u64 = h.client.get("/api/once", opts).await.unwrap();
        assert_eq!(h.calls(), 2);
    }
}
