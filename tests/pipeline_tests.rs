//! Pipeline tests against an in-process transport, so call counts and
//! timings are exact.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use rebound::{
    AbortController, CacheConfig, CacheEntry, CacheStore, CacheStoreError, Client,
    DeduplicationConfig, HttpError, RequestConfig, ResponseErrorKind, ResponseType, RetryConfig,
    RetryDelay, Transport, TransportError, TransportResponse,
};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Deserialize, PartialEq)]
struct Call {
    call: usize,
}

/// Answers with scripted statuses, then `fallback` forever. Status `0`
/// stands for a connection reset.
#[derive(Clone)]
struct Scripted {
    statuses: Arc<Mutex<VecDeque<u16>>>,
    fallback: u16,
    delay: Duration,
    headers: HeaderMap,
    calls: Arc<AtomicUsize>,
}

impl Scripted {
    fn new(fallback: u16) -> Self {
        Self {
            statuses: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            delay: Duration::ZERO,
            headers: HeaderMap::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn then(self, statuses: &[u16]) -> Self {
        self.statuses.lock().extend(statuses.iter().copied());
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.insert(name, HeaderValue::from_static(value));
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn execute(
        &self,
        request: &RequestConfig,
    ) -> Result<TransportResponse, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let status = self.statuses.lock().pop_front().unwrap_or(self.fallback);
        if status == 0 {
            return Err(TransportError::network(
                Some("ECONNRESET".to_string()),
                "socket hang up",
            ));
        }

        let status = StatusCode::from_u16(status).unwrap();
        Ok(TransportResponse {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: self.headers.clone(),
            body: Bytes::from(format!(r#"{{"call":{}}}"#, call)),
            url: request.url(),
        })
    }
}

fn client_with(transport: &Scripted) -> rebound::ClientBuilder {
    Client::builder()
        .base_url("http://api.test")
        .unwrap()
        .transport(transport.clone())
}

fn fast_retry(attempts: u32) -> RetryConfig {
    RetryConfig::new(attempts).delay(RetryDelay::Fixed(Duration::from_millis(5)))
}

#[tokio::test]
async fn test_cache_hit_skips_deduplication_and_retry() {
    let transport = Scripted::new(200);
    let client = client_with(&transport)
        .retry(fast_retry(3))
        .deduplication(DeduplicationConfig::enabled())
        .cache(CacheConfig::memory())
        .build()
        .unwrap();

    let first = client.get::<Call>("/users").await.unwrap();
    let second = client.get::<Call>("/users").await.unwrap();

    assert_eq!(transport.calls(), 1);
    assert_eq!(first.data, second.data);
    assert!(second.is_cached());
    assert_eq!(second.attempts, 0);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_retried_execution() {
    let transport = Scripted::new(200)
        .then(&[503, 503])
        .delay(Duration::from_millis(30));
    let client = client_with(&transport)
        .retry(fast_retry(3))
        .deduplication(DeduplicationConfig::enabled())
        .build()
        .unwrap();

    let (a, b) = tokio::join!(client.get::<Call>("/users"), client.get::<Call>("/users"));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(transport.calls(), 3);
    assert_eq!(a.data, Call { call: 3 });
    assert_eq!(a.data, b.data);
    assert_eq!(a.attempts, 3);
    assert_eq!(b.attempts, 3);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_shared_failure_reaches_every_caller() {
    let transport = Scripted::new(404).delay(Duration::from_millis(30));
    let client = client_with(&transport)
        .deduplication(DeduplicationConfig::enabled())
        .build()
        .unwrap();

    let (a, b) = tokio::join!(client.get::<Call>("/gone"), client.get::<Call>("/gone"));

    assert_eq!(transport.calls(), 1);
    for result in [a, b] {
        match result {
            Err(HttpError::Response(response)) => {
                assert_eq!(response.kind(), ResponseErrorKind::NotFound)
            }
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_dropping_every_caller_tears_down_execution() {
    let transport = Scripted::new(200).delay(Duration::from_millis(200));
    let client = client_with(&transport)
        .deduplication(DeduplicationConfig::enabled())
        .build()
        .unwrap();

    let background = client.clone();
    let task = tokio::spawn(async move { background.get::<Call>("/slow").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.in_flight(), 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(client.in_flight(), 0);

    let response = client.get::<Call>("/slow").await.unwrap();
    assert_eq!(response.data, Call { call: 2 });
}

#[tokio::test]
async fn test_deduplication_can_be_disabled_per_request() {
    let transport = Scripted::new(200).delay(Duration::from_millis(30));
    let client = client_with(&transport)
        .deduplication(DeduplicationConfig::enabled())
        .build()
        .unwrap();

    let request = || RequestConfig::new(Method::GET, "/users").with_deduplication(false);
    let (a, b) = tokio::join!(client.send::<Call>(request()), client.send::<Call>(request()));

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_abort_during_backoff() {
    let transport = Scripted::new(503);
    let client = client_with(&transport)
        .retry(RetryConfig::new(5).delay(RetryDelay::Fixed(Duration::from_secs(10))))
        .build()
        .unwrap();

    let controller = AbortController::new();
    let request = RequestConfig::new(Method::GET, "/flaky").with_signal(controller.signal());

    let start = Instant::now();
    let call = client.send::<Call>(request);
    let abort = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.abort(Some("user cancelled".to_string()));
    };
    let (result, ()) = tokio::join!(call, abort);

    assert!(matches!(result, Err(HttpError::Abort { .. })), "got {:?}", result);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_per_request_overrides() {
    let transport = Scripted::new(200).then(&[503]);
    let client = client_with(&transport)
        .retry(RetryConfig::none())
        .cache(CacheConfig::memory())
        .build()
        .unwrap();

    let request = RequestConfig::new(Method::GET, "/report").with_retry(fast_retry(2));
    let response = client.send::<Call>(request).await.unwrap();
    assert_eq!(response.attempts, 2);

    let uncached = RequestConfig::new(Method::GET, "/report").without_cache();
    let response = client.send::<Call>(uncached).await.unwrap();
    assert!(!response.is_cached());
    assert_eq!(transport.calls(), 3);

    let response = client.get::<Call>("/report").await.unwrap();
    assert!(response.is_cached());
    assert_eq!(response.data, Call { call: 2 });
}

#[tokio::test]
async fn test_stale_entry_is_served_while_refreshing() {
    let transport = Scripted::new(200);
    let client = client_with(&transport)
        .cache(
            CacheConfig::memory()
                .ttl(Duration::from_millis(200))
                .stale_while_revalidate(true),
        )
        .build()
        .unwrap();

    client.get::<Call>("/feed").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stale = client.get::<Call>("/feed").await.unwrap();
    assert!(stale.is_cached());
    assert_eq!(stale.data, Call { call: 1 });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let refreshed = client.get::<Call>("/feed").await.unwrap();
    assert!(refreshed.is_cached());
    assert_eq!(refreshed.data, Call { call: 2 });
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_no_store_responses_are_not_cached() {
    let transport = Scripted::new(200).header("cache-control", "no-store");
    let client = client_with(&transport)
        .cache(CacheConfig::memory().respect_cache_headers(true))
        .build()
        .unwrap();

    client.get::<Call>("/live").await.unwrap();
    client.get::<Call>("/live").await.unwrap();

    assert_eq!(transport.calls(), 2);
    assert_eq!(client.cache().map(|cache| cache.len()), Some(0));
}

#[tokio::test]
async fn test_invalidate_patterns_after_mutation() {
    let transport = Scripted::new(200);
    let client = client_with(&transport)
        .cache(CacheConfig::memory().invalidate_patterns(["/teams"]))
        .build()
        .unwrap();

    client.get::<Call>("/users/1").await.unwrap();
    client.get::<Call>("/teams").await.unwrap();
    client.get::<Call>("/projects").await.unwrap();
    client
        .post::<_, Call>("/users", &serde_json::json!({"name": "Alice"}))
        .await
        .unwrap();

    assert!(!client.get::<Call>("/users/1").await.unwrap().is_cached());
    assert!(!client.get::<Call>("/teams").await.unwrap().is_cached());
    assert!(client.get::<Call>("/projects").await.unwrap().is_cached());
    assert_eq!(transport.calls(), 6);
}

#[tokio::test]
async fn test_uncached_mutation_still_invalidates() {
    let transport = Scripted::new(200);
    let client = client_with(&transport)
        .cache(CacheConfig::memory())
        .build()
        .unwrap();

    client.get::<Call>("/users").await.unwrap();
    let create = RequestConfig::new(Method::POST, "/users")
        .with_json_body(&serde_json::json!({"name": "Alice"}))
        .unwrap()
        .without_cache();
    client.send::<Call>(create).await.unwrap();

    let after = client.get::<Call>("/users").await.unwrap();
    assert!(!after.is_cached());
    assert_eq!(after.data, Call { call: 3 });
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_same_path_on_different_hosts_is_kept_apart() {
    let transport = Scripted::new(200).delay(Duration::from_millis(30));
    let client = client_with(&transport)
        .deduplication(DeduplicationConfig::enabled())
        .cache(CacheConfig::memory())
        .build()
        .unwrap();
    let on = |base: &str| RequestConfig::new(Method::GET, "/users").with_base_url(base);

    let (a, b) = tokio::join!(
        client.send::<Call>(on("http://tenant-a")),
        client.send::<Call>(on("http://tenant-b")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(transport.calls(), 2);
    assert_ne!(a.data, b.data);

    let cached_a = client.send::<Call>(on("http://tenant-a")).await.unwrap();
    let cached_b = client.send::<Call>(on("http://tenant-b")).await.unwrap();
    assert!(cached_a.is_cached() && cached_b.is_cached());
    assert_eq!(cached_a.data, a.data);
    assert_eq!(cached_b.data, b.data);
    assert_eq!(cached_b.url, "http://tenant-b/users");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_manual_invalidation() {
    let transport = Scripted::new(200);
    let client = client_with(&transport)
        .cache(CacheConfig::memory())
        .build()
        .unwrap();

    client.get::<Call>("/users").await.unwrap();
    client.get::<Call>("/users/7").await.unwrap();
    client.get::<Call>("/usersettings").await.unwrap();

    assert_eq!(client.invalidate_cache("/users/").await.unwrap(), 2);
    assert_eq!(client.cache().map(|cache| cache.len()), Some(1));

    client.clear_cache().await.unwrap();
    assert_eq!(client.cache().map(|cache| cache.len()), Some(0));
}

struct OfflineStore;

#[async_trait]
impl CacheStore for OfflineStore {
    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
        Err(CacheStoreError::new("store offline"))
    }

    async fn set(
        &self,
        _key: &str,
        _entry: CacheEntry,
        _ttl: Duration,
    ) -> Result<(), CacheStoreError> {
        Err(CacheStoreError::new("store offline"))
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheStoreError> {
        Err(CacheStoreError::new("store offline"))
    }

    async fn clear(&self) -> Result<(), CacheStoreError> {
        Err(CacheStoreError::new("store offline"))
    }
}

#[tokio::test]
async fn test_cache_store_failures() {
    let transport = Scripted::new(200);

    let fail_closed = client_with(&transport)
        .cache(CacheConfig::new(Arc::new(OfflineStore)))
        .build()
        .unwrap();
    let err = fail_closed.get::<Call>("/users").await.unwrap_err();
    assert!(matches!(err, HttpError::Cache(_)), "got {:?}", err);
    assert_eq!(transport.calls(), 0);

    let fail_open = client_with(&transport)
        .cache(CacheConfig::new(Arc::new(OfflineStore)).fail_open(true))
        .build()
        .unwrap();
    let response = fail_open.get::<Call>("/users").await.unwrap();
    assert_eq!(response.data, Call { call: 1 });
}

#[tokio::test]
async fn test_network_errors_retry_only_idempotent_methods() {
    let transport = Scripted::new(200).then(&[0, 0]);
    let client = client_with(&transport).retry(fast_retry(3)).build().unwrap();

    let response = client.get::<Call>("/users").await.unwrap();
    assert_eq!(response.attempts, 3);

    transport.statuses.lock().push_back(0);
    let err = client
        .post::<_, Call>("/users", &serde_json::json!({}))
        .await
        .unwrap_err();
    match err {
        HttpError::Network { code, .. } => assert_eq!(code, "ECONNRESET"),
        other => panic!("Expected Network, got {:?}", other),
    }
    assert_eq!(transport.calls(), 4);
}

#[tokio::test]
async fn test_interceptors_run_once_per_call() {
    let transport = Scripted::new(200).then(&[503, 503]);
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_hook = seen.clone();

    let client = client_with(&transport)
        .retry(fast_retry(3))
        .request_interceptor(move |request: RequestConfig| -> rebound::Result<RequestConfig> {
            seen_hook.fetch_add(1, Ordering::SeqCst);
            Ok(request)
        })
        .build()
        .unwrap();

    client.get::<Call>("/users").await.unwrap();
    assert_eq!(transport.calls(), 3);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_per_attempt_timeout_is_retried() {
    let transport = Scripted::new(200).delay(Duration::from_millis(200));
    let client = client_with(&transport).retry(fast_retry(2)).build().unwrap();

    let request = RequestConfig::new(Method::GET, "/slow").with_timeout(Duration::from_millis(20));
    let err = client.send::<Call>(request).await.unwrap_err();

    assert!(matches!(err, HttpError::Timeout { .. }), "got {:?}", err);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_text_response_type() {
    let transport = Scripted::new(200);
    let client = client_with(&transport)
        .response_type(ResponseType::Text)
        .build()
        .unwrap();

    let response = client.get::<String>("/raw").await.unwrap();
    assert_eq!(response.data, r#"{"call":1}"#);
}
