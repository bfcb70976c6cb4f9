//! In-flight request deduplication.
//!
//! Concurrent calls that produce the same key share one execution and each
//! receives a clone of its result. The in-flight map only holds weak handles:
//! once every caller waiting on an execution has gone away the execution is
//! dropped and its entry removed.

use crate::keys::{deduplication_key, KeyGenerator};
use crate::pipeline::{Handler, RawResponse};
use crate::request::RequestConfig;
use crate::Result;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type SharedExecution = Shared<BoxFuture<'static, Result<RawResponse>>>;
type WeakExecution = WeakShared<BoxFuture<'static, Result<RawResponse>>>;
type InFlightMap = HashMap<String, InFlight>;

/// Deduplication settings.
///
/// # Examples
///
/// ```
/// use rebound::DeduplicationConfig;
/// use std::time::Duration;
///
/// let dedup = DeduplicationConfig::enabled()
///     .critical_headers(["Authorization"])
///     .ttl(Duration::from_secs(30));
/// assert!(dedup.enabled);
/// ```
#[derive(Clone, Default)]
pub struct DeduplicationConfig {
    /// Off by default.
    pub enabled: bool,
    /// Replaces [`deduplication_key`].
    pub key_generator: Option<KeyGenerator>,
    /// In-flight executions older than this are not joined.
    pub ttl: Option<Duration>,
    /// Headers that distinguish otherwise identical requests.
    pub critical_headers: Vec<String>,
}

impl DeduplicationConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&RequestConfig) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn critical_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    fn key_for(&self, request: &RequestConfig) -> String {
        match &self.key_generator {
            Some(generator) => generator(request),
            None => deduplication_key(request, &self.critical_headers),
        }
    }
}

impl fmt::Debug for DeduplicationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeduplicationConfig")
            .field("enabled", &self.enabled)
            .field("key_generator", &self.key_generator.is_some())
            .field("ttl", &self.ttl)
            .field("critical_headers", &self.critical_headers)
            .finish()
    }
}

struct InFlight {
    id: u64,
    started: Instant,
    execution: WeakExecution,
}

/// Removes its entry when the execution settles or is torn down, unless a
/// newer execution has taken the key.
struct EntryGuard {
    map: Arc<Mutex<InFlightMap>>,
    key: String,
    id: u64,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        let removed = {
            let mut map = self.map.lock();
            match map.get(&self.key) {
                Some(entry) if entry.id == self.id => map.remove(&self.key),
                _ => None,
            }
        };
        drop(removed);
    }
}

/// Shares in-flight executions between callers with the same key.
pub struct DeduplicationManager {
    in_flight: Arc<Mutex<InFlightMap>>,
    next_id: AtomicU64,
    ttl: Option<Duration>,
}

impl DeduplicationManager {
    /// Creates a manager. Executions older than `ttl` are not joined.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            ttl,
        }
    }

    /// Runs `executor` unless an execution for `key` is already in flight, in
    /// which case the caller waits for that one instead.
    pub async fn deduplicate<F, Fut>(&self, key: String, executor: F) -> Result<RawResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RawResponse>> + Send + 'static,
    {
        let execution = self.join_or_start(key, executor);
        execution.await
    }

    fn join_or_start<F, Fut>(&self, key: String, executor: F) -> SharedExecution
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RawResponse>> + Send + 'static,
    {
        let mut map = self.in_flight.lock();

        let joinable = map
            .get(&key)
            .filter(|entry| match self.ttl {
                Some(ttl) => entry.started.elapsed() <= ttl,
                None => true,
            })
            .and_then(|entry| entry.execution.upgrade());
        if let Some(execution) = joinable {
            tracing::debug!(key = %key, "Joining in-flight request");
            return execution;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = EntryGuard {
            map: self.in_flight.clone(),
            key: key.clone(),
            id,
        };
        let future = executor();
        let execution = async move {
            let _guard = guard;
            future.await
        }
        .boxed()
        .shared();

        if let Some(weak) = execution.downgrade() {
            let replaced = map.insert(
                key,
                InFlight {
                    id,
                    started: Instant::now(),
                    execution: weak,
                },
            );
            drop(map);
            drop(replaced);
        }
        execution
    }

    /// Number of executions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Forgets every in-flight execution. Running executions still deliver
    /// their result to the callers already waiting on them.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.in_flight.lock());
        drop(entries);
    }
}

impl Default for DeduplicationManager {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Joins identical concurrent requests before they reach the retry loop.
pub(crate) struct DeduplicationLayer {
    inner: Arc<dyn Handler>,
    manager: Arc<DeduplicationManager>,
    config: DeduplicationConfig,
}

impl DeduplicationLayer {
    pub(crate) fn new(
        inner: Arc<dyn Handler>,
        manager: Arc<DeduplicationManager>,
        config: DeduplicationConfig,
    ) -> Self {
        Self {
            inner,
            manager,
            config,
        }
    }
}

#[async_trait]
impl Handler for DeduplicationLayer {
    async fn handle(&self, request: RequestConfig) -> Result<RawResponse> {
        if !request.deduplication.unwrap_or(self.config.enabled) {
            return self.inner.handle(request).await;
        }

        let key = self.config.key_for(&request);
        let inner = self.inner.clone();
        self.manager
            .deduplicate(key, move || async move { inner.handle(request).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use crate::HttpError;
    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode};
    use std::sync::atomic::AtomicUsize;

    fn ok(body: &'static str) -> Result<RawResponse> {
        Ok(RawResponse::new(
            Bytes::from_static(body.as_bytes()),
            StatusCode::OK,
            "OK",
            HeaderMap::new(),
            RequestConfig::default(),
            "http://localhost/",
        ))
    }

    fn counted(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
        outcome: Result<RawResponse>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<RawResponse>> {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(delay).await;
                outcome
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let manager = DeduplicationManager::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(50);

        let (a, b, c) = tokio::join!(
            manager.deduplicate("k".into(), counted(&calls, delay, ok("one"))),
            manager.deduplicate("k".into(), counted(&calls, delay, ok("two"))),
            manager.deduplicate("k".into(), counted(&calls, delay, ok("three"))),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap().data, "one");
        assert_eq!(b.unwrap().data, "one");
        assert_eq!(c.unwrap().data, "one");
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared_too() {
        let manager = DeduplicationManager::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let failure = Err(crate::error::transform(
            TransportError::network(None, "reset"),
            &RequestConfig::default(),
        ));

        let (a, b) = tokio::join!(
            manager.deduplicate(
                "k".into(),
                counted(&calls, Duration::from_millis(20), failure)
            ),
            manager.deduplicate(
                "k".into(),
                counted(&calls, Duration::from_millis(20), ok("unused"))
            ),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(a, Err(HttpError::Network { .. })));
        assert!(matches!(b, Err(HttpError::Network { .. })));
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let manager = DeduplicationManager::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(20);

        let (a, b) = tokio::join!(
            manager.deduplicate("a".into(), counted(&calls, delay, ok("a"))),
            manager.deduplicate("b".into(), counted(&calls, delay, ok("b"))),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(a.unwrap().data, "a");
        assert_eq!(b.unwrap().data, "b");
    }

    #[tokio::test]
    async fn test_settled_execution_is_not_reused() {
        let manager = DeduplicationManager::default();
        let calls = Arc::new(AtomicUsize::new(0));

        manager
            .deduplicate("k".into(), counted(&calls, Duration::ZERO, ok("first")))
            .await
            .unwrap();
        let second = manager
            .deduplicate("k".into(), counted(&calls, Duration::ZERO, ok("second")))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.data, "second");
    }

    #[tokio::test]
    async fn test_cancelled_callers_tear_down_entry() {
        let manager = Arc::new(DeduplicationManager::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let task = {
            let manager = manager.clone();
            let executor = counted(&calls, Duration::from_secs(30), ok("slow"));
            tokio::spawn(async move { manager.deduplicate("k".into(), executor).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.in_flight(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(manager.in_flight(), 0);

        let fresh = manager
            .deduplicate("k".into(), counted(&calls, Duration::ZERO, ok("fresh")))
            .await
            .unwrap();
        assert_eq!(fresh.data, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_entry_is_not_joined() {
        let manager = DeduplicationManager::new(Some(Duration::from_millis(10)));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = manager.deduplicate(
            "k".into(),
            counted(&calls, Duration::from_millis(100), ok("first")),
        );
        let second = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            manager
                .deduplicate("k".into(), counted(&calls, Duration::ZERO, ok("second")))
                .await
        };

        let (first, second) = tokio::join!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(first.unwrap().data, "first");
        assert_eq!(second.unwrap().data, "second");
        assert_eq!(manager.in_flight(), 0);
    }

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Counting {
        async fn handle(&self, request: RequestConfig) -> Result<RawResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(RawResponse::new(
                Bytes::new(),
                StatusCode::OK,
                "OK",
                HeaderMap::new(),
                request,
                "http://localhost/",
            ))
        }
    }

    #[tokio::test]
    async fn test_layer_respects_per_request_opt_out() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let layer = DeduplicationLayer::new(
            inner.clone(),
            Arc::new(DeduplicationManager::default()),
            DeduplicationConfig::enabled(),
        );

        let merged = RequestConfig::new(Method::GET, "/users");
        let opted_out = RequestConfig::new(Method::GET, "/users").with_deduplication(false);
        let (a, b, c) = tokio::join!(
            layer.handle(merged.clone()),
            layer.handle(merged),
            layer.handle(opted_out),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
