//! Response caching with TTL expiry.
//!
//! Only successful GET responses are cached. A successful POST, PUT, PATCH or
//! DELETE invalidates every cached entry under its URL, so `POST /users`
//! drops `/users` and `/users/42` but leaves `/users-archive` alone. Keys
//! carry the full URL, so the same path on two hosts never shares an entry.
//!
//! Entries live in a pluggable [`CacheStore`]. The [`CacheManager`] keeps an
//! index of the keys it wrote so invalidation can find them without the
//! store having to support enumeration.

use crate::keys::{cache_key, url_of_key, KeyGenerator};
use crate::pipeline::{Handler, RawResponse};
use crate::request::RequestConfig;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Default time-to-live of a cached response.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// A failure reported by a [`CacheStore`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CacheStoreError {
    message: String,
}

impl CacheStoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type StoreResult<T> = std::result::Result<T, CacheStoreError>;

/// A cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The raw response body.
    pub data: Bytes,
    pub headers: HeaderMap,
    pub status: StatusCode,
    pub status_text: String,
    /// When the entry was stored.
    pub timestamp: SystemTime,
    /// Time-to-live duration.
    pub ttl: Duration,
    /// The response's `ETag`, if it sent one.
    pub etag: Option<String>,
}

impl CacheEntry {
    /// Captures a response for caching.
    pub fn from_response(response: &RawResponse, ttl: Duration) -> Self {
        Self {
            data: response.data.clone(),
            headers: response.headers.clone(),
            status: response.status,
            status_text: response.status_text.clone(),
            timestamp: SystemTime::now(),
            ttl,
            etag: response.header("etag").map(str::to_string),
        }
    }

    /// Check if cache entry is still fresh
    pub fn is_fresh(&self) -> bool {
        match self.timestamp.elapsed() {
            Ok(elapsed) => elapsed <= self.ttl,
            Err(_) => false,
        }
    }

    /// Get age of cache entry
    pub fn age(&self) -> Option<Duration> {
        self.timestamp.elapsed().ok()
    }

    /// Rebuilds a response for `request`. Cached responses report zero attempts.
    pub fn into_response(self, request: RequestConfig) -> RawResponse {
        let url = request.url();
        let mut response = RawResponse::new(
            self.data,
            self.status,
            self.status_text,
            self.headers,
            request,
            url,
        );
        response.attempts = 0;
        response
    }
}

/// Backend storage for cached responses.
///
/// Implementations must be safe to call concurrently. `ttl` is a hint for
/// stores with native expiry; the manager checks freshness itself.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<CacheEntry>>;

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn clear(&self) -> StoreResult<()>;
}

/// In-memory [`CacheStore`] backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> StoreResult<Option<CacheEntry>> {
        Ok(self.entries.get(key).map(|entry| entry.clone()))
    }

    async fn set(&self, key: &str, entry: CacheEntry, _ttl: Duration) -> StoreResult<()> {
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Result of [`CacheManager::lookup`].
#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(CacheEntry),
    /// Present but past its TTL.
    Stale(CacheEntry),
    Miss,
}

/// Extra paths to invalidate after a mutating request.
#[derive(Clone)]
pub enum InvalidatePatterns {
    List(Vec<String>),
    Dynamic(Arc<dyn Fn(&RequestConfig) -> Vec<String> + Send + Sync>),
}

impl InvalidatePatterns {
    fn resolve(&self, request: &RequestConfig) -> Vec<String> {
        match self {
            InvalidatePatterns::List(patterns) => patterns.clone(),
            InvalidatePatterns::Dynamic(f) => f(request),
        }
    }
}

impl fmt::Debug for InvalidatePatterns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidatePatterns::List(patterns) => f.debug_tuple("List").field(patterns).finish(),
            InvalidatePatterns::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Cache settings.
///
/// # Examples
///
/// ```
/// use rebound::CacheConfig;
/// use std::time::Duration;
///
/// let cache = CacheConfig::memory()
///     .ttl(Duration::from_secs(300))
///     .respect_cache_headers(true)
///     .invalidate_patterns(["/dashboard"]);
/// ```
#[derive(Clone)]
pub struct CacheConfig {
    pub store: Arc<dyn CacheStore>,
    /// Replaces [`cache_key`].
    pub key_generator: Option<KeyGenerator>,
    /// Defaults to [`DEFAULT_TTL`].
    pub ttl: Duration,
    /// Honor `Cache-Control` on responses: `no-store`, `no-cache` and
    /// `private` skip caching, `max-age` overrides the TTL.
    pub respect_cache_headers: bool,
    /// Serve expired entries at once and refresh them in the background.
    pub stale_while_revalidate: bool,
    pub invalidate_patterns: Option<InvalidatePatterns>,
    /// Treat store failures as misses instead of failing the request.
    pub fail_open: bool,
}

impl CacheConfig {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            key_generator: None,
            ttl: DEFAULT_TTL,
            respect_cache_headers: false,
            stale_while_revalidate: false,
            invalidate_patterns: None,
            fail_open: false,
        }
    }

    /// A config backed by a fresh [`MemoryCacheStore`].
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()))
    }

    pub fn key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&RequestConfig) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn respect_cache_headers(mut self, respect: bool) -> Self {
        self.respect_cache_headers = respect;
        self
    }

    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    pub fn invalidate_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidate_patterns = Some(InvalidatePatterns::List(
            patterns.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Computes the extra patterns from each mutating request.
    pub fn invalidate_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestConfig) -> Vec<String> + Send + Sync + 'static,
    {
        self.invalidate_patterns = Some(InvalidatePatterns::Dynamic(Arc::new(f)));
        self
    }

    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    fn key_for(&self, request: &RequestConfig) -> String {
        match &self.key_generator {
            Some(generator) => generator(request),
            None => cache_key(request),
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("key_generator", &self.key_generator.is_some())
            .field("ttl", &self.ttl)
            .field("respect_cache_headers", &self.respect_cache_headers)
            .field("stale_while_revalidate", &self.stale_while_revalidate)
            .field("invalidate_patterns", &self.invalidate_patterns)
            .field("fail_open", &self.fail_open)
            .finish()
    }
}

/// Reads, writes and invalidates cached responses.
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    keys: Mutex<HashSet<String>>,
    generation: AtomicU64,
    /// Generation of the last invalidation, per key.
    invalidated: Mutex<HashMap<String, u64>>,
    cleared: AtomicU64,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            keys: Mutex::new(HashSet::new()),
            generation: AtomicU64::new(0),
            invalidated: Mutex::new(HashMap::new()),
            cleared: AtomicU64::new(0),
        }
    }

    /// Returns the entry if it is still fresh. Expired entries are deleted.
    pub async fn get(&self, key: &str) -> StoreResult<Option<CacheEntry>> {
        match self.lookup(key).await? {
            Lookup::Fresh(entry) => Ok(Some(entry)),
            Lookup::Stale(_) => {
                self.delete(key).await?;
                Ok(None)
            }
            Lookup::Miss => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but hands back expired entries as
    /// [`Lookup::Stale`] instead of deleting them.
    pub async fn lookup(&self, key: &str) -> StoreResult<Lookup> {
        match self.store.get(key).await? {
            Some(entry) if entry.is_fresh() => Ok(Lookup::Fresh(entry)),
            Some(entry) => Ok(Lookup::Stale(entry)),
            None => {
                self.keys.lock().remove(key);
                Ok(Lookup::Miss)
            }
        }
    }

    /// Stores `response` under `key`. `ttl` defaults to the manager's TTL.
    pub async fn set(
        &self,
        key: &str,
        response: &RawResponse,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let ttl = ttl.unwrap_or(self.ttl);
        let entry = CacheEntry::from_response(response, ttl);
        self.store.set(key, entry, ttl).await?;
        self.keys.lock().insert(key.to_string());
        Ok(())
    }

    /// Deletes every entry whose URL equals `url` or lies below it.
    /// Returns how many entries were removed.
    ///
    /// Keys hold the request URL joined with its base URL, so `url` must be
    /// absolute for clients configured with one.
    pub async fn invalidate(&self, url: &str) -> StoreResult<usize> {
        let pattern = url.strip_suffix('/').unwrap_or(url);
        let prefix = format!("{}/", pattern);

        let matching: Vec<String> = self
            .keys
            .lock()
            .iter()
            .filter(|key| {
                url_of_key(key)
                    .map(|key_url| key_url == pattern || key_url.starts_with(&prefix))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut invalidated = self.invalidated.lock();
            for key in &matching {
                invalidated.insert(key.clone(), generation);
            }
        }

        for key in &matching {
            self.delete(key).await?;
        }
        Ok(matching.len())
    }

    /// Removes every entry from the store.
    pub async fn clear(&self) -> StoreResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.cleared.store(generation, Ordering::SeqCst);
        self.store.clear().await?;
        self.keys.lock().clear();
        Ok(())
    }

    /// Current invalidation generation. Every `invalidate` and `clear`
    /// advances it.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn invalidated_since(&self, key: &str, generation: u64) -> bool {
        if self.cleared.load(Ordering::SeqCst) > generation {
            return true;
        }
        self.invalidated
            .lock()
            .get(key)
            .is_some_and(|at| *at > generation)
    }

    /// Stores `response` unless `key` was invalidated after `generation`.
    /// Returns whether the entry was kept.
    pub(crate) async fn set_unless_invalidated(
        &self,
        key: &str,
        response: &RawResponse,
        ttl: Option<Duration>,
        generation: u64,
    ) -> StoreResult<bool> {
        if self.invalidated_since(key, generation) {
            return Ok(false);
        }
        self.set(key, response, ttl).await?;
        // An invalidation may have landed while the write was in progress.
        if self.invalidated_since(key, generation) {
            self.delete(key).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Number of keys this manager has written and not yet removed.
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.store.delete(key).await?;
        self.keys.lock().remove(key);
        Ok(())
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("ttl", &self.ttl)
            .field("keys", &self.len())
            .finish()
    }
}

/// Returns the TTL to cache `response` with, or `None` when it must not be
/// cached.
fn storable_ttl(response: &RawResponse, ttl: Duration, respect_headers: bool) -> Option<Duration> {
    if !respect_headers {
        return Some(ttl);
    }
    let Some(cache_control) = response.header("cache-control") else {
        return Some(ttl);
    };

    let mut ttl = ttl;
    for directive in cache_control.split(',') {
        let directive = directive.trim().to_ascii_lowercase();
        match directive.as_str() {
            "no-store" | "no-cache" | "private" => return None,
            _ => {
                if let Some(seconds) = directive.strip_prefix("max-age=") {
                    match seconds.trim_matches('"').parse::<u64>() {
                        Ok(0) => return None,
                        Ok(seconds) => ttl = Duration::from_secs(seconds),
                        Err(_) => {}
                    }
                }
            }
        }
    }
    Some(ttl)
}

/// Serves GET requests from the cache and invalidates after mutations.
pub(crate) struct CacheLayer {
    inner: Arc<dyn Handler>,
    manager: Arc<CacheManager>,
    config: CacheConfig,
    refreshing: Arc<Mutex<HashSet<String>>>,
}

impl CacheLayer {
    pub(crate) fn new(inner: Arc<dyn Handler>, manager: Arc<CacheManager>, config: CacheConfig) -> Self {
        Self {
            inner,
            manager,
            config,
            refreshing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    async fn handle_get(&self, request: RequestConfig) -> Result<RawResponse> {
        let key = self.config.key_for(&request);
        let ttl = request
            .cache
            .as_ref()
            .and_then(|options| options.ttl)
            .unwrap_or(self.config.ttl);

        let lookup = if self.config.stale_while_revalidate {
            self.manager.lookup(&key).await
        } else {
            self.manager
                .get(&key)
                .await
                .map(|entry| entry.map_or(Lookup::Miss, Lookup::Fresh))
        };

        match self.tolerate(lookup, Lookup::Miss, "read")? {
            Lookup::Fresh(entry) => {
                tracing::debug!(key = %key, "Cache hit");
                return Ok(entry.into_response(request));
            }
            Lookup::Stale(entry) => {
                tracing::debug!(key = %key, "Serving stale cache entry");
                self.spawn_refresh(key, request.clone(), ttl);
                return Ok(entry.into_response(request));
            }
            Lookup::Miss => {
                tracing::debug!(key = %key, "Cache miss");
            }
        }

        let response = self.inner.handle(request).await?;
        if let Some(ttl) = storable_ttl(&response, ttl, self.config.respect_cache_headers) {
            let stored = self.manager.set(&key, &response, Some(ttl)).await;
            self.tolerate(stored, (), "write")?;
        }
        Ok(response)
    }

    async fn invalidate_after(&self, request: &RequestConfig) -> Result<()> {
        let mut patterns = vec![request.url()];
        if let Some(extra) = &self.config.invalidate_patterns {
            patterns.extend(
                extra
                    .resolve(request)
                    .iter()
                    .map(|pattern| request.url_for(pattern)),
            );
        }

        for pattern in patterns {
            let removed = self.manager.invalidate(&pattern).await;
            let removed = self.tolerate(removed, 0, "invalidate")?;
            if removed > 0 {
                tracing::debug!(pattern = %pattern, removed, "Invalidated cached responses");
            }
        }
        Ok(())
    }

    fn spawn_refresh(&self, key: String, mut request: RequestConfig, ttl: Duration) {
        if !self.refreshing.lock().insert(key.clone()) {
            return;
        }
        request.signal = None;

        let inner = self.inner.clone();
        let manager = self.manager.clone();
        let refreshing = self.refreshing.clone();
        let respect_headers = self.config.respect_cache_headers;
        let generation = self.manager.generation();

        tokio::spawn(async move {
            match inner.handle(request).await {
                Ok(response) => match storable_ttl(&response, ttl, respect_headers) {
                    Some(ttl) => {
                        match manager
                            .set_unless_invalidated(&key, &response, Some(ttl), generation)
                            .await
                        {
                            Ok(true) => {}
                            Ok(false) => {
                                tracing::debug!(key = %key, "Discarding refresh of invalidated entry");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, key = %key, "Failed to store refreshed response");
                            }
                        }
                    }
                    None => {
                        if let Err(e) = manager.delete(&key).await {
                            tracing::warn!(error = %e, key = %key, "Failed to drop uncacheable response");
                        }
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, key = %key, "Background cache refresh failed");
                }
            }
            refreshing.lock().remove(&key);
        });
    }

    fn tolerate<T>(&self, outcome: StoreResult<T>, fallback: T, operation: &'static str) -> Result<T> {
        match outcome {
            Ok(value) => Ok(value),
            Err(e) if self.config.fail_open => {
                tracing::warn!(error = %e, operation, "Cache store failed, continuing without cache");
                Ok(fallback)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Handler for CacheLayer {
    async fn handle(&self, request: RequestConfig) -> Result<RawResponse> {
        if request.method == Method::GET {
            let enabled = request.cache.as_ref().map_or(true, |options| options.enabled);
            if !enabled {
                return self.inner.handle(request).await;
            }
            return self.handle_get(request).await;
        }

        // Opting out of the cache never skips invalidation.
        if request.is_mutating() {
            let response = self.inner.handle(request.clone()).await?;
            self.invalidate_after(&request).await?;
            return Ok(response);
        }

        self.inner.handle(request).await
    }
}
