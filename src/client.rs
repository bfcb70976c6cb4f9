//! HTTP client with caching, deduplication and retries.
//!
//! The [`Client`] type is the main entry point for making HTTP requests.
//! Use [`ClientBuilder`] to configure and create clients.

use crate::cache::{CacheConfig, CacheLayer, CacheManager};
use crate::dedup::{DeduplicationConfig, DeduplicationLayer, DeduplicationManager};
use crate::interceptor::{
    InterceptorHandle, InterceptorRegistry, RequestInterceptor, ResponseInterceptor,
};
use crate::pipeline::{Handler, RawResponse, TransportHandler};
use crate::request::{join_url, CredentialsMode, RequestConfig, RequestDefaults, ResponseType};
use crate::retry::{RetryConfig, RetryLayer};
use crate::transport::{ReqwestTransport, Transport};
use crate::{HttpError, Response, Result};
use http::{HeaderName, HeaderValue, Method};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// An HTTP client that layers caching, deduplication and retries over a
/// [`Transport`].
///
/// The client is designed to be reused across multiple requests. Clones share
/// the same cache, in-flight map and interceptors; separate clients never
/// share state unless they are given the same cache store.
///
/// # Examples
///
/// ```no_run
/// use rebound::{CacheConfig, Client, DeduplicationConfig, Response, RetryConfig, RetryDelay};
/// use std::time::Duration;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize)]
/// struct CreateUser {
///     name: String,
///     email: String,
/// }
///
/// #[derive(Deserialize)]
/// struct User {
///     id: u64,
///     name: String,
///     email: String,
/// }
///
/// # async fn example() -> Result<(), rebound::HttpError> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .timeout(Duration::from_secs(30))
///     .retry(RetryConfig::new(3).delay(RetryDelay::Exponential {
///         base: Duration::from_millis(100),
///         max: Some(Duration::from_secs(10)),
///     }))
///     .deduplication(DeduplicationConfig::enabled())
///     .cache(CacheConfig::memory())
///     .build()?;
///
/// // GET request, cached for a minute
/// let user: Response<User> = client.get("/users/123").await?;
/// println!("User: {}", user.data.name);
///
/// // POST request, invalidates cached /users entries
/// let new_user = CreateUser {
///     name: "Alice".to_string(),
///     email: "alice@example.com".to_string(),
/// };
/// let created: Response<User> = client.post("/users", &new_user).await?;
/// println!("Created user with ID: {}", created.data.id);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    defaults: RequestDefaults,
    pipeline: Arc<dyn Handler>,
    interceptors: InterceptorRegistry,
    cache: Option<Arc<CacheManager>>,
    deduplication: Arc<DeduplicationManager>,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rebound::Client;
    ///
    /// # fn example() -> Result<(), rebound::HttpError> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Sends a request and deserializes the response body into `T`.
    ///
    /// This is the main method for making requests; the per-verb helpers all
    /// end up here.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rebound::{Client, RequestConfig, RetryConfig};
    /// use http::Method;
    /// use serde::Deserialize;
    /// use std::time::Duration;
    ///
    /// #[derive(Deserialize)]
    /// struct SearchResults { results: Vec<String> }
    ///
    /// # async fn example() -> Result<(), rebound::HttpError> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    ///
    /// let request = RequestConfig::new(Method::GET, "/search")
    ///     .with_query_param("q", "rust")
    ///     .with_timeout(Duration::from_secs(5))
    ///     .with_retry(RetryConfig::new(2))
    ///     .without_cache();
    ///
    /// let response = client.send::<SearchResults>(request).await?;
    /// println!("Found {} results", response.data.results.len());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn send<T>(&self, request: RequestConfig) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        self.send_raw(request).await?.decode()
    }

    /// Sends a request and returns the undecoded body.
    pub async fn send_raw(&self, request: RequestConfig) -> Result<RawResponse> {
        let request = request.merged_with(&self.inner.defaults);
        let outcome = self.dispatch(request).await;
        self.inner.interceptors.run_response(outcome).await
    }

    async fn dispatch(&self, request: RequestConfig) -> Result<RawResponse> {
        let request = self.inner.interceptors.run_request(request).await?;

        let Some(signal) = request.signal.clone() else {
            return self.inner.pipeline.handle(request).await;
        };

        if signal.is_aborted() {
            return Err(HttpError::abort(signal.reason(), &request));
        }

        let context = request.clone();
        tokio::select! {
            reason = signal.aborted() => {
                tracing::debug!(
                    method = %context.method,
                    url = %context.url(),
                    "Request aborted"
                );
                Err(HttpError::abort(reason, &context))
            }
            outcome = self.inner.pipeline.handle(request) => outcome,
        }
    }

    pub async fn get<T>(&self, path: impl Into<String>) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        self.send(RequestConfig::new(Method::GET, path)).await
    }

    pub async fn post<B, T>(&self, path: impl Into<String>, body: &B) -> Result<Response<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = RequestConfig::new(Method::POST, path).with_json_body(body)?;
        self.send(request).await
    }

    pub async fn put<B, T>(&self, path: impl Into<String>, body: &B) -> Result<Response<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = RequestConfig::new(Method::PUT, path).with_json_body(body)?;
        self.send(request).await
    }

    pub async fn patch<B, T>(&self, path: impl Into<String>, body: &B) -> Result<Response<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = RequestConfig::new(Method::PATCH, path).with_json_body(body)?;
        self.send(request).await
    }

    pub async fn delete<T>(&self, path: impl Into<String>) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        self.send(RequestConfig::new(Method::DELETE, path)).await
    }

    /// Sends a HEAD request. Any body is discarded.
    pub async fn head(&self, path: impl Into<String>) -> Result<Response<()>> {
        let response = self.send_raw(RequestConfig::new(Method::HEAD, path)).await?;
        Ok(response.map(|_| ()))
    }

    /// Sends an OPTIONS request. Any body is discarded.
    pub async fn options(&self, path: impl Into<String>) -> Result<Response<()>> {
        let response = self
            .send_raw(RequestConfig::new(Method::OPTIONS, path))
            .await?;
        Ok(response.map(|_| ()))
    }

    /// Registers a request interceptor and returns a handle for removing it.
    pub fn add_request_interceptor(
        &self,
        interceptor: impl RequestInterceptor + 'static,
    ) -> InterceptorHandle {
        self.inner.interceptors.add_request(Arc::new(interceptor))
    }

    /// Registers a response interceptor and returns a handle for removing it.
    pub fn add_response_interceptor(
        &self,
        interceptor: impl ResponseInterceptor + 'static,
    ) -> InterceptorHandle {
        self.inner.interceptors.add_response(Arc::new(interceptor))
    }

    /// Removes an interceptor. Returns `false` if it was already removed.
    pub fn remove_interceptor(&self, handle: InterceptorHandle) -> bool {
        self.inner.interceptors.remove(handle)
    }

    /// The cache manager, when caching is configured.
    pub fn cache(&self) -> Option<&CacheManager> {
        self.inner.cache.as_deref()
    }

    /// Removes every cached response. A no-op without a cache.
    pub async fn clear_cache(&self) -> Result<()> {
        if let Some(cache) = &self.inner.cache {
            cache.clear().await?;
        }
        Ok(())
    }

    /// Removes cached responses for `url` and everything below it. Relative
    /// paths are joined to the client's base URL.
    pub async fn invalidate_cache(&self, url: &str) -> Result<usize> {
        match &self.inner.cache {
            Some(cache) => {
                let url = join_url(self.inner.defaults.base_url.as_deref(), url);
                Ok(cache.invalidate(&url).await?)
            }
            None => Ok(0),
        }
    }

    /// Number of deduplicated executions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.deduplication.in_flight()
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use rebound::{CacheConfig, ClientBuilder, CredentialsMode, RetryConfig};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), rebound::HttpError> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com")?
///     .default_header("User-Agent", "my-app/1.0")?
///     .default_header("Authorization", "Bearer token")?
///     .credentials(CredentialsMode::Include)
///     .timeout(Duration::from_secs(30))
///     .retry(RetryConfig::new(3))
///     .cache(CacheConfig::memory().ttl(Duration::from_secs(120)))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    defaults: RequestDefaults,
    transport: Option<Arc<dyn Transport>>,
    retry: RetryConfig,
    deduplication: DeduplicationConfig,
    cache: Option<CacheConfig>,
    request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
    response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings: a single attempt
    /// per request, no deduplication and no cache.
    pub fn new() -> Self {
        Self {
            defaults: RequestDefaults::default(),
            transport: None,
            retry: RetryConfig::default(),
            deduplication: DeduplicationConfig::default(),
            cache: None,
            request_interceptors: Vec::new(),
            response_interceptors: Vec::new(),
        }
    }

    /// Sets the base URL relative request paths are joined to.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        let url = Url::parse(url.as_ref())?;
        self.defaults.base_url = Some(url.to_string());
        Ok(self)
    }

    /// Adds a default header sent with every request. Request headers with
    /// the same name win.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| HttpError::Configuration(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| HttpError::Configuration(format!("Invalid header value: {}", e)))?;
        self.defaults.headers.insert(name, value);
        Ok(self)
    }

    /// Sets the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.defaults.timeout = Some(timeout);
        self
    }

    pub fn credentials(mut self, credentials: CredentialsMode) -> Self {
        self.defaults.credentials = Some(credentials);
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.defaults.response_type = Some(response_type);
        self
    }

    /// Replaces the default [`ReqwestTransport`].
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn deduplication(mut self, deduplication: DeduplicationConfig) -> Self {
        self.deduplication = deduplication;
        self
    }

    /// Enables response caching.
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn request_interceptor(mut self, interceptor: impl RequestInterceptor + 'static) -> Self {
        self.request_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn response_interceptor(mut self, interceptor: impl ResponseInterceptor + 'static) -> Self {
        self.response_interceptors.push(Arc::new(interceptor));
        self
    }

    /// Builds the client and assembles its request pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the default transport cannot be created.
    pub fn build(self) -> Result<Client> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };

        let mut pipeline: Arc<dyn Handler> = Arc::new(TransportHandler::new(transport));
        pipeline = Arc::new(RetryLayer::new(pipeline, self.retry));

        let deduplication = Arc::new(DeduplicationManager::new(self.deduplication.ttl));
        pipeline = Arc::new(DeduplicationLayer::new(
            pipeline,
            deduplication.clone(),
            self.deduplication,
        ));

        let cache = match self.cache {
            Some(config) => {
                let manager = Arc::new(CacheManager::new(config.store.clone(), config.ttl));
                pipeline = Arc::new(CacheLayer::new(pipeline, manager.clone(), config));
                Some(manager)
            }
            None => None,
        };

        let interceptors = InterceptorRegistry::default();
        for interceptor in self.request_interceptors {
            interceptors.add_request(interceptor);
        }
        for interceptor in self.response_interceptors {
            interceptors.add_response(interceptor);
        }

        Ok(Client {
            inner: Arc::new(ClientInner {
                defaults: self.defaults,
                pipeline,
                interceptors,
                cache,
                deduplication,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
