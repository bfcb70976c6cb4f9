//! Request and response interceptors.
//!
//! Interceptors run outside the cache, deduplication and retry layers: request
//! interceptors see each call once before it enters the pipeline, response
//! interceptors see its final outcome.
//!
//! Each chain threads a `Result` through its interceptors in registration
//! order. A successful value goes to the fulfilled hook (`on_request`,
//! `on_response`), an error goes to the rejected hook (`on_request_error`,
//! `on_error`), which may recover by returning `Ok`.
//!
//! Request interceptor ordering follows registration today, but callers
//! should not rely on it.

use crate::pipeline::RawResponse;
use crate::request::RequestConfig;
use crate::{HttpError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transforms requests before they are sent.
///
/// Synchronous closures `Fn(RequestConfig) -> Result<RequestConfig>`
/// implement this trait.
///
/// # Examples
///
/// ```
/// use rebound::{Client, RequestConfig};
///
/// # fn example() -> Result<(), rebound::HttpError> {
/// let client = Client::builder()
///     .request_interceptor(|request: RequestConfig| {
///         request.with_header("x-request-source", "dashboard")
///     })
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn on_request(&self, request: RequestConfig) -> Result<RequestConfig>;

    /// Called when an earlier request interceptor failed.
    async fn on_request_error(&self, error: HttpError) -> Result<RequestConfig> {
        Err(error)
    }
}

#[async_trait]
impl<F> RequestInterceptor for F
where
    F: Fn(RequestConfig) -> Result<RequestConfig> + Send + Sync,
{
    async fn on_request(&self, request: RequestConfig) -> Result<RequestConfig> {
        self(request)
    }
}

/// Observes or rewrites outcomes before they reach the caller.
///
/// Synchronous closures `Fn(RawResponse) -> Result<RawResponse>` implement
/// this trait; [`recover`] builds one from an error handler.
#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    async fn on_response(&self, response: RawResponse) -> Result<RawResponse> {
        Ok(response)
    }

    /// Called with the error of a failed call, or one raised by an earlier
    /// interceptor. Returning `Ok` recovers.
    async fn on_error(&self, error: HttpError) -> Result<RawResponse> {
        Err(error)
    }
}

#[async_trait]
impl<F> ResponseInterceptor for F
where
    F: Fn(RawResponse) -> Result<RawResponse> + Send + Sync,
{
    async fn on_response(&self, response: RawResponse) -> Result<RawResponse> {
        self(response)
    }
}

/// A response interceptor that only handles errors.
pub struct Recover<F> {
    handler: F,
}

/// Builds a response interceptor from an error handler.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use rebound::interceptor::recover;
/// use rebound::{HttpError, Response};
/// use http::HeaderMap;
///
/// // Serve an empty list when the endpoint is missing.
/// let fallback = recover(|error: HttpError| match error.status() {
///     Some(status) if status.as_u16() == 404 => {
///         let request = error.request().cloned().unwrap_or_default();
///         let url = request.url();
///         Ok(Response::new(Bytes::from_static(b"[]"), http::StatusCode::OK, "OK", HeaderMap::new(), request, url))
///     }
///     _ => Err(error),
/// });
/// ```
pub fn recover<F>(handler: F) -> Recover<F>
where
    F: Fn(HttpError) -> Result<RawResponse> + Send + Sync,
{
    Recover { handler }
}

#[async_trait]
impl<F> ResponseInterceptor for Recover<F>
where
    F: Fn(HttpError) -> Result<RawResponse> + Send + Sync,
{
    async fn on_error(&self, error: HttpError) -> Result<RawResponse> {
        (self.handler)(error)
    }
}

/// Identifies a registered interceptor for [`remove`](InterceptorRegistry::remove).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorHandle(u64);

/// The interceptors registered on one client.
#[derive(Default)]
pub(crate) struct InterceptorRegistry {
    next_id: AtomicU64,
    request: RwLock<Vec<(InterceptorHandle, Arc<dyn RequestInterceptor>)>>,
    response: RwLock<Vec<(InterceptorHandle, Arc<dyn ResponseInterceptor>)>>,
}

impl InterceptorRegistry {
    fn next_handle(&self) -> InterceptorHandle {
        InterceptorHandle(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn add_request(&self, interceptor: Arc<dyn RequestInterceptor>) -> InterceptorHandle {
        let handle = self.next_handle();
        self.request.write().push((handle, interceptor));
        handle
    }

    pub(crate) fn add_response(&self, interceptor: Arc<dyn ResponseInterceptor>) -> InterceptorHandle {
        let handle = self.next_handle();
        self.response.write().push((handle, interceptor));
        handle
    }

    /// Returns `false` if nothing was registered under `handle`.
    pub(crate) fn remove(&self, handle: InterceptorHandle) -> bool {
        let mut request = self.request.write();
        let before = request.len();
        request.retain(|(h, _)| *h != handle);
        if request.len() != before {
            return true;
        }
        drop(request);

        let mut response = self.response.write();
        let before = response.len();
        response.retain(|(h, _)| *h != handle);
        response.len() != before
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> (usize, usize) {
        (self.request.read().len(), self.response.read().len())
    }

    pub(crate) async fn run_request(&self, request: RequestConfig) -> Result<RequestConfig> {
        let chain: Vec<Arc<dyn RequestInterceptor>> = self
            .request
            .read()
            .iter()
            .map(|(_, interceptor)| interceptor.clone())
            .collect();

        let mut state = Ok(request);
        for interceptor in chain {
            state = match state {
                Ok(request) => interceptor.on_request(request).await,
                Err(error) => interceptor.on_request_error(error).await,
            };
        }
        state
    }

    pub(crate) async fn run_response(&self, outcome: Result<RawResponse>) -> Result<RawResponse> {
        let chain: Vec<Arc<dyn ResponseInterceptor>> = self
            .response
            .read()
            .iter()
            .map(|(_, interceptor)| interceptor.clone())
            .collect();

        let mut state = outcome;
        for interceptor in chain {
            state = match state {
                Ok(response) => interceptor.on_response(response).await,
                Err(error) => interceptor.on_error(error).await,
            };
        }
        state
    }
}
