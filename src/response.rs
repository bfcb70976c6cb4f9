//! Response wrapper that preserves both parsed data and response details.
//!
//! Inside the client every layer passes a [`Response<Bytes>`] around (the raw
//! body). The body is deserialized into the caller's type only at the very
//! end, after the response interceptors have run.

use crate::error::ErrorContext;
use crate::request::{RequestConfig, ResponseType};
use crate::transport::TransportResponse;
use crate::{HttpError, Result};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// A successful HTTP response.
///
/// # Type Parameters
///
/// * `T` - The type of the deserialized response data
///
/// # Examples
///
/// ```no_run
/// use rebound::Client;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct User {
///     id: u64,
///     name: String,
/// }
///
/// # async fn example() -> Result<(), rebound::HttpError> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// let response = client.get::<User>("/users/123").await?;
///
/// println!("User: {}", response.data.name);
/// println!("Status: {} ok={}", response.status, response.ok);
/// println!("Request took {:?} over {} attempt(s)", response.latency, response.attempts);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The deserialized response data.
    pub data: T,

    /// The HTTP status code of the response.
    pub status: StatusCode,

    /// The reason phrase sent with the status.
    pub status_text: String,

    /// `true` when `status` is in `200..=299`.
    pub ok: bool,

    /// The response headers.
    pub headers: HeaderMap,

    /// The request that produced this response.
    pub request: RequestConfig,

    /// The URL the response came from.
    pub url: String,

    /// The total latency of the request, including all retry attempts.
    pub latency: Duration,

    /// The number of attempts made to complete this request.
    ///
    /// `1` for requests that succeeded on the first try, higher for requests
    /// that required retries, and `0` for responses served from the cache.
    pub attempts: u32,
}

impl<T> Response<T> {
    /// Creates a new `Response`. `ok` is derived from `status`.
    pub fn new(
        data: T,
        status: StatusCode,
        status_text: impl Into<String>,
        headers: HeaderMap,
        request: RequestConfig,
        url: impl Into<String>,
    ) -> Self {
        Self {
            data,
            status,
            status_text: status_text.into(),
            ok: status.is_success(),
            headers,
            request,
            url: url.into(),
            latency: Duration::ZERO,
            attempts: 1,
        }
    }

    /// Maps the response data to a different type using the provided function.
    ///
    /// # Examples
    ///
    /// ```
    /// # use rebound::{RequestConfig, Response};
    /// # use http::{HeaderMap, StatusCode};
    /// let response = Response::new(
    ///     42,
    ///     StatusCode::OK,
    ///     "OK",
    ///     HeaderMap::new(),
    ///     RequestConfig::default(),
    ///     "/answer",
    /// );
    ///
    /// let string_response = response.map(|n| n.to_string());
    /// assert_eq!(string_response.data, "42");
    /// ```
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            status: self.status,
            status_text: self.status_text,
            ok: self.ok,
            headers: self.headers,
            request: self.request,
            url: self.url,
            latency: self.latency,
            attempts: self.attempts,
        }
    }

    /// Returns `true` if the request required retries.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns `true` if the response was served from the cache.
    pub fn is_cached(&self) -> bool {
        self.attempts == 0
    }

    /// Returns a header value by name.
    ///
    /// # Examples
    ///
    /// ```
    /// # use rebound::{RequestConfig, Response};
    /// # use http::{HeaderMap, HeaderValue, StatusCode};
    /// let mut headers = HeaderMap::new();
    /// headers.insert("content-type", HeaderValue::from_static("application/json"));
    ///
    /// let response = Response::new((), StatusCode::OK, "OK", headers, RequestConfig::default(), "/");
    ///
    /// assert_eq!(response.header("Content-Type"), Some("application/json"));
    /// ```
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

impl Response<Bytes> {
    pub(crate) fn from_transport(response: TransportResponse, request: RequestConfig) -> Self {
        let url = if response.url.is_empty() {
            request.url()
        } else {
            response.url
        };
        Response::new(
            response.body,
            response.status,
            response.status_text,
            response.headers,
            request,
            url,
        )
    }

    /// Returns the body as lossy UTF-8 text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Deserializes the body according to the request's response type.
    ///
    /// An empty body decodes as JSON `null`, so `()`, `Option<_>` and
    /// `serde_json::Value` accept `204 No Content` responses.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::DeserializationFailed`] if the body does not fit `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Response<T>> {
        let response_type = self.request.response_type.unwrap_or_default();
        let decoded = match response_type {
            ResponseType::Json if self.data.is_empty() => serde_json::from_value(Value::Null),
            ResponseType::Json => serde_json::from_slice(&self.data),
            ResponseType::Text => serde_json::from_value(Value::String(self.text())),
            ResponseType::Bytes => serde_json::from_value(Value::Array(
                self.data.iter().map(|byte| Value::from(*byte)).collect(),
            )),
        };

        match decoded {
            Ok(data) => Ok(self.map(|_| data)),
            Err(e) => {
                let raw_response = self.text();
                tracing::error!(
                    error = %e,
                    raw_response = %raw_response,
                    "Failed to deserialize response"
                );

                Err(HttpError::DeserializationFailed {
                    raw_response,
                    serde_error: e.to_string(),
                    status: self.status,
                    context: ErrorContext::new(&self.request),
                })
            }
        }
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
