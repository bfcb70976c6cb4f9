//! The transport capability the client is built on.
//!
//! A [`Transport`] executes one request and reports what came back. Any
//! status code counts as a successful execution; the client decides which
//! statuses are failures. Connection management, TLS and sockets are the
//! transport's business.
//!
//! [`ReqwestTransport`] is the default implementation.

use crate::request::{CredentialsMode, RequestBody, RequestConfig};
use crate::{HttpError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::time::Duration;

/// What a transport received.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// The HTTP status code.
    pub status: StatusCode,
    /// The reason phrase.
    pub status_text: String,
    /// The response headers.
    pub headers: HeaderMap,
    /// The raw response body.
    pub body: Bytes,
    /// The final URL of the request.
    pub url: String,
}

/// Category of a [`TransportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The request exceeded its deadline.
    Timeout,
    /// The transport observed a cancellation.
    Aborted,
    /// Anything else, including non-2xx responses.
    Other,
}

/// A raw transport failure, converted by [`transform`](crate::error::transform)
/// before anything else sees it.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    /// Transport-specific error code such as `ERR_CONNECT`.
    pub code: Option<String>,
    pub message: String,
    /// The response, when the server answered.
    pub response: Option<TransportResponse>,
}

impl TransportError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Timeout,
            code: Some("ETIMEDOUT".to_string()),
            message: message.into(),
            response: None,
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Aborted,
            code: Some("ERR_CANCELED".to_string()),
            message: message.into(),
            response: None,
        }
    }

    /// A failure where no response was received.
    pub fn network(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Other,
            code,
            message: message.into(),
            response: None,
        }
    }

    /// A non-2xx response.
    pub fn from_response(response: TransportResponse) -> Self {
        Self {
            kind: TransportErrorKind::Other,
            code: None,
            message: format!(
                "Request failed with status code {}",
                response.status.as_u16()
            ),
            response: Some(response),
        }
    }
}

/// Executes requests on behalf of the client.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use bytes::Bytes;
/// use http::{HeaderMap, StatusCode};
/// use rebound::{RequestConfig, Transport, TransportError, TransportResponse};
///
/// struct Echo;
///
/// #[async_trait]
/// impl Transport for Echo {
///     async fn execute(
///         &self,
///         request: &RequestConfig,
///     ) -> Result<TransportResponse, TransportError> {
///         Ok(TransportResponse {
///             status: StatusCode::OK,
///             status_text: "OK".to_string(),
///             headers: HeaderMap::new(),
///             body: Bytes::from(format!("\"{}\"", request.path)),
///             url: request.url(),
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Executes one attempt of `request`.
    async fn execute(
        &self,
        request: &RequestConfig,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// A [`Transport`] backed by a pooled `reqwest::Client`.
///
/// `CredentialsMode::Omit` strips `Authorization` and `Cookie` headers before
/// sending; the other modes send headers as given.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with a default `reqwest::Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be built.
    pub fn new() -> Result<Self> {
        let http_client = reqwest::Client::builder().build().map_err(|e| {
            HttpError::Configuration(format!("Failed to build HTTP client: {}", e))
        })?;
        Ok(Self { http_client })
    }

    /// Wraps an existing `reqwest::Client`.
    pub fn from_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: &RequestConfig,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let url = request.resolve_url().map_err(|e| {
            TransportError::network(
                Some("ERR_INVALID_URL".to_string()),
                format!("Invalid URL {}: {}", request.url(), e),
            )
        })?;

        tracing::debug!(
            method = %request.method,
            url = %url,
            "Executing HTTP request"
        );

        let mut builder = self.http_client.request(request.method.clone(), url);

        let omit_credentials = request.credentials == Some(CredentialsMode::Omit);
        for (name, value) in &request.headers {
            if omit_credentials && (name == http::header::AUTHORIZATION || name == http::header::COOKIE) {
                continue;
            }
            builder = builder.header(name, value);
        }

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        match &request.body {
            Some(RequestBody::Json(value)) => {
                if !request.headers.contains_key(http::header::CONTENT_TYPE) {
                    builder = builder.header(http::header::CONTENT_TYPE, "application/json");
                }
                builder = builder.body(value.to_string());
            }
            Some(RequestBody::Text(text)) => {
                builder = builder.body(text.clone());
            }
            None => {}
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout))?;

        Ok(TransportResponse {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            url,
        })
    }
}

fn map_reqwest_error(error: reqwest::Error, timeout: Option<Duration>) -> TransportError {
    if error.is_timeout() {
        let message = match timeout {
            Some(timeout) => format!("timeout of {}ms exceeded", timeout.as_millis()),
            None => error.to_string(),
        };
        return TransportError::timeout(message);
    }

    let code = if error.is_connect() {
        Some("ERR_CONNECT")
    } else if error.is_redirect() {
        Some("ERR_REDIRECT")
    } else if error.is_body() {
        Some("ERR_BODY")
    } else if error.is_decode() {
        Some("ERR_DECODE")
    } else if error.is_request() {
        Some("ERR_REQUEST")
    } else {
        None
    };
    TransportError::network(code.map(str::to_string), error.to_string())
}
