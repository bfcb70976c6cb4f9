//! Error types for HTTP calls.
//!
//! Every failure that reaches a caller is an [`HttpError`]. Transport failures
//! are converted by [`transform`] at the boundary where they surface, so the
//! retry engine, the cache, the deduplication layer and the interceptors only
//! ever see this one type.
//!
//! Response errors keep a single [`ResponseError`] payload. Its
//! [`ResponseErrorKind`] names the well-known statuses, which makes matching on
//! a particular status exhaustive and cheap:
//!
//! ```
//! use rebound::{HttpError, ResponseErrorKind};
//!
//! fn describe(error: &HttpError) -> &'static str {
//!     match error {
//!         HttpError::Response(response) => match response.kind() {
//!             ResponseErrorKind::Unauthorized => "log in again",
//!             ResponseErrorKind::TooManyRequests => "slow down",
//!             _ => "request rejected",
//!         },
//!         HttpError::Network { .. } | HttpError::Timeout { .. } => "check the connection",
//!         HttpError::Abort { .. } => "cancelled",
//!         _ => "unexpected failure",
//!     }
//! }
//! ```

use crate::cache::CacheStoreError;
use crate::request::RequestConfig;
use crate::transport::{TransportError, TransportErrorKind};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use http::{HeaderMap, StatusCode};
use serde_json::Value;

/// Where and when an error happened.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// The originating request with credentials redacted.
    pub request: Box<RequestConfig>,
    /// When the error was created.
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    /// Captures `request` (sanitized) and the current time.
    pub fn new(request: &RequestConfig) -> Self {
        Self {
            request: Box::new(request.sanitized()),
            timestamp: Utc::now(),
        }
    }

    /// The timestamp in ISO-8601 form, e.g. `2024-05-01T12:00:00.000Z`.
    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// The main error type for HTTP calls.
///
/// This error type is `Clone`: a failure shared by deduplicated callers is
/// delivered to each of them.
#[derive(thiserror::Error, Debug, Clone)]
pub enum HttpError {
    /// No response was received (connection refused, DNS failure, reset...).
    #[error("Network error ({code}): {message}")]
    Network {
        /// Description from the transport.
        message: String,
        /// Transport error code, `"UNKNOWN"` when the transport gave none.
        code: String,
        /// Request and timestamp.
        context: ErrorContext,
    },

    /// The request exceeded its deadline.
    #[error("Request timed out: {message}")]
    Timeout {
        /// Description from the transport.
        message: String,
        /// Request and timestamp.
        context: ErrorContext,
    },

    /// The caller cancelled the request.
    #[error("Request aborted")]
    Abort {
        /// Reason given to the abort controller.
        reason: Option<String>,
        /// Request and timestamp.
        context: ErrorContext,
    },

    /// The server answered with a non-2xx status.
    #[error(transparent)]
    Response(Box<ResponseError>),

    /// A transport failure that fits no other category.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
        /// Request and timestamp.
        context: ErrorContext,
    },

    /// Failed to deserialize the response body into the expected type.
    ///
    /// The raw body is kept so the payload can be inspected when debugging.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
        /// Request and timestamp.
        context: ErrorContext,
    },

    /// Failed to serialize the request body.
    #[error("Failed to serialize request: {0}")]
    Serialization(String),

    /// Invalid configuration was provided.
    ///
    /// This indicates a problem with how the client or request was configured,
    /// such as invalid header values.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The cache store failed and the cache is configured to fail closed.
    #[error("Cache store error: {0}")]
    Cache(#[from] CacheStoreError),
}

/// Discriminant of [`HttpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    Abort,
    Response,
    Transport,
    Deserialization,
    Serialization,
    Configuration,
    InvalidUrl,
    Cache,
}

impl HttpError {
    /// Returns the error's discriminant.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HttpError::Network { .. } => ErrorKind::Network,
            HttpError::Timeout { .. } => ErrorKind::Timeout,
            HttpError::Abort { .. } => ErrorKind::Abort,
            HttpError::Response(_) => ErrorKind::Response,
            HttpError::Transport { .. } => ErrorKind::Transport,
            HttpError::DeserializationFailed { .. } => ErrorKind::Deserialization,
            HttpError::Serialization(_) => ErrorKind::Serialization,
            HttpError::Configuration(_) => ErrorKind::Configuration,
            HttpError::InvalidUrl(_) => ErrorKind::InvalidUrl,
            HttpError::Cache(_) => ErrorKind::Cache,
        }
    }

    /// Returns the canonical error name, e.g. `HttpNotFoundError`.
    pub fn name(&self) -> &'static str {
        match self {
            HttpError::Network { .. } => "HttpNetworkError",
            HttpError::Timeout { .. } => "HttpTimeoutError",
            HttpError::Abort { .. } => "HttpAbortError",
            HttpError::Response(response) => response.kind().name(),
            HttpError::Transport { .. } => "HttpError",
            HttpError::DeserializationFailed { .. } => "HttpDeserializationError",
            HttpError::Serialization(_) => "HttpSerializationError",
            HttpError::Configuration(_) => "HttpConfigurationError",
            HttpError::InvalidUrl(_) => "HttpInvalidUrlError",
            HttpError::Cache(_) => "HttpCacheError",
        }
    }

    /// Returns `true` if this error is potentially retryable.
    ///
    /// Network errors, timeouts, 5xx and 429 responses are considered retryable.
    /// Other 4xx responses, aborts and client-side failures are not.
    ///
    /// # Examples
    ///
    /// ```
    /// use rebound::{HttpError, RequestConfig};
    /// use rebound::error::ErrorContext;
    ///
    /// let request = RequestConfig::default();
    /// let err = HttpError::Timeout {
    ///     message: "deadline exceeded".to_string(),
    ///     context: ErrorContext::new(&request),
    /// };
    /// assert!(err.is_retryable());
    ///
    /// let err = HttpError::Abort { reason: None, context: ErrorContext::new(&request) };
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Network { .. } => true,
            HttpError::Timeout { .. } => true,
            HttpError::Response(response) => {
                response.status.is_server_error()
                    || response.status == StatusCode::TOO_MANY_REQUESTS
            }
            HttpError::Abort { .. } => false,
            HttpError::Transport { .. } => false,
            HttpError::DeserializationFailed { .. } => false,
            HttpError::Serialization(_) => false,
            HttpError::Configuration(_) => false,
            HttpError::InvalidUrl(_) => false,
            HttpError::Cache(_) => false,
        }
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Response(response) => Some(response.status),
            HttpError::DeserializationFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            HttpError::Response(response) => Some(&response.raw_body),
            HttpError::DeserializationFailed { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }

    /// Returns the response headers if a response was received.
    pub fn headers(&self) -> Option<&HeaderMap> {
        match self {
            HttpError::Response(response) => Some(&response.headers),
            _ => None,
        }
    }

    /// Returns the request context for errors tied to a request.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            HttpError::Network { context, .. }
            | HttpError::Timeout { context, .. }
            | HttpError::Abort { context, .. }
            | HttpError::Transport { context, .. }
            | HttpError::DeserializationFailed { context, .. } => Some(context),
            HttpError::Response(response) => Some(&response.context),
            HttpError::Serialization(_)
            | HttpError::Configuration(_)
            | HttpError::InvalidUrl(_)
            | HttpError::Cache(_) => None,
        }
    }

    /// Returns the sanitized originating request.
    pub fn request(&self) -> Option<&RequestConfig> {
        self.context().map(|context| context.request.as_ref())
    }

    /// Returns when the error happened, in ISO-8601 form.
    pub fn timestamp_iso(&self) -> Option<String> {
        self.context().map(ErrorContext::timestamp_iso)
    }

    pub(crate) fn abort(reason: Option<String>, request: &RequestConfig) -> Self {
        HttpError::Abort {
            reason,
            context: ErrorContext::new(request),
        }
    }
}

/// Well-known response statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    UnprocessableEntity,
    TooManyRequests,
    InternalServerError,
    ServiceUnavailable,
    /// Any status without a dedicated kind.
    Other,
}

impl ResponseErrorKind {
    /// Maps a status to its kind.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            400 => ResponseErrorKind::BadRequest,
            401 => ResponseErrorKind::Unauthorized,
            403 => ResponseErrorKind::Forbidden,
            404 => ResponseErrorKind::NotFound,
            409 => ResponseErrorKind::Conflict,
            422 => ResponseErrorKind::UnprocessableEntity,
            429 => ResponseErrorKind::TooManyRequests,
            500 => ResponseErrorKind::InternalServerError,
            503 => ResponseErrorKind::ServiceUnavailable,
            _ => ResponseErrorKind::Other,
        }
    }

    /// The status fixed by this kind; `None` for [`ResponseErrorKind::Other`].
    pub const fn status(self) -> Option<StatusCode> {
        match self {
            ResponseErrorKind::BadRequest => Some(StatusCode::BAD_REQUEST),
            ResponseErrorKind::Unauthorized => Some(StatusCode::UNAUTHORIZED),
            ResponseErrorKind::Forbidden => Some(StatusCode::FORBIDDEN),
            ResponseErrorKind::NotFound => Some(StatusCode::NOT_FOUND),
            ResponseErrorKind::Conflict => Some(StatusCode::CONFLICT),
            ResponseErrorKind::UnprocessableEntity => Some(StatusCode::UNPROCESSABLE_ENTITY),
            ResponseErrorKind::TooManyRequests => Some(StatusCode::TOO_MANY_REQUESTS),
            ResponseErrorKind::InternalServerError => Some(StatusCode::INTERNAL_SERVER_ERROR),
            ResponseErrorKind::ServiceUnavailable => Some(StatusCode::SERVICE_UNAVAILABLE),
            ResponseErrorKind::Other => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ResponseErrorKind::BadRequest => "HttpBadRequestError",
            ResponseErrorKind::Unauthorized => "HttpUnauthorizedError",
            ResponseErrorKind::Forbidden => "HttpForbiddenError",
            ResponseErrorKind::NotFound => "HttpNotFoundError",
            ResponseErrorKind::Conflict => "HttpConflictError",
            ResponseErrorKind::UnprocessableEntity => "HttpUnprocessableEntityError",
            ResponseErrorKind::TooManyRequests => "HttpTooManyRequestsError",
            ResponseErrorKind::InternalServerError => "HttpInternalServerError",
            ResponseErrorKind::ServiceUnavailable => "HttpServiceUnavailableError",
            ResponseErrorKind::Other => "HttpResponseError",
        }
    }
}

/// A non-2xx response.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{message}")]
pub struct ResponseError {
    /// The HTTP status code
    pub status: StatusCode,
    /// The reason phrase sent with the status.
    pub status_text: String,
    /// The body parsed as JSON, a JSON string when it is not JSON, or null
    /// when empty.
    pub body: Value,
    /// The raw response body
    pub raw_body: String,
    /// The response headers
    pub headers: HeaderMap,
    pub message: String,
    /// Request and timestamp.
    pub context: ErrorContext,
}

impl ResponseError {
    /// The well-known kind of this response's status.
    pub fn kind(&self) -> ResponseErrorKind {
        ResponseErrorKind::from_status(self.status)
    }
}

/// Converts a transport failure into an [`HttpError`].
///
/// Timeouts and cancellations are recognized first; then any failure that
/// carries a response becomes a [`HttpError::Response`]; everything else is a
/// [`HttpError::Network`] error.
pub fn transform(error: TransportError, request: &RequestConfig) -> HttpError {
    let context = ErrorContext::new(request);
    match error.kind {
        TransportErrorKind::Timeout => {
            return HttpError::Timeout {
                message: error.message,
                context,
            }
        }
        TransportErrorKind::Aborted => {
            return HttpError::Abort {
                reason: Some(error.message),
                context,
            }
        }
        TransportErrorKind::Other => {}
    }

    match error.response {
        Some(response) => {
            let raw_body = String::from_utf8_lossy(&response.body).into_owned();
            HttpError::Response(Box::new(ResponseError {
                status: response.status,
                status_text: response.status_text,
                body: parse_body(&response.body),
                raw_body,
                headers: response.headers,
                message: error.message,
                context,
            }))
        }
        None => HttpError::Network {
            message: error.message,
            code: error.code.unwrap_or_else(|| "UNKNOWN".to_string()),
            context,
        },
    }
}

fn parse_body(body: &Bytes) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// A specialized `Result` type for HTTP calls.
pub type Result<T> = std::result::Result<T, HttpError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportResponse;
    use http::{HeaderValue, Method};

    fn response(status: u16, body: &'static str) -> TransportResponse {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        TransportResponse {
            status: StatusCode::from_u16(status).unwrap(),
            status_text: String::new(),
            headers,
            body: Bytes::from_static(body.as_bytes()),
            url: "/users".to_string(),
        }
    }

    #[test]
    fn test_not_found_is_specialized() {
        let request = RequestConfig::new(Method::GET, "/users/9");
        let error = transform(
            TransportError::from_response(response(404, r#"{"error":"missing"}"#)),
            &request,
        );

        match &error {
            HttpError::Response(response) => {
                assert_eq!(response.kind(), ResponseErrorKind::NotFound);
                assert_eq!(response.kind().status(), Some(StatusCode::NOT_FOUND));
                assert_eq!(response.status.as_u16(), 404);
                assert_eq!(response.body["error"], "missing");
                assert_eq!(response.headers["content-type"], "application/json");
            }
            other => panic!("Expected Response error, got {:?}", other),
        }
        assert_eq!(error.kind(), ErrorKind::Response);
        assert_eq!(error.name(), "HttpNotFoundError");
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_unlisted_status_is_generic_response_error() {
        let request = RequestConfig::new(Method::GET, "/teapot");
        let error = transform(
            TransportError::from_response(response(418, "short and stout")),
            &request,
        );

        match &error {
            HttpError::Response(response) => {
                assert_eq!(response.kind(), ResponseErrorKind::Other);
                assert_eq!(response.kind().status(), None);
                assert_eq!(response.status.as_u16(), 418);
                assert_eq!(response.body, Value::String("short and stout".to_string()));
            }
            other => panic!("Expected Response error, got {:?}", other),
        }
        assert_eq!(error.name(), "HttpResponseError");
    }

    #[test]
    fn test_every_well_known_status_round_trips() {
        for code in [400u16, 401, 403, 404, 409, 422, 429, 500, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            let kind = ResponseErrorKind::from_status(status);
            assert_ne!(kind, ResponseErrorKind::Other);
            assert_eq!(kind.status(), Some(status));
        }
    }

    #[test]
    fn test_network_error_defaults_code_to_unknown() {
        let request = RequestConfig::new(Method::GET, "/users");
        let error = transform(TransportError::network(None, "socket hang up"), &request);
        match &error {
            HttpError::Network { code, message, .. } => {
                assert_eq!(code, "UNKNOWN");
                assert_eq!(message, "socket hang up");
            }
            other => panic!("Expected Network error, got {:?}", other),
        }

        let error = transform(
            TransportError::network(Some("ECONNREFUSED".to_string()), "refused"),
            &request,
        );
        assert!(matches!(error, HttpError::Network { ref code, .. } if code == "ECONNREFUSED"));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_timeout_and_abort_take_precedence() {
        let request = RequestConfig::new(Method::GET, "/slow");
        let timeout = transform(TransportError::timeout("deadline of 10ms exceeded"), &request);
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let aborted = transform(TransportError::aborted("canceled"), &request);
        match aborted {
            HttpError::Abort { reason, .. } => assert_eq!(reason.as_deref(), Some("canceled")),
            other => panic!("Expected Abort error, got {:?}", other),
        }
    }

    #[test]
    fn test_context_carries_sanitized_request_and_timestamp() {
        let request = RequestConfig::new(Method::GET, "/me")
            .with_header("authorization", "Bearer secret")
            .unwrap();
        let error = transform(TransportError::network(None, "down"), &request);

        let captured = error.request().unwrap();
        assert_eq!(captured.headers["authorization"], "[REDACTED]");
        assert_eq!(captured.path, "/me");

        let timestamp = error.timestamp_iso().unwrap();
        assert!(DateTime::parse_from_rfc3339(&timestamp).is_ok());
        assert!(timestamp.ends_with('Z'));
    }

    #[test]
    fn test_empty_error_body_is_null() {
        let request = RequestConfig::new(Method::DELETE, "/users/1");
        let error = transform(TransportError::from_response(response(500, "")), &request);
        match error {
            HttpError::Response(response) => {
                assert_eq!(response.body, Value::Null);
                assert_eq!(response.kind(), ResponseErrorKind::InternalServerError);
            }
            other => panic!("Expected Response error, got {:?}", other),
        }
    }
}
