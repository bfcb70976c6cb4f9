//! Request configuration types.
//!
//! A [`RequestConfig`] describes one outbound request. It is a plain value:
//! interceptors and the retry engine never mutate a config in place, they
//! build a new one with the `with_*` methods.

use crate::abort::AbortSignal;
use crate::retry::RetryConfig;
use crate::{HttpError, Result};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Header names whose values are replaced by [`RequestConfig::sanitized`].
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
];

const REDACTED: &str = "[REDACTED]";

/// Credentials mode for cross-origin requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    /// Never send credentials.
    Omit,
    /// Send credentials to the same origin only.
    #[default]
    SameOrigin,
    /// Always send credentials.
    Include,
}

/// How the response body is interpreted before it is deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Parse the body as JSON.
    #[default]
    Json,
    /// Treat the body as UTF-8 text (decodes into `String`).
    Text,
    /// Hand over the raw bytes (decodes into `Vec<u8>`).
    Bytes,
}

/// A request body.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// A JSON document, sent with `content-type: application/json`.
    Json(Value),
    /// A pre-encoded text payload, sent as-is.
    Text(String),
}

impl RequestBody {
    /// Returns the body as it appears on the wire.
    pub fn to_wire_string(&self) -> String {
        match self {
            RequestBody::Json(value) => value.to_string(),
            RequestBody::Text(text) => text.clone(),
        }
    }
}

/// Per-request cache options.
///
/// Leaving `RequestConfig::cache` unset means "use the client's cache
/// configuration".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCacheOptions {
    /// `false` bypasses both cache lookup and cache population for this call.
    pub enabled: bool,
    /// Overrides the client-level TTL for the entry written by this call.
    pub ttl: Option<Duration>,
}

impl RequestCacheOptions {
    /// Options that skip the cache entirely for one call.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ttl: None,
        }
    }

    /// Options that cache this call's response for `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            enabled: true,
            ttl: Some(ttl),
        }
    }
}

impl Default for RequestCacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: None,
        }
    }
}

/// Configuration for a single HTTP request.
///
/// Unset optional fields fall back to the client defaults when the request
/// is sent.
///
/// # Examples
///
/// ```
/// use rebound::RequestConfig;
/// use http::Method;
///
/// let request = RequestConfig::new(Method::GET, "/users")
///     .with_query_param("page", 2)
///     .with_header("Authorization", "Bearer token")
///     .unwrap();
///
/// assert_eq!(request.path, "/users");
/// assert_eq!(request.query["page"], 2);
/// ```
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// The HTTP method.
    pub method: Method,

    /// Base URL prepended to `path` unless `path` is already absolute.
    pub base_url: Option<String>,

    /// The request path, or an absolute URL.
    pub path: String,

    /// Request headers.
    pub headers: HeaderMap,

    /// Query parameters. Strings are sent verbatim, arrays repeat the key,
    /// nulls are dropped and every other value is sent in its JSON form.
    pub query: HashMap<String, Value>,

    /// Optional request body.
    pub body: Option<RequestBody>,

    /// Deadline for a single attempt.
    pub timeout: Option<Duration>,

    /// Credentials mode.
    pub credentials: Option<CredentialsMode>,

    /// Expected response type.
    pub response_type: Option<ResponseType>,

    /// Retry override for this request.
    pub retry: Option<RetryConfig>,

    /// Cache override for this request.
    pub cache: Option<RequestCacheOptions>,

    /// Deduplication override for this request.
    pub deduplication: Option<bool>,

    /// Cancellation signal for this request.
    pub signal: Option<AbortSignal>,
}

impl RequestConfig {
    /// Creates a new `RequestConfig` with the given method and path.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            base_url: None,
            path: path.into(),
            headers: HeaderMap::new(),
            query: HashMap::new(),
            body: None,
            timeout: None,
            credentials: None,
            response_type: None,
            retry: None,
            cache: None,
            deduplication: None,
            signal: None,
        }
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| HttpError::Configuration(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| HttpError::Configuration(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Adds a query parameter to the request.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Adds multiple query parameters to the request.
    pub fn with_query_params<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Serialization`] if `body` cannot be represented as JSON.
    pub fn with_json_body<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        let value =
            serde_json::to_value(body).map_err(|e| HttpError::Serialization(e.to_string()))?;
        self.body = Some(RequestBody::Json(value));
        Ok(self)
    }

    /// Sets a pre-encoded text body.
    pub fn with_text_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(RequestBody::Text(body.into()));
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = Some(response_type);
        self
    }

    /// Replaces the client retry configuration for this request.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Replaces the client cache behavior for this request.
    pub fn with_cache(mut self, cache: RequestCacheOptions) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Bypasses the response cache for this request.
    pub fn without_cache(self) -> Self {
        self.with_cache(RequestCacheOptions::disabled())
    }

    /// Enables or disables deduplication for this request.
    pub fn with_deduplication(mut self, enabled: bool) -> Self {
        self.deduplication = Some(enabled);
        self
    }

    /// Attaches a cancellation signal.
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Returns `true` for verbs that modify server state and therefore
    /// invalidate cached responses.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }

    /// Returns the request URL without the query string.
    ///
    /// Absolute paths are returned unchanged, relative paths are joined to
    /// `base_url` with exactly one `/` between them.
    pub fn url(&self) -> String {
        join_url(self.base_url.as_deref(), &self.path)
    }

    /// Joins another path to this request's base URL, the way
    /// [`url`](Self::url) joins `path`.
    pub fn url_for(&self, path: &str) -> String {
        join_url(self.base_url.as_deref(), path)
    }

    /// Resolves the absolute URL including the query string.
    ///
    /// Query parameters are appended in key order.
    ///
    /// # Errors
    ///
    /// Returns an error when the joined URL is not absolute or not valid.
    pub fn resolve_url(&self) -> std::result::Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.url())?;
        if !self.query.is_empty() {
            let mut keys: Vec<&String> = self.query.keys().collect();
            keys.sort();
            let mut pairs = url.query_pairs_mut();
            for key in keys {
                match &self.query[key] {
                    Value::Null => {}
                    Value::Array(items) => {
                        for item in items {
                            pairs.append_pair(key, &query_value(item));
                        }
                    }
                    other => {
                        pairs.append_pair(key, &query_value(other));
                    }
                }
            }
        }
        Ok(url)
    }

    /// Returns a copy safe to attach to errors and logs: credentials carried
    /// in headers are replaced with a placeholder.
    pub fn sanitized(&self) -> Self {
        let mut sanitized = self.clone();
        for name in SENSITIVE_HEADERS {
            if sanitized.headers.contains_key(*name) {
                sanitized
                    .headers
                    .insert(*name, HeaderValue::from_static(REDACTED));
            }
        }
        sanitized
    }

    /// Fills every unset field from `defaults`. Headers present on both
    /// sides keep the request's value.
    pub(crate) fn merged_with(mut self, defaults: &RequestDefaults) -> Self {
        if self.base_url.is_none() {
            self.base_url = defaults.base_url.clone();
        }
        for name in defaults.headers.keys() {
            if !self.headers.contains_key(name) {
                for value in defaults.headers.get_all(name) {
                    self.headers.append(name.clone(), value.clone());
                }
            }
        }
        if self.timeout.is_none() {
            self.timeout = defaults.timeout;
        }
        if self.credentials.is_none() {
            self.credentials = defaults.credentials;
        }
        if self.response_type.is_none() {
            self.response_type = defaults.response_type;
        }
        self
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self::new(Method::GET, "")
    }
}

/// Client-level values merged into every request.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestDefaults {
    pub(crate) base_url: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) timeout: Option<Duration>,
    pub(crate) credentials: Option<CredentialsMode>,
    pub(crate) response_type: Option<ResponseType>,
}

pub(crate) fn join_url(base: Option<&str>, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    match base {
        Some(base) if !base.is_empty() => {
            let base = base.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            if path.is_empty() {
                base.to_string()
            } else {
                format!("{}/{}", base, path)
            }
        }
        _ => path.to_string(),
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
