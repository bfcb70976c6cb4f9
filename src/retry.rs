//! Retry policy: when to retry, how long to wait, and the retry loop itself.
//!
//! A failed attempt is retried only while attempts remain, the method is
//! idempotent (GET, HEAD, OPTIONS, PUT, DELETE), the error is not an abort,
//! and the configured [`RetryPredicate`] accepts the error.

use crate::pipeline::{Handler, RawResponse};
use crate::request::RequestConfig;
use crate::{HttpError, Result};
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Called before each wait with the error and the retry number (1-indexed).
pub type RetryHook = Arc<dyn Fn(&HttpError, u32) + Send + Sync>;

/// Called once with the final error after at least one retry was made.
pub type RetryFailedHook = Arc<dyn Fn(&HttpError) + Send + Sync>;

/// How long to wait before a retry.
///
/// # Examples
///
/// ```
/// use rebound::RetryDelay;
/// use std::time::Duration;
///
/// // 100ms, 200ms, 400ms... capped at 2s
/// let exponential = RetryDelay::Exponential {
///     base: Duration::from_millis(100),
///     max: Some(Duration::from_secs(2)),
/// };
/// assert_eq!(exponential.delay(3, None), Duration::from_millis(400));
///
/// // 1s, 2s, 3s...
/// let linear = RetryDelay::Linear { base: Duration::from_secs(1) };
/// assert_eq!(linear.delay(2, None), Duration::from_secs(2));
/// ```
#[derive(Clone)]
pub enum RetryDelay {
    /// The same delay before every retry.
    Fixed(Duration),

    /// `base * 2^(n-1)`, capped at `max` when set.
    Exponential {
        base: Duration,
        max: Option<Duration>,
    },

    /// `base * n`.
    Linear { base: Duration },

    /// A uniformly random fraction of the capped exponential delay.
    Jittered { base: Duration, max: Duration },

    /// Computes the delay from the retry number and the error.
    Custom(Arc<dyn Fn(u32, Option<&HttpError>) -> Duration + Send + Sync>),
}

impl RetryDelay {
    /// Creates a delay computed by `f`.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32, Option<&HttpError>) -> Duration + Send + Sync + 'static,
    {
        RetryDelay::Custom(Arc::new(f))
    }

    /// Returns the delay before retry `retry` (1-indexed).
    pub fn delay(&self, retry: u32, error: Option<&HttpError>) -> Duration {
        match self {
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Exponential { base, max } => {
                let delay = exponential(*base, retry);
                match max {
                    Some(max) => delay.min(*max),
                    None => delay,
                }
            }
            RetryDelay::Linear { base } => base.saturating_mul(retry.max(1)),
            RetryDelay::Jittered { base, max } => {
                let capped = exponential(*base, retry).min(*max);
                capped.mul_f64(rand::thread_rng().gen_range(0.0..1.0))
            }
            RetryDelay::Custom(f) => f(retry, error),
        }
    }
}

fn exponential(base: Duration, retry: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(retry.saturating_sub(1));
    base.saturating_mul(multiplier)
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Fixed(Duration::ZERO)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            RetryDelay::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            RetryDelay::Linear { base } => f.debug_struct("Linear").field("base", base).finish(),
            RetryDelay::Jittered { base, max } => f
                .debug_struct("Jittered")
                .field("base", base)
                .field("max", max)
                .finish(),
            RetryDelay::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Trait for determining whether a failed request should be retried.
///
/// Implement this trait to create custom retry logic based on the error type,
/// response status, headers, or any other criteria. Closures of type
/// `Fn(&HttpError, u32) -> bool` implement it too.
///
/// # Examples
///
/// ```
/// use rebound::{HttpError, RetryPredicate};
///
/// struct RetryOnRateLimit;
///
/// impl RetryPredicate for RetryOnRateLimit {
///     fn should_retry(&self, error: &HttpError, _attempt: u32) -> bool {
///         error.status().map(|s| s.as_u16()) == Some(429)
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// Determines whether the request should be retried based on the error.
    ///
    /// # Arguments
    ///
    /// * `error` - The error that occurred
    /// * `attempt` - The attempt that failed (1-indexed)
    fn should_retry(&self, error: &HttpError, attempt: u32) -> bool;
}

impl<F> RetryPredicate for F
where
    F: Fn(&HttpError, u32) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &HttpError, attempt: u32) -> bool {
        self(error, attempt)
    }
}

/// Retry all errors that are marked as retryable.
///
/// This uses [`HttpError::is_retryable`]: network errors, timeouts, 5xx and
/// 429 responses.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnRetryable;

impl RetryPredicate for RetryOnRetryable {
    fn should_retry(&self, error: &HttpError, _attempt: u32) -> bool {
        error.is_retryable()
    }
}

/// Retry only on 5xx server errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryOn5xx;

impl RetryPredicate for RetryOn5xx {
    fn should_retry(&self, error: &HttpError, _attempt: u32) -> bool {
        matches!(error, HttpError::Response(response) if response.status.is_server_error())
    }
}

/// Retry only on timeout errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnTimeout;

impl RetryPredicate for RetryOnTimeout {
    fn should_retry(&self, error: &HttpError, _attempt: u32) -> bool {
        matches!(error, HttpError::Timeout { .. })
    }
}

/// Retry only when no response was received.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnNetworkError;

impl RetryPredicate for RetryOnNetworkError {
    fn should_retry(&self, error: &HttpError, _attempt: u32) -> bool {
        matches!(error, HttpError::Network { .. })
    }
}

/// Combine multiple retry predicates with OR logic.
///
/// Retries if ANY of the predicates return `true`.
///
/// # Examples
///
/// ```
/// use rebound::retry::{OrPredicate, RetryOn5xx, RetryOnTimeout};
///
/// // Retry on 5xx errors OR timeouts
/// let predicate = OrPredicate::new(vec![
///     Box::new(RetryOn5xx),
///     Box::new(RetryOnTimeout),
/// ]);
/// ```
pub struct OrPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl OrPredicate {
    /// Creates a new `OrPredicate` from a list of predicates.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for OrPredicate {
    fn should_retry(&self, error: &HttpError, attempt: u32) -> bool {
        self.predicates
            .iter()
            .any(|p| p.should_retry(error, attempt))
    }
}

/// Combine multiple retry predicates with AND logic.
///
/// Retries only if ALL of the predicates return `true`.
///
/// # Examples
///
/// ```
/// use rebound::retry::{AndPredicate, RetryOn5xx};
/// use rebound::HttpError;
///
/// // Retry on 5xx errors, but only after the first attempt
/// let predicate = AndPredicate::new(vec![
///     Box::new(RetryOn5xx),
///     Box::new(|_: &HttpError, attempt: u32| attempt < 2),
/// ]);
/// ```
pub struct AndPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl AndPredicate {
    /// Creates a new `AndPredicate` from a list of predicates.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for AndPredicate {
    fn should_retry(&self, error: &HttpError, attempt: u32) -> bool {
        self.predicates
            .iter()
            .all(|p| p.should_retry(error, attempt))
    }
}

/// Retry settings, set on the client and overridable per request.
///
/// The default makes a single attempt.
///
/// # Examples
///
/// ```
/// use rebound::{RetryConfig, RetryDelay};
/// use std::time::Duration;
///
/// let retry = RetryConfig::new(3)
///     .delay(RetryDelay::Exponential {
///         base: Duration::from_millis(100),
///         max: Some(Duration::from_secs(5)),
///     })
///     .max_retry_after(Duration::from_secs(30))
///     .on_retry(|error, retry| eprintln!("retry {} after {}", retry, error));
/// ```
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts including the first. `0` behaves like `1`.
    pub attempts: u32,
    /// Delay between attempts.
    pub delay: RetryDelay,
    /// Overrides the default [`RetryOnRetryable`] condition.
    pub condition: Option<Arc<dyn RetryPredicate>>,
    pub on_retry: Option<RetryHook>,
    pub on_retry_failed: Option<RetryFailedHook>,
    /// Wait as long as a 429 or 503 response's `Retry-After` asks.
    pub respect_retry_after: bool,
    /// Upper bound for a `Retry-After` delay.
    pub max_retry_after: Option<Duration>,
}

impl RetryConfig {
    /// Creates a config allowing `attempts` total attempts.
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    /// A config that never retries.
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn delay(mut self, delay: RetryDelay) -> Self {
        self.delay = delay;
        self
    }

    pub fn condition(mut self, condition: impl RetryPredicate + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HttpError, u32) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn on_retry_failed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HttpError) + Send + Sync + 'static,
    {
        self.on_retry_failed = Some(Arc::new(hook));
        self
    }

    pub fn respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    pub fn max_retry_after(mut self, max: Duration) -> Self {
        self.max_retry_after = Some(max);
        self
    }

    /// Decides whether to retry after `retries_made` retries have already
    /// been spent.
    pub fn should_retry(&self, error: &HttpError, method: &Method, retries_made: u32) -> bool {
        if retries_made >= self.attempts.max(1) - 1 {
            return false;
        }
        if !is_idempotent(method) {
            return false;
        }
        if matches!(error, HttpError::Abort { .. }) {
            return false;
        }
        match &self.condition {
            Some(condition) => condition.should_retry(error, retries_made + 1),
            None => RetryOnRetryable.should_retry(error, retries_made + 1),
        }
    }

    /// Returns the wait before retry `retry` (1-indexed).
    ///
    /// A `Retry-After` header on a 429 or 503 response takes precedence over
    /// the configured delay when `respect_retry_after` is set.
    pub fn delay_for(&self, error: &HttpError, retry: u32) -> Duration {
        if self.respect_retry_after {
            if let Some(wait) = retry_after_of(error) {
                return match self.max_retry_after {
                    Some(max) => wait.min(max),
                    None => wait,
                };
            }
        }
        self.delay.delay(retry, Some(error))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 1,
            delay: RetryDelay::default(),
            condition: None,
            on_retry: None,
            on_retry_failed: None,
            respect_retry_after: true,
            max_retry_after: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("attempts", &self.attempts)
            .field("delay", &self.delay)
            .field("condition", &self.condition.as_ref().map(|_| ".."))
            .field("on_retry", &self.on_retry.is_some())
            .field("on_retry_failed", &self.on_retry_failed.is_some())
            .field("respect_retry_after", &self.respect_retry_after)
            .field("max_retry_after", &self.max_retry_after)
            .finish()
    }
}

/// Returns `true` for methods that are safe to repeat.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
    )
}

fn retry_after_of(error: &HttpError) -> Option<Duration> {
    match error {
        HttpError::Response(response)
            if response.status == StatusCode::TOO_MANY_REQUESTS
                || response.status == StatusCode::SERVICE_UNAVAILABLE =>
        {
            parse_retry_after(&response.headers)
        }
        _ => None,
    }
}

/// Parses a `Retry-After` header given as seconds or as an HTTP date.
///
/// A date in the past yields a zero delay.
///
/// # Examples
///
/// ```
/// use rebound::retry::parse_retry_after;
/// use http::HeaderMap;
/// use std::time::Duration;
///
/// let mut headers = HeaderMap::new();
/// headers.insert("retry-after", "60".parse().unwrap());
/// assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(60)));
/// ```
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = header.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date_time = httpdate::parse_http_date(header).ok()?;
    Some(
        date_time
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

/// Runs the inner handler until it succeeds or the policy gives up.
pub(crate) struct RetryLayer {
    inner: Arc<dyn Handler>,
    config: RetryConfig,
}

impl RetryLayer {
    pub(crate) fn new(inner: Arc<dyn Handler>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl Handler for RetryLayer {
    async fn handle(&self, request: RequestConfig) -> Result<RawResponse> {
        let config = request.retry.as_ref().unwrap_or(&self.config).clone();
        let start = Instant::now();
        let mut retries = 0u32;

        loop {
            let attempt = retries + 1;
            match self.inner.handle(request.clone()).await {
                Ok(mut response) => {
                    response.attempts = attempt;
                    response.latency = start.elapsed();
                    return Ok(response);
                }
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        attempt,
                        method = %request.method,
                        url = %request.url(),
                        "Request failed"
                    );

                    if !config.should_retry(&error, &request.method, retries) {
                        if retries > 0 {
                            if let Some(hook) = &config.on_retry_failed {
                                hook(&error);
                            }
                        }
                        return Err(error);
                    }

                    retries += 1;
                    let delay = config.delay_for(&error, retries);
                    if let Some(hook) = &config.on_retry {
                        hook(&error, retries);
                    }

                    tracing::info!(
                        delay_ms = delay.as_millis() as u64,
                        attempt = retries + 1,
                        url = %request.url(),
                        "Retrying request after delay"
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
