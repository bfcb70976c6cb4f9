//! # Rebound - an HTTP client layer with caching, deduplication and retries
//!
//! Rebound wraps an HTTP transport (by default `reqwest`) in a fixed request
//! pipeline:
//!
//! ```text
//! interceptors -> cache -> deduplication -> retry -> transport
//! ```
//!
//! A fresh cache hit never reaches the network, concurrent identical requests
//! share one execution, and transient failures are retried with backoff while
//! honoring `Retry-After`. Every failure surfaces as one [`HttpError`] enum.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rebound::{CacheConfig, Client, DeduplicationConfig, RetryConfig, RetryDelay};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize)]
//! struct CreateUser {
//!     name: String,
//!     email: String,
//! }
//!
//! #[derive(Deserialize)]
//! struct User {
//!     id: u64,
//!     name: String,
//!     email: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rebound::HttpError> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")?
//!         .timeout(Duration::from_secs(30))
//!         .retry(RetryConfig::new(4).delay(RetryDelay::Jittered {
//!             base: Duration::from_millis(100),
//!             max: Duration::from_secs(10),
//!         }))
//!         .deduplication(DeduplicationConfig::enabled())
//!         .cache(CacheConfig::memory().ttl(Duration::from_secs(60)))
//!         .build()?;
//!
//!     // Make a GET request
//!     let user = client.get::<User>("/users/123").await?;
//!     println!("User: {}", user.data.name);
//!     println!("Request took {:?}", user.latency);
//!
//!     // Make a POST request; this also drops cached /users responses
//!     let new_user = CreateUser {
//!         name: "Alice".to_string(),
//!         email: "alice@example.com".to_string(),
//!     };
//!     let created = client.post::<_, User>("/users", &new_user).await?;
//!     println!("Created user with ID: {}", created.data.id);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Errors are typed at the transport boundary. Response errors carry the
//! parsed body and a [`ResponseErrorKind`] for the well-known statuses:
//!
//! ```no_run
//! use rebound::{Client, HttpError, ResponseErrorKind};
//!
//! # async fn example() -> Result<(), HttpError> {
//! # let client = Client::builder().base_url("https://api.example.com")?.build()?;
//! match client.get::<serde_json::Value>("/endpoint").await {
//!     Ok(response) => {
//!         println!("Success: {:?}", response.data);
//!     }
//!     Err(HttpError::Response(response)) if response.kind() == ResponseErrorKind::Unauthorized => {
//!         eprintln!("Log in again: {}", response.body);
//!     }
//!     Err(HttpError::DeserializationFailed { raw_response, serde_error, status, .. }) => {
//!         eprintln!("Failed to deserialize (status {}):", status);
//!         eprintln!("  Raw response: {}", raw_response);
//!         eprintln!("  Error: {}", serde_error);
//!     }
//!     Err(e) => {
//!         eprintln!("{} at {:?}: {}", e.name(), e.timestamp_iso(), e);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Retry Conditions
//!
//! Only idempotent methods are retried. The condition decides which errors
//! qualify:
//!
//! ```no_run
//! use rebound::{Client, RetryConfig, retry::{OrPredicate, RetryOn5xx, RetryOnTimeout}};
//!
//! # fn example() -> Result<(), rebound::HttpError> {
//! let client = Client::builder()
//!     .retry(
//!         RetryConfig::new(5)
//!             .condition(OrPredicate::new(vec![
//!                 Box::new(RetryOn5xx),
//!                 Box::new(RetryOnTimeout),
//!             ]))
//!             .on_retry_failed(|error| eprintln!("giving up: {}", error)),
//!     )
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod abort;
pub mod cache;
mod client;
pub mod dedup;
pub mod error;
pub mod interceptor;
pub mod keys;
mod pipeline;
mod request;
mod response;
pub mod retry;
pub mod transport;

pub use abort::{AbortController, AbortSignal};
pub use cache::{CacheConfig, CacheEntry, CacheManager, CacheStore, CacheStoreError, MemoryCacheStore};
pub use client::{Client, ClientBuilder};
pub use dedup::{DeduplicationConfig, DeduplicationManager};
pub use error::{ErrorKind, HttpError, ResponseError, ResponseErrorKind, Result};
pub use interceptor::{InterceptorHandle, RequestInterceptor, ResponseInterceptor};
pub use pipeline::RawResponse;
pub use request::{CredentialsMode, RequestBody, RequestCacheOptions, RequestConfig, ResponseType};
pub use response::Response;
pub use retry::{RetryConfig, RetryDelay, RetryPredicate};
pub use transport::{ReqwestTransport, Transport, TransportError, TransportErrorKind, TransportResponse};
