//! Retry conditions, hooks and cancellation.
//!
//! This example shows how to:
//! - Combine retry predicates
//! - Observe retries with hooks
//! - Cancel a request that is waiting out its backoff
//!
//! Run with: `cargo run --example retry_and_abort`

use rebound::retry::{OrPredicate, RetryOn5xx, RetryOnTimeout};
use rebound::{AbortController, Client, HttpError, RequestConfig, RetryConfig, RetryDelay};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), HttpError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rebound=info,retry_and_abort=info")),
        )
        .init();

    let retry = RetryConfig::new(4)
        .delay(RetryDelay::Jittered {
            base: Duration::from_millis(250),
            max: Duration::from_secs(3),
        })
        .condition(OrPredicate::new(vec![
            Box::new(RetryOn5xx),
            Box::new(RetryOnTimeout),
        ]))
        .on_retry(|error, retry| println!("  retry #{} after: {}", retry, error))
        .on_retry_failed(|error| println!("  giving up: {}", error.name()));

    let client = Client::builder()
        .base_url("https://httpbin.org")?
        .timeout(Duration::from_secs(5))
        .retry(retry)
        .build()?;

    println!("=== Exhausting retries on a 503 ===");
    match client.get::<serde_json::Value>("/status/503").await {
        Ok(_) => println!("Unexpected success"),
        Err(e) => println!("Failed with {} (retryable: {})", e.name(), e.is_retryable()),
    }

    println!("\n=== 404 is not retried ===");
    if let Err(e) = client.get::<serde_json::Value>("/status/404").await {
        println!("Failed with {} without retrying", e.name());
    }

    println!("\n=== Aborting during backoff ===");
    let controller = AbortController::new();
    let request = RequestConfig::new(http::Method::GET, "/status/500")
        .with_retry(RetryConfig::new(3).delay(RetryDelay::Fixed(Duration::from_secs(30))))
        .with_signal(controller.signal());

    let call = client.send::<serde_json::Value>(request);
    let cancel = async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        controller.abort(Some("no longer needed".to_string()));
    };
    let (result, ()) = tokio::join!(call, cancel);
    match result {
        Err(HttpError::Abort { reason, .. }) => println!("Aborted: {:?}", reason),
        other => println!("Unexpected outcome: {:?}", other.map(|r| r.status)),
    }

    Ok(())
}
