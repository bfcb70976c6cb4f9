//! Caching and deduplication against a public API.
//!
//! This example shows how to:
//! - Cache GET responses and tell cache hits apart
//! - Merge concurrent identical requests into one network call
//! - Invalidate cached responses with a POST
//!
//! Run with: `cargo run --example cached_client`

use rebound::{CacheConfig, Client, DeduplicationConfig, HttpError, RetryConfig, RetryDelay};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Post {
    #[serde(rename = "userId")]
    user_id: u32,
    id: u32,
    title: String,
}

#[derive(Debug, Serialize)]
struct NewPost {
    title: String,
    body: String,
    #[serde(rename = "userId")]
    user_id: u32,
}

#[tokio::main]
async fn main() -> Result<(), HttpError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rebound=debug,cached_client=info")),
        )
        .init();

    let client = Client::builder()
        .base_url("https://jsonplaceholder.typicode.com")?
        .timeout(Duration::from_secs(10))
        .retry(RetryConfig::new(3).delay(RetryDelay::Exponential {
            base: Duration::from_millis(200),
            max: Some(Duration::from_secs(2)),
        }))
        .deduplication(DeduplicationConfig::enabled())
        .cache(CacheConfig::memory().ttl(Duration::from_secs(30)))
        .build()?;

    println!("=== Cache ===");
    let first = client.get::<Vec<Post>>("/posts").await?;
    println!("Fetched {} posts in {:?}", first.data.len(), first.latency);

    let second = client.get::<Vec<Post>>("/posts").await?;
    println!("Second call served from cache: {}", second.is_cached());

    println!("\n=== Deduplication ===");
    let (a, b, c) = tokio::join!(
        client.get::<Post>("/posts/1"),
        client.get::<Post>("/posts/1"),
        client.get::<Post>("/posts/1"),
    );
    println!("Three callers, same post: {}", a?.data.title);
    println!("Also delivered to callers two and three: {}", b.is_ok() && c.is_ok());

    println!("\n=== Invalidation ===");
    let created = client
        .post::<_, serde_json::Value>(
            "/posts",
            &NewPost {
                title: "rebound".to_string(),
                body: "cached, deduplicated, retried".to_string(),
                user_id: 1,
            },
        )
        .await?;
    println!("Created post {}", created.data["id"]);

    let after = client.get::<Vec<Post>>("/posts").await?;
    println!("GET /posts after POST served from cache: {}", after.is_cached());

    Ok(())
}
