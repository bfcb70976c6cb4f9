//! Canonical request keys shared by the cache and the deduplication layer.
//!
//! Keys are `::`-separated. The first field is the method and the second is
//! the request URL (base URL joined with the path), which is what
//! [`url_of_key`] reads back during cache invalidation.

use crate::request::{RequestBody, RequestConfig};
use std::sync::Arc;

const SEPARATOR: &str = "::";

/// Replaces a built-in key generator.
///
/// # Examples
///
/// ```
/// use rebound::keys::KeyGenerator;
/// use rebound::RequestConfig;
/// use std::sync::Arc;
///
/// let by_path: KeyGenerator = Arc::new(|request: &RequestConfig| format!("GET::{}", request.path));
/// ```
pub type KeyGenerator = Arc<dyn Fn(&RequestConfig) -> String + Send + Sync>;

/// Cache key: `METHOD::URL::sorted-query`. The body never contributes.
pub fn cache_key(request: &RequestConfig) -> String {
    let url = request.url();
    let query = sorted_query(request);
    [request.method.as_str(), url.as_str(), query.as_str()].join(SEPARATOR)
}

/// Deduplication key: `METHOD::URL::sorted-query::body::critical-headers`.
///
/// Only headers named in `critical_headers` take part, compared
/// case-insensitively. A critical header the request does not carry renders
/// with an empty value, so its presence and absence produce different keys.
pub fn deduplication_key(request: &RequestConfig, critical_headers: &[String]) -> String {
    let body = match &request.body {
        Some(RequestBody::Text(text)) => text.clone(),
        Some(RequestBody::Json(value)) => value.to_string(),
        None => String::new(),
    };

    let mut names: Vec<String> = critical_headers
        .iter()
        .map(|name| name.to_ascii_lowercase())
        .collect();
    names.sort();
    names.dedup();

    let headers = names
        .iter()
        .map(|name| {
            let values: Vec<&str> = request
                .headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect();
            format!("{}:{}", name, values.join(","))
        })
        .collect::<Vec<_>>()
        .join("|");

    let url = request.url();
    let query = sorted_query(request);
    [
        request.method.as_str(),
        url.as_str(),
        query.as_str(),
        body.as_str(),
        headers.as_str(),
    ]
    .join(SEPARATOR)
}

/// Returns the URL segment of a key built by this module.
pub fn url_of_key(key: &str) -> Option<&str> {
    let (_, rest) = key.split_once(SEPARATOR)?;
    // Bracketed IPv6 hosts contain `::`.
    let from = match rest.find("://[") {
        Some(start) => rest[start..].find(']').map_or(0, |end| start + end + 1),
        None => 0,
    };
    match rest[from..].find(SEPARATOR) {
        Some(end) => Some(&rest[..from + end]),
        None => Some(rest),
    }
}

fn sorted_query(request: &RequestConfig) -> String {
    let mut pairs: Vec<(&String, String)> = request
        .query
        .iter()
        .map(|(key, value)| (key, value.to_string()))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use serde_json::json;

    #[test]
    fn test_cache_key_sorts_query() {
        let a = RequestConfig::new(Method::GET, "/users")
            .with_query_param("page", 2)
            .with_query_param("filter", "active");
        let b = RequestConfig::new(Method::GET, "/users")
            .with_query_param("filter", "active")
            .with_query_param("page", 2);

        assert_eq!(cache_key(&a), cache_key(&b));
        assert_eq!(cache_key(&a), r#"GET::/users::filter="active"&page=2"#);
    }

    #[test]
    fn test_cache_key_ignores_body() {
        let a = RequestConfig::new(Method::GET, "/search").with_text_body("one");
        let b = RequestConfig::new(Method::GET, "/search").with_text_body("two");
        assert_eq!(cache_key(&a), cache_key(&b));
    }

    #[test]
    fn test_dedup_key_includes_body_and_method() {
        let a = RequestConfig::new(Method::POST, "/items")
            .with_json_body(&json!({"id": 1}))
            .unwrap();
        let b = RequestConfig::new(Method::POST, "/items")
            .with_json_body(&json!({"id": 2}))
            .unwrap();
        let c = RequestConfig::new(Method::PUT, "/items")
            .with_json_body(&json!({"id": 1}))
            .unwrap();

        assert_ne!(deduplication_key(&a, &[]), deduplication_key(&b, &[]));
        assert_ne!(deduplication_key(&a, &[]), deduplication_key(&c, &[]));
        assert_eq!(deduplication_key(&a, &[]), r#"POST::/items::::{"id":1}::"#);
    }

    #[test]
    fn test_dedup_key_uses_only_critical_headers() {
        let critical = vec!["Authorization".to_string()];
        let a = RequestConfig::new(Method::GET, "/me")
            .with_header("authorization", "Bearer a")
            .unwrap()
            .with_header("x-trace-id", "1")
            .unwrap();
        let b = RequestConfig::new(Method::GET, "/me")
            .with_header("Authorization", "Bearer a")
            .unwrap()
            .with_header("x-trace-id", "2")
            .unwrap();
        let c = RequestConfig::new(Method::GET, "/me")
            .with_header("Authorization", "Bearer b")
            .unwrap();

        assert_eq!(deduplication_key(&a, &critical), deduplication_key(&b, &critical));
        assert_ne!(deduplication_key(&a, &critical), deduplication_key(&c, &critical));
        assert!(deduplication_key(&a, &critical).ends_with("::authorization:Bearer a"));
    }

    #[test]
    fn test_dedup_key_sorts_critical_headers() {
        let request = RequestConfig::new(Method::GET, "/me")
            .with_header("x-tenant", "t1")
            .unwrap();
        let key = deduplication_key(
            &request,
            &["X-Tenant".to_string(), "Accept-Language".to_string()],
        );
        assert!(key.ends_with("::accept-language:|x-tenant:t1"));
    }

    #[test]
    fn test_url_of_key() {
        let request = RequestConfig::new(Method::GET, "/users/1").with_query_param("q", "x");
        assert_eq!(url_of_key(&cache_key(&request)), Some("/users/1"));
        assert_eq!(url_of_key("garbage"), None);

        let absolute = RequestConfig::new(Method::GET, "/users/1")
            .with_base_url("http://api.example.com:8080")
            .with_query_param("tags", json!(["a", "b"]));
        assert_eq!(
            url_of_key(&cache_key(&absolute)),
            Some("http://api.example.com:8080/users/1")
        );

        let ipv6 = RequestConfig::new(Method::GET, "/users").with_base_url("http://[::1]:3000");
        assert_eq!(url_of_key(&cache_key(&ipv6)), Some("http://[::1]:3000/users"));
        assert_eq!(
            url_of_key(&deduplication_key(&ipv6, &[])),
            Some("http://[::1]:3000/users")
        );
    }

    #[test]
    fn test_keys_include_base_url() {
        let a = RequestConfig::new(Method::GET, "/users").with_base_url("http://tenant-a");
        let b = RequestConfig::new(Method::GET, "/users").with_base_url("http://tenant-b");

        assert_ne!(cache_key(&a), cache_key(&b));
        assert_ne!(deduplication_key(&a, &[]), deduplication_key(&b, &[]));
        assert_eq!(cache_key(&a), "GET::http://tenant-a/users::");
    }
}
