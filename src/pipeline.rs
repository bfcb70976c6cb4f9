//! The handler chain every request passes through.
//!
//! [`ClientBuilder::build`](crate::ClientBuilder::build) assembles the chain
//! once: `CacheLayer(DeduplicationLayer(RetryLayer(TransportHandler)))`. Each
//! layer owns the next one and nothing is patched at runtime.

use crate::error::transform;
use crate::request::RequestConfig;
use crate::response::Response;
use crate::transport::{Transport, TransportError};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

/// A response whose body has not been decoded yet.
pub type RawResponse = Response<Bytes>;

/// One stage of the request pipeline.
#[async_trait]
pub(crate) trait Handler: Send + Sync {
    async fn handle(&self, request: RequestConfig) -> Result<RawResponse>;
}

/// The innermost stage: one transport attempt.
///
/// Applies the per-attempt timeout, turns non-2xx responses into errors and
/// converts every transport failure with [`transform`].
pub(crate) struct TransportHandler {
    transport: Arc<dyn Transport>,
}

impl TransportHandler {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Handler for TransportHandler {
    async fn handle(&self, request: RequestConfig) -> Result<RawResponse> {
        let start = Instant::now();

        let outcome = match request.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.transport.execute(&request)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(TransportError::timeout(format!(
                        "timeout of {}ms exceeded",
                        timeout.as_millis()
                    ))),
                }
            }
            None => self.transport.execute(&request).await,
        };

        let response = outcome.map_err(|e| transform(e, &request))?;
        let status = response.status;

        tracing::info!(
            status = status.as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Received HTTP response"
        );

        if status.is_success() {
            return Ok(Response::from_transport(response, request));
        }

        if status.is_client_error() {
            tracing::error!(
                status = status.as_u16(),
                method = %request.method,
                url = %request.url(),
                "Client error response"
            );
        } else {
            tracing::warn!(
                status = status.as_u16(),
                method = %request.method,
                url = %request.url(),
                "Server error response"
            );
        }

        Err(transform(TransportError::from_response(response), &request))
    }
}
