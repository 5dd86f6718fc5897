// src/routing/transport.rs
//! Forwarding requests to worker processes
//!
//! Every worker exposes `POST /api/process` (JSON in, JSON out) on its
//! assigned local port. [`HttpTransport`] reaches it through a pooled hyper
//! client; the whole exchange, body included, is bounded by one timeout.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Path every worker serves
pub const PROCESS_PATH: &str = "/api/process";

/// Why a call to a worker failed; every variant triggers failover
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to port {port} failed: {reason}")]
    Connect { port: u16, reason: String },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("worker answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("instance {0} disappeared before the call")]
    InstanceGone(String),
}

/// Sends one JSON payload to the worker on `port`
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn call(
        &self,
        port: u16,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError>;
}

/// HTTP/1 transport to local workers
pub struct HttpTransport {
    host: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpTransport {
    pub fn new(host: impl Into<String>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            host: host.into(),
            client,
        }
    }

    async fn exchange(&self, port: u16, payload: &Value) -> Result<Value, TransportError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| TransportError::InvalidResponse(format!("unserializable payload: {}", e)))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{}:{}{}", self.host, port, PROCESS_PATH))
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| TransportError::InvalidResponse(format!("request build error: {}", e)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| TransportError::Connect {
                port,
                reason: e.to_string(),
            })?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::InvalidResponse(format!("body read error: {}", e)))?
            .to_bytes();

        trace!("Worker on port {} answered {} ({} bytes)", port, status, bytes.len());

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new("127.0.0.1")
    }
}

#[async_trait]
impl WorkerTransport for HttpTransport {
    async fn call(
        &self,
        port: u16,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        tokio::time::timeout(timeout, self.exchange(port, payload))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }
}
