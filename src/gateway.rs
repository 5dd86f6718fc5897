// src/gateway.rs
//! HTTP front door for the router
//!
//! `POST /route/{agent_type}` with a JSON body is routed through the
//! coordinator; the worker's JSON comes back as-is, failures come back as
//! `{"status":"error","error":...,"timestamp":...}`.

use crate::coordinator::Coordinator;
use crate::routing::router::{RouteErrorKind, RouteResponse};
use crate::utils::errors::Result;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const ROUTE_PREFIX: &str = "/route/";

pub struct Gateway {
    coordinator: Arc<Coordinator>,
    listener: TcpListener,
}

impl Gateway {
    pub async fn bind(coordinator: Arc<Coordinator>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            coordinator,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Gateway listening on {}", addr);
        }
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let coordinator = Arc::clone(&self.coordinator);
                    tokio::spawn(async move {
                        debug!("Accepted connection from {}", addr);
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let coordinator = Arc::clone(&coordinator);
                            async move { handle_request(&coordinator, req).await }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
        info!("Gateway stopped");
    }
}

async fn handle_request(
    coordinator: &Coordinator,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let agent_type = match (req.method(), req.uri().path().strip_prefix(ROUTE_PREFIX)) {
        (&Method::POST, Some(agent_type)) if !agent_type.is_empty() && !agent_type.contains('/') => {
            agent_type.to_string()
        }
        _ => {
            return Ok(error_response(
                StatusCode::NOT_FOUND,
                &format!("no route for {} {}", req.method(), req.uri().path()),
            ))
        }
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                &format!("body read error: {}", e),
            ))
        }
    };

    let payload: Value = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => {
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid JSON body: {}", e),
                ))
            }
        }
    };

    let response = coordinator.route(&agent_type, &payload).await;
    let status = match &response {
        RouteResponse::Success { .. } => StatusCode::OK,
        RouteResponse::Error(error) => match error.kind {
            RouteErrorKind::UnknownAgentType => StatusCode::NOT_FOUND,
            RouteErrorKind::NoInstancesAvailable
            | RouteErrorKind::FailoverExhausted
            | RouteErrorKind::RequestFailed => StatusCode::SERVICE_UNAVAILABLE,
        },
    };

    Ok(json_response(status, &response.into_json()))
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        &json!({
            "status": "error",
            "error": message,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}
