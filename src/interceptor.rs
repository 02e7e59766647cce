//! Request pipeline stages wrapped around the protected API.
//!
//! `rate_limit` turns an admission verdict into forward / 429 / 500,
//! `log_request` writes the access log, and `recover_panic` keeps a panicking
//! handler from taking the connection down without a response.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::admission::{AdmissionController, Verdict};
use crate::config::FailurePolicy;
use crate::identity;

pub const TOO_MANY_REQUESTS_MESSAGE: &str = "Too many requests.";
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error.";

/// JSON body of every response this layer produces itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub message: String,
}

impl ErrorBody {
    pub fn error(message: &str) -> Self {
        Self {
            status: "error".to_string(),
            message: message.to_string(),
        }
    }
}

/// 429 with `{"status":"error","message":"Too many requests."}`
pub fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorBody::error(TOO_MANY_REQUESTS_MESSAGE)),
    )
        .into_response()
}

/// 500 that says nothing about the cause
pub fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody::error(INTERNAL_ERROR_MESSAGE)),
    )
        .into_response()
}

/// Admission stage: one token per request.
pub async fn rate_limit(
    State(gate): State<AdmissionController>,
    req: Request,
    next: Next,
) -> Response {
    let identity = identity::from_request(&req);

    match gate.admit_one(&identity).await {
        Verdict::Admit => next.run(req).await,
        Verdict::Deny => too_many_requests(),
        Verdict::Error(detail) => match gate.config().failure_policy {
            FailurePolicy::FailClosed => internal_error(),
            FailurePolicy::FailOpen => {
                warn!(identity = %identity, detail = %detail, "Store unavailable, forwarding unchecked");
                next.run(req).await
            }
        },
    }
}

/// Access log: one event when the request arrives, one when it completes.
pub async fn log_request(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let protocol = req.version();
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    let identity = identity::from_request(&req);

    let span = info_span!("request", %request_id, %method, %path);
    async move {
        info!(%remote, %identity, ?protocol, "Request received");
        let start = Instant::now();
        let response = next.run(req).await;
        info!(
            status = response.status().as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Request completed"
        );
        response
    }
    .instrument(span)
    .await
}

/// Converts a panic further down the stack into a 500 and closes the connection.
pub async fn recover_panic(req: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!(panic = %panic_message(panic.as_ref()), "Handler panicked");
            let mut response = internal_error();
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            response
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
