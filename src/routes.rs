// src/routes.rs

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tower::ServiceBuilder;
use tracing::info;

use crate::admission::AdmissionController;
use crate::interceptor::{log_request, rate_limit, recover_panic};

/// The versioned API, gated per client.
pub fn routes(gate: AdmissionController) -> Router {
    let v1 = Router::new()
        .route("/get", get(v1_get))
        .route("/post", post(v1_post));

    protect(Router::new().nest("/api/v1", v1), gate)
}

/// Wrap any router in the gate's stages, outermost first:
/// panic recovery, access log, admission.
pub fn protect(router: Router, gate: AdmissionController) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(middleware::from_fn(recover_panic))
            .layer(middleware::from_fn(log_request))
            .layer(middleware::from_fn_with_state(gate, rate_limit)),
    )
}

async fn v1_get() -> StatusCode {
    info!("getting");
    StatusCode::OK
}

async fn v1_post() -> StatusCode {
    info!("posting");
    StatusCode::OK
}
