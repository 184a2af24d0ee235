//! Axum application wiring for the operator surface.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::routes;
use crate::kernel::RuntimeKernel;

pub fn build_app(kernel: Arc<RuntimeKernel>) -> Router {
    let protected = Router::new()
        .route("/status", get(routes::get_status))
        .route("/control/pause", post(routes::post_pause))
        .route("/control/resume", post(routes::post_resume))
        .route("/control/emergency-stop", post(routes::post_emergency_stop))
        .route("/outbox/unknown", get(routes::get_unknown_effects))
        .route("/agents", post(routes::post_agent))
        .route("/instances", get(routes::get_instances).post(routes::post_instance))
        .route("/instances/:instance_id/agents", post(routes::post_instance_agent))
        .route("/routines", post(routes::post_routine))
        .route("/ingest/:instance_id", post(routes::post_ingest))
        .route("/runs/:job_id/pause", post(routes::post_pause_run))
        .route("/runs/:job_id/resume", post(routes::post_resume_run))
        .route("/runs/:job_id/cancel", post(routes::post_cancel_run))
        .route_layer(middleware::from_fn_with_state(
            kernel.clone(),
            require_bearer_auth,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(kernel)
}

async fn require_bearer_auth(
    State(kernel): State<Arc<RuntimeKernel>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let authorized = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == kernel.config.auth_secret);

    if authorized {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
