//! Route table.
//!
//! # Endpoints
//!
//! - `POST /api/v1/jobs` - submit a job (202 + stats record)
//! - `GET  /api/v1/jobs/:job_id` - stats record
//! - `POST /api/v1/jobs/:job_id` - `{action: stop|cancel|retry}` (204)
//! - `GET  /api/v1/jobs/:job_id/log` - plain-text job log
//! - `GET  /api/v1/stats` - worker pool heartbeats
//! - `GET  /api/health` - public health probe

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::api::{auth, handlers, AppState};

/// Build the service router. Everything under `/api/v1` requires the
/// shared secret; the health endpoint is public.
pub fn build_router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/jobs", post(handlers::launch_job))
        .route(
            "/jobs/:job_id",
            get(handlers::get_job).post(handlers::job_action),
        )
        .route("/jobs/:job_id/log", get(handlers::job_log))
        .route("/stats", get(handlers::pool_stats))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::secret_auth,
        ));

    Router::new()
        .nest("/api/v1", v1)
        .route("/api/health", get(handlers::health_check))
        .with_state(state)
}
