//! HTTP surface: routes, shared-secret authentication and handlers.

pub mod auth;
pub mod handlers;
pub mod routes;

use std::sync::Arc;

use crate::controller::Controller;

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    /// Shared secret expected in the Authorization header
    pub secret: Arc<String>,
}

pub use routes::build_router;
