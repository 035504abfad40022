pub mod error;
pub mod execute;
pub mod files;
pub mod guard;
pub mod health;
pub mod schemas;
pub mod tools;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crucible_broker::Broker;

use self::guard::IngressGuard;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub guard: Arc<IngressGuard>,
    /// Request body cap, from the configured file size limit.
    pub body_limit: usize,
}

/// Build the router with all routes and middleware.
pub fn router(state: AppState) -> Router {
    // Spawning code is gated by the ingress guard; file management and
    // tool parsing are not.
    let spawning = Router::new()
        .route("/v1/execute", post(execute::execute))
        .route("/v1/execute-custom-tool", post(tools::execute_custom_tool))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            guard::ingress_guard,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route("/v1/upload", post(files::upload))
        .route("/v1/download", post(files::download))
        .route("/v1/expire", post(files::expire))
        .route("/v1/parse-custom-tool", post(tools::parse_custom_tool))
        .merge(spawning)
        .layer(DefaultBodyLimit::max(state.body_limit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
