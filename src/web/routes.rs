use axum::{
    routing::{any, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the control-plane router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::status))
        // Upstream delivery control
        .route("/upstream", post(handlers::set_upstream))
        .route("/resolution", post(handlers::set_resolution))
        // Property access, one route per direction
        .route("/properties/:name", get(handlers::get_property))
        .route("/properties/:name", put(handlers::put_property))
        // WebSocket endpoint for real-time events
        .route("/ws", any(ws_handler));

    Router::new()
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
