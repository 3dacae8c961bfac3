pub mod chat;
pub mod middleware;
pub mod state;
pub mod ws;

pub use middleware::RateLimiter;
pub use state::AppState;

use axum::{
    extract::Request,
    middleware::{self as axum_middleware, Next},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

pub fn create_router(state: AppState, rate_limiter: Arc<RateLimiter>) -> Router {
    let timeout = Duration::from_secs(state.config.request_timeout_secs);

    let api = Router::new()
        // Health check
        .route("/api/health", get(health))
        // Pairing and chat
        .route("/api/chat/start", post(chat::start))
        .route("/api/chat/send", post(chat::send_message))
        .route("/api/chat/next", post(chat::next))
        .route("/api/chat/leave", post(chat::leave))
        .route("/api/chat/sessions/{session_id}", get(chat::session))
        .route("/api/chat/sessions/{session_id}/messages", get(chat::messages))
        // Signaling and presence
        .route("/api/signal", post(chat::signal))
        .route("/api/presence", get(chat::presence))
        .layer(axum_middleware::from_fn(move |req: Request, next: Next| {
            let limiter = rate_limiter.clone();
            middleware::rate_limit_middleware(limiter, req, next)
        }))
        .layer(TimeoutLayer::new(timeout));

    // the socket route stays outside the request timeout
    Router::new()
        .merge(api)
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
