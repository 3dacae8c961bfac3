use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pairchat::{
    api::{create_router, AppState, RateLimiter},
    config::Config,
    db,
    error::AppError,
    realtime::{Hub, PresenceTracker},
    rooms::ChatService,
};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pairchat=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting pairchat server v{}...", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::from_env()?);
    tracing::info!("Configuration loaded");

    let pool = db::connect(&config).await?;
    tracing::info!("Database connected: {}", config.database_url);

    db::migrate(&pool).await?;
    tracing::info!("Database migrations completed");

    let hub = Hub::new();
    let chat = Arc::new(ChatService::new(pool, hub.clone(), &config));

    // Sessions persisted by a previous run have no live occupants left.
    chat.registry().reconcile().await?;

    let presence = Arc::new(PresenceTracker::new(Duration::from_secs(
        config.presence_ttl_secs,
    )));

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_requests,
        config.rate_limit_window_secs,
    ));
    tracing::info!(
        "Rate limiter configured ({} req per {}s per IP)",
        config.rate_limit_requests,
        config.rate_limit_window_secs
    );

    let state = AppState {
        chat,
        hub,
        presence,
        config: config.clone(),
    };

    // Spawn background task for presence liveness
    {
        let state = state.clone();
        let period = Duration::from_secs(config.presence_sweep_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                state.sweep_presence().await;
            }
        });
        tracing::info!("Presence sweep task started");
    }

    // Spawn background task for rate limiter cleanup
    {
        let limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                let removed = limiter.cleanup().await;
                tracing::debug!(removed, "rate limiter cache cleaned up");
            }
        });
    }

    let app = create_router(state, rate_limiter);

    let addr = config.server_address();
    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  POST /api/chat/start                  - Find a partner");
    tracing::info!("  POST /api/chat/send                   - Send a chat message");
    tracing::info!("  POST /api/chat/next                   - Leave and find a new partner");
    tracing::info!("  POST /api/chat/leave                  - Leave the current session");
    tracing::info!("  GET  /api/chat/sessions/{{id}}/messages - Session history");
    tracing::info!("  POST /api/signal                      - Relay a negotiation envelope");
    tracing::info!("  GET  /api/presence                    - Online count");
    tracing::info!("  GET  /ws?user_id=...                  - Real-time channel");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| AppError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
