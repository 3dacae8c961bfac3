use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Fixed-window request counter per client IP.
#[derive(Clone)]
pub struct RateLimiter {
    // IP -> (count, window_start)
    state: Arc<Mutex<HashMap<IpAddr, (u32, Instant)>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            max_requests,
            window: Duration::from_secs(window_secs),
        }
    }

    pub async fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now()).await
    }

    async fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut state = self.state.lock().await;
        let entry = state.entry(ip).or_insert((0, now));

        if now.saturating_duration_since(entry.1) > self.window {
            *entry = (1, now);
            return true;
        }

        if entry.0 < self.max_requests {
            entry.0 += 1;
            true
        } else {
            false
        }
    }

    /// Drop counters whose window expired long ago.
    pub async fn cleanup(&self) -> usize {
        let mut state = self.state.lock().await;
        let before = state.len();
        let now = Instant::now();
        state.retain(|_, (_, start)| now.saturating_duration_since(*start) <= self.window * 2);
        before - state.len()
    }
}

pub async fn rate_limit_middleware(
    limiter: Arc<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    if !limiter.check(ip).await {
        tracing::warn!(%ip, "rate limit exceeded");
        let body = serde_json::json!({
            "error": "Rate limit exceeded - too many requests",
            "kind": "rate_limited",
        });
        return (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
    }

    next.run(request).await
}
