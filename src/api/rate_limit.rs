//! Per-process IP rate limiting for the whole HTTP surface, ahead of auth
//! (`spec.md` §6 ambient hardening). Grounded on the teacher's
//! `rate_limit_middleware`, but actually consults the token bucket instead
//! of only sleeping.

use super::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.ip_limiter.check().is_err() {
        let addr = connect_info.map(|c| c.0.to_string()).unwrap_or_else(|| "unknown".to_string());
        tracing::warn!("rate limit exceeded for {addr}");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    Ok(next.run(request).await)
}
