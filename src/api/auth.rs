//! `X-API-Key` authentication middleware (`spec.md` §6). Comparison is
//! constant-time to avoid leaking key length/prefix through timing.

use super::AppState;
use crate::error::AgentGateError;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AgentGateError> {
    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = state.config.api_key.as_bytes();
    let provided_bytes = provided.as_bytes();

    let matches = provided_bytes.len() == expected.len() && bool::from(provided_bytes.ct_eq(expected));
    if !matches {
        return Err(AgentGateError::Unauthorized);
    }
    Ok(next.run(req).await)
}
