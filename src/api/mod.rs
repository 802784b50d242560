//! HTTP/WS Transport (ambient outer surface, `spec.md` §6): axum router
//! under `/api/v1`, `X-API-Key` auth, envelope responses, and the stream
//! WebSocket. Composed the way the teacher's `ApiServer` layers
//! `TraceLayer` + CORS + auth + rate limiting over a typed `State`.

mod auth;
mod docs;
mod handlers;
mod rate_limit;
pub mod run_registry;
mod ws;

use crate::audit::AuditLog;
use crate::config::ApiConfig;
use crate::engine::Engine;
use crate::events::buffer::EventBuffer;
use crate::events::rate_limiter::RateLimiter;
use crate::resource_monitor::ResourceMonitor;
use crate::scheduler::Scheduler;
use crate::store::WorkOrderStore;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use governor::{Quota, RateLimiter as IpRateLimiter};
use run_registry::RunRegistry;
use std::num::NonZeroU32;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub type IpGovernor =
    IpRateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    pub store: Arc<WorkOrderStore>,
    pub engine: Arc<Engine>,
    pub scheduler: Arc<Scheduler>,
    pub resource_monitor: Arc<ResourceMonitor>,
    pub audit: Arc<AuditLog>,
    pub event_buffer: Arc<EventBuffer>,
    pub rate_limiter: Arc<RateLimiter>,
    pub runs: Arc<RunRegistry>,
    pub ip_limiter: Arc<IpGovernor>,
}

impl AppState {
    pub fn new(
        config: Arc<ApiConfig>,
        store: Arc<WorkOrderStore>,
        engine: Arc<Engine>,
        scheduler: Arc<Scheduler>,
        resource_monitor: Arc<ResourceMonitor>,
        audit: Arc<AuditLog>,
        event_buffer: Arc<EventBuffer>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            config,
            store,
            engine,
            scheduler,
            resource_monitor,
            audit,
            event_buffer,
            rate_limiter,
            runs: Arc::new(RunRegistry::new()),
            ip_limiter: Arc::new(IpRateLimiter::direct(Quota::per_second(NonZeroU32::new(50).unwrap()))),
        }
    }
}

/// Builds the full router: public health checks, authenticated
/// `/api/v1/*` routes, the `/docs` OpenAPI surface, and the `/ws` stream.
pub fn build_router(state: AppState) -> Router {
    let cors = build_cors(&state.config.allowed_origins);

    let v1 = Router::new()
        .route("/work-orders", get(handlers::list_work_orders).post(handlers::create_work_order))
        .route(
            "/work-orders/{id}",
            get(handlers::get_work_order).delete(handlers::cancel_work_order),
        )
        .route("/runs", get(handlers::list_runs))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/runs/{id}/config", get(handlers::get_run_config))
        .route("/runs/{id}/strategy-state", get(handlers::get_run_strategy_state))
        .route("/audit/runs/{run_id}", get(handlers::get_run_audit_timeline))
        .route("/audit/runs/{run_id}/snapshots", get(handlers::get_run_snapshots))
        .route("/audit/runs/{run_id}/changes", get(handlers::get_run_changes))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    Router::new()
        .nest("/api/v1", v1)
        .route("/health", get(handlers::health))
        .route("/health/ready", get(handlers::health_ready))
        .route("/health/live", get(handlers::health_live))
        .route("/docs/json", get(docs::openapi_json))
        .route("/docs/yaml", get(docs::openapi_yaml))
        .route("/docs/", get(docs::openapi_ui))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(axum::middleware::from_fn_with_state(state.clone(), rate_limit::rate_limit_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn build_cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins.iter().filter_map(|o| o.parse::<HeaderValue>().ok()).collect();
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::HeaderName::from_static("x-api-key")])
        .allow_origin(origins)
}

/// `{success, data}` envelope for successful responses (`spec.md` §6).
#[derive(serde::Serialize)]
pub struct Envelope<T: serde::Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: serde::Serialize> Envelope<T> {
    pub fn ok(data: T) -> axum::Json<Self> {
        axum::Json(Self { success: true, data })
    }
}
