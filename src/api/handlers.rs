//! REST handlers (`spec.md` §6). Every success path returns the
//! `{success, data}` envelope; failures propagate an [`AgentGateError`]
//! and let its `IntoResponse` impl build the error envelope.

use super::{AppState, Envelope};
use crate::audit::AuditFilter;
use crate::error::{AgentGateError, Result};
use crate::models::{AgentType, WorkOrder, WorkOrderStatus, WorkspaceSource};
use crate::store::ListFilter;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use validator::Validate;

/// Mirrors the REST body schema in `spec.md` §6: `taskPrompt` ≥ 10 chars,
/// `maxIterations` 1-10, `maxTime` 60-3600 seconds.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkOrderRequest {
    #[validate(length(min = 10, message = "taskPrompt must be at least 10 characters"))]
    pub task_prompt: String,
    pub workspace_source: WorkspaceSource,
    #[serde(default)]
    pub agent_type: AgentType,
    #[validate(range(min = 1, max = 10, message = "maxIterations must be between 1 and 10"))]
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[validate(range(min = 60, max = 3600, message = "maxTime must be between 60 and 3600 seconds"))]
    #[serde(default, rename = "maxTime")]
    pub max_wall_clock_seconds: Option<u64>,
    #[serde(default)]
    pub gates: Vec<crate::models::Gate>,
}

pub async fn create_work_order(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkOrderRequest>,
) -> Result<Json<Envelope<WorkOrder>>> {
    req.validate().map_err(|e| AgentGateError::Validation(e.to_string()))?;
    let mut work_order = WorkOrder::new(
        req.task_prompt,
        req.workspace_source,
        req.agent_type,
        req.max_iterations.unwrap_or(3),
        req.max_wall_clock_seconds.unwrap_or(3600),
    );
    work_order.gates = req.gates;
    state.store.save(&work_order).await?;
    Ok(Envelope::ok(work_order))
}

#[derive(Debug, Deserialize)]
pub struct ListWorkOrdersQuery {
    pub status: Option<WorkOrderStatus>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

pub async fn list_work_orders(
    State(state): State<AppState>,
    Query(q): Query<ListWorkOrdersQuery>,
) -> Result<Json<Envelope<Vec<WorkOrder>>>> {
    let list = state
        .store
        .list(ListFilter { status: q.status, limit: q.limit, offset: q.offset })
        .await?;
    Ok(Envelope::ok(list))
}

pub async fn get_work_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<WorkOrder>>> {
    let work_order = state.store.load(&id).await?;
    Ok(Envelope::ok(work_order))
}

pub async fn cancel_work_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<WorkOrder>>> {
    let work_order = state.store.load(&id).await?;
    if work_order.status.is_terminal() {
        return Err(AgentGateError::InvalidTransition {
            from: format!("{:?}", work_order.status),
            event: "cancel".to_string(),
        });
    }

    if work_order.status == WorkOrderStatus::Running {
        state.engine.cancel_by_work_order(&id, "user requested cancellation").await?;
    }

    let updated = state.store.update_status(&id, WorkOrderStatus::Canceled).await?;
    Ok(Envelope::ok(updated))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub work_order_id: Option<String>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(q): Query<ListRunsQuery>,
) -> Result<Json<Envelope<Vec<crate::api::run_registry::RunSummary>>>> {
    let runs = state.runs.list(q.work_order_id.as_deref()).await;
    Ok(Envelope::ok(runs))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<crate::api::run_registry::RunSummary>>> {
    let run = state.runs.get(&id).await.ok_or_else(|| AgentGateError::RunNotFound(id.clone()))?;
    Ok(Envelope::ok(run))
}

#[derive(serde::Serialize)]
pub struct RunConfig {
    pub run_id: String,
    pub work_order_id: String,
    pub max_iterations: u32,
    pub max_wall_clock_seconds: u64,
    pub agent_type: AgentType,
    pub gates: Vec<crate::models::Gate>,
}

pub async fn get_run_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<RunConfig>>> {
    let run = state.runs.get(&id).await.ok_or_else(|| AgentGateError::RunNotFound(id.clone()))?;
    let work_order = state.store.load(&run.work_order_id).await?;
    Ok(Envelope::ok(RunConfig {
        run_id: run.id,
        work_order_id: work_order.id.clone(),
        max_iterations: work_order.max_iterations,
        max_wall_clock_seconds: work_order.max_wall_clock_seconds,
        agent_type: work_order.agent_type,
        gates: work_order.gates,
    }))
}

#[derive(serde::Serialize)]
pub struct StrategyState {
    pub run_id: String,
    pub iterations_seen: u32,
    pub status: String,
    pub result: Option<crate::models::RunResult>,
}

/// Best-effort view of where the Loop Strategy left off: the Engine does
/// not persist strategy internals, so this reports the iteration count
/// and terminal result observed from the run's event history.
pub async fn get_run_strategy_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<StrategyState>>> {
    let run = state.runs.get(&id).await.ok_or_else(|| AgentGateError::RunNotFound(id.clone()))?;
    Ok(Envelope::ok(StrategyState {
        run_id: run.id,
        iterations_seen: run.iterations_seen,
        status: run.status,
        result: run.result,
    }))
}

pub async fn get_run_audit_timeline(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Envelope<Vec<crate::audit::AuditEvent>>>> {
    let run = state.runs.get(&run_id).await.ok_or_else(|| AgentGateError::RunNotFound(run_id.clone()))?;
    let timeline = state.audit.get_work_order_timeline(&run.work_order_id).await;
    Ok(Envelope::ok(timeline))
}

#[derive(Debug, Deserialize)]
pub struct SnapshotsQuery {
    pub iteration: Option<u32>,
}

pub async fn get_run_snapshots(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(q): Query<SnapshotsQuery>,
) -> Result<Json<Envelope<Vec<serde_json::Value>>>> {
    let run = state.runs.get(&run_id).await.ok_or_else(|| AgentGateError::RunNotFound(run_id.clone()))?;
    let events = state
        .audit
        .query(AuditFilter { work_order_id: Some(run.work_order_id), event_type: Some("snapshot_created".to_string()), ..Default::default() })
        .await;
    let snapshots: Vec<serde_json::Value> = events
        .into_iter()
        .map(|e| match e.details {
            crate::audit::AuditDetails::Generic(v) => v,
            _ => serde_json::Value::Null,
        })
        .filter(|v| {
            q.iteration
                .map(|i| v.get("iteration").and_then(|x| x.as_u64()) == Some(i as u64))
                .unwrap_or(true)
        })
        .collect();
    Ok(Envelope::ok(snapshots))
}

pub async fn get_run_changes(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Envelope<Vec<serde_json::Value>>>> {
    let run = state.runs.get(&run_id).await.ok_or_else(|| AgentGateError::RunNotFound(run_id.clone()))?;
    let events = state
        .audit
        .query(AuditFilter { work_order_id: Some(run.work_order_id), event_type: Some("snapshot_created".to_string()), ..Default::default() })
        .await;
    let changes: Vec<serde_json::Value> = events
        .into_iter()
        .filter_map(|e| match e.details {
            crate::audit::AuditDetails::Generic(v) => Some(serde_json::json!({
                "filesChanged": v.get("files_changed"),
                "insertions": v.get("insertions"),
                "deletions": v.get("deletions"),
                "afterSha": v.get("after_sha"),
            })),
            _ => None,
        })
        .collect();
    Ok(Envelope::ok(changes))
}

#[derive(serde::Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub active_runs: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<Envelope<HealthBody>> {
    let active_runs = state.engine.get_active_count().await;
    Envelope::ok(HealthBody { status: "ok", active_runs })
}

pub async fn health_ready(State(state): State<AppState>) -> Json<Envelope<HealthBody>> {
    let active_runs = state.engine.get_active_count().await;
    Envelope::ok(HealthBody { status: "ready", active_runs })
}

pub async fn health_live() -> Json<Envelope<&'static str>> {
    Envelope::ok("alive")
}
