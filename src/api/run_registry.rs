//! Read-model for `/runs` endpoints, projected from the same
//! [`StreamEvent`](crate::events::StreamEvent) stream that feeds the `/ws`
//! clients — the Engine itself only tracks in-flight runs, so REST queries
//! for run history are served from this projection rather than reaching
//! into engine internals.

use crate::events::{StreamEvent, StreamEventPayload};
use crate::models::RunResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub work_order_id: String,
    pub status: String,
    pub iterations_seen: u32,
    pub result: Option<RunResult>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct RunRegistry {
    runs: RwLock<HashMap<String, RunSummary>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self { runs: RwLock::new(HashMap::new()) }
    }

    /// Folds one stream event into the projection. Events unrelated to a
    /// run's lifecycle are ignored.
    pub async fn apply(&self, event: &StreamEvent) {
        let mut runs = self.runs.write().await;
        match &event.payload {
            StreamEventPayload::RunStarted { work_order_id, run_id } => {
                runs.insert(
                    run_id.clone(),
                    RunSummary {
                        id: run_id.clone(),
                        work_order_id: work_order_id.clone(),
                        status: "running".to_string(),
                        iterations_seen: 0,
                        result: None,
                        started_at: event.timestamp,
                        updated_at: event.timestamp,
                    },
                );
            }
            StreamEventPayload::RunIteration { run_id, iteration, .. } => {
                if let Some(run) = runs.get_mut(run_id) {
                    run.iterations_seen = run.iterations_seen.max(*iteration + 1);
                    run.updated_at = event.timestamp;
                }
            }
            StreamEventPayload::RunCompleted { run_id, result, .. } => {
                if let Some(run) = runs.get_mut(run_id) {
                    run.status = "completed".to_string();
                    run.result = parse_result(result);
                    run.updated_at = event.timestamp;
                }
            }
            StreamEventPayload::RunFailed { run_id, .. } => {
                if let Some(run) = runs.get_mut(run_id) {
                    run.status = "failed".to_string();
                    run.updated_at = event.timestamp;
                }
            }
            _ => {}
        }
    }

    pub async fn get(&self, run_id: &str) -> Option<RunSummary> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn list(&self, work_order_id: Option<&str>) -> Vec<RunSummary> {
        let mut runs: Vec<RunSummary> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| work_order_id.map(|id| id == r.work_order_id).unwrap_or(true))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }
}

fn parse_result(debug_repr: &str) -> Option<RunResult> {
    match debug_repr {
        "Passed" => Some(RunResult::Passed),
        "FailedVerification" => Some(RunResult::FailedVerification),
        "FailedError" => Some(RunResult::FailedError),
        "FailedTimeout" => Some(RunResult::FailedTimeout),
        "Canceled" => Some(RunResult::Canceled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn projects_run_lifecycle_from_events() {
        let registry = RunRegistry::new();
        registry
            .apply(&StreamEvent::new(
                "wo-1",
                StreamEventPayload::RunStarted { work_order_id: "wo-1".into(), run_id: "run-1".into() },
            ))
            .await;
        registry
            .apply(&StreamEvent::new(
                "wo-1",
                StreamEventPayload::RunIteration { work_order_id: "wo-1".into(), run_id: "run-1".into(), iteration: 2 },
            ))
            .await;
        registry
            .apply(&StreamEvent::new(
                "wo-1",
                StreamEventPayload::RunCompleted { work_order_id: "wo-1".into(), run_id: "run-1".into(), result: "Passed".into() },
            ))
            .await;

        let run = registry.get("run-1").await.unwrap();
        assert_eq!(run.status, "completed");
        assert_eq!(run.iterations_seen, 3);
        assert_eq!(run.result, Some(RunResult::Passed));
    }
}
