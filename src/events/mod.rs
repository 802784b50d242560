//! Event Buffer & Rate Limiter (`spec.md` §4.5): per-work-order ring
//! buffers feeding a priority token-bucket rate limiter for streaming to
//! subscribers.

pub mod buffer;
pub mod rate_limiter;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Typed stream event variants (`spec.md` §3).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventPayload {
    WorkOrderCreated { work_order_id: String },
    WorkOrderUpdated { work_order_id: String, status: String },
    RunStarted { work_order_id: String, run_id: String },
    RunIteration { work_order_id: String, run_id: String, iteration: u32 },
    RunCompleted { work_order_id: String, run_id: String, result: String },
    RunFailed { work_order_id: String, run_id: String, error: String },
    AgentOutput { work_order_id: String, run_id: String, chunk: String },
    AgentToolCall { work_order_id: String, run_id: String, tool: String },
    AgentToolResult { work_order_id: String, run_id: String, tool: String, summary: String },
    FileChanged { work_order_id: String, run_id: String, path: String },
    Error { code: String, message: String },
    Pong,
    SubscriptionConfirmed { work_order_id: String },
    UnsubscriptionConfirmed { work_order_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// Default mapping from event type to priority (`spec.md` §4.5).
    pub fn classify(payload: &StreamEventPayload) -> Self {
        use StreamEventPayload::*;
        match payload {
            Error { .. } | RunFailed { .. } | RunCompleted { .. } | WorkOrderUpdated { .. }
            | RunStarted { .. } => Priority::Critical,
            AgentToolCall { .. } | AgentToolResult { .. } | FileChanged { .. } | RunIteration { .. } => {
                Priority::High
            }
            SubscriptionConfirmed { .. } | UnsubscriptionConfirmed { .. } | Pong => Priority::Normal,
            AgentOutput { .. } | WorkOrderCreated { .. } => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub id: String,
    pub work_order_id: String,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub payload: StreamEventPayload,
}

impl StreamEvent {
    pub fn new(work_order_id: impl Into<String>, payload: StreamEventPayload) -> Self {
        let priority = Priority::classify(&payload);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            work_order_id: work_order_id.into(),
            timestamp: Utc::now(),
            priority,
            payload,
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        use StreamEventPayload::*;
        match &self.payload {
            RunStarted { run_id, .. }
            | RunIteration { run_id, .. }
            | RunCompleted { run_id, .. }
            | RunFailed { run_id, .. }
            | AgentOutput { run_id, .. }
            | AgentToolCall { run_id, .. }
            | AgentToolResult { run_id, .. }
            | FileChanged { run_id, .. } => Some(run_id),
            _ => None,
        }
    }

    pub fn is_agent_output(&self) -> bool {
        matches!(self.payload, StreamEventPayload::AgentOutput { .. })
    }
}
