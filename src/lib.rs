//! # AgentGate
//!
//! AgentGate schedules and executes long-running work orders — tasks
//! asking an AI coding agent to modify a workspace until a set of
//! verification gates pass. The orchestration core turns an accepted
//! work order into a series of bounded agent iterations (Build →
//! Snapshot → Verify → Feedback), enforces concurrency and resource
//! limits, classifies failures and retries them, captures an audit
//! trail, and streams progress to subscribers.
//!
//! ## Architecture
//!
//! - **Store**: single-writer, one-file-per-work-order persistence.
//! - **State Machine**: the work-order lifecycle, audited on every
//!   transition (accepted or rejected).
//! - **Scheduler**: admission, stagger, and stale/dead-process sweeps.
//! - **Engine**: the per-work-order Build/Snapshot/Verify/Feedback loop.
//! - **Gate Pipeline**: ordered pass/fail/iterate decisions.
//! - **Event Buffer + Rate Limiter**: bounded, rate-limited streaming.
//! - **Audit Log**: the structured record of every decision made.
//! - **API**: the HTTP/WS transport over all of the above.

/// Structured audit trail of every state transition and gate decision.
pub mod audit;
/// HTTP API server, REST handlers, and the `/ws` stream.
pub mod api;
/// Process-wide configuration, loaded from `AGENTGATE_*` env vars.
pub mod config;
/// External collaborator interfaces: agent driver, VCS, verifier, sandbox.
pub mod drivers;
/// Execution Engine: the per-work-order iteration loop.
pub mod engine;
/// Error types and classification.
pub mod error;
/// Bounded, rate-limited progress streaming.
pub mod events;
/// Timeout/cancellation wrapper around a single agent execution.
pub mod execution;
/// Gate Pipeline: ordered pass/fail/iterate evaluation.
pub mod gates;
/// Loop Strategy: decides continue/stop between iterations.
pub mod loop_strategy;
/// Core data models: `WorkOrder`, `Run`, `Snapshot`, `Gate`, and friends.
pub mod models;
/// Phase Orchestrator: Build, Snapshot, Verify, Feedback.
pub mod phases;
/// Resource Monitor: concurrency slot accounting.
pub mod resource_monitor;
/// Retry Manager: backoff scheduling for retryable failures.
pub mod retry;
/// Scheduler: admission, stagger, stale/dead-process detection.
pub mod scheduler;
/// Per-work-order finite state machine.
pub mod state_machine;
/// Work-order persistence.
pub mod store;

pub use error::{AgentGateError, Result};
