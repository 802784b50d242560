//! Phase Orchestrator (`spec.md` §4.8): runs one Build -> Snapshot ->
//! Verify -> Feedback iteration behind a shared `PhaseContext`, and emits
//! exactly one state-transition name per iteration.

pub mod build;
pub mod feedback;
pub mod snapshot;
pub mod verify;

use crate::drivers::{AgentDriver, BeforeState, Snapshotter, Verifier};
use crate::error::AgentGateError;
use crate::events::StreamEventPayload;
use crate::models::{Gate, IterationData, Snapshot, VerificationReport};
use std::sync::Arc;

/// Emitted by a caller (the Engine) for every streamed event a phase
/// produces; `None` disables streaming entirely for this iteration.
pub type StreamSink = Arc<dyn Fn(StreamEventPayload) + Send + Sync>;

/// Everything a phase needs: identity, the task, the workspace handle, and
/// the read-only state carried over from before the iteration started.
pub struct PhaseContext {
    pub work_order_id: String,
    pub run_id: String,
    pub iteration: u32,
    pub task_prompt: String,
    pub workspace_path: String,
    pub feedback: Option<String>,
    pub prior_session_id: Option<String>,
    pub before_state: BeforeState,
    pub gates: Vec<Gate>,
    pub stream: Option<StreamSink>,
}

impl PhaseContext {
    fn emit(&self, payload: StreamEventPayload) {
        if let Some(sink) = &self.stream {
            sink(payload);
        }
    }
}

/// The exact transition name vocabulary the orchestrator is allowed to
/// emit, one per iteration (`spec.md` §4.8.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationTransition {
    BuildStarted,
    BuildFailed,
    VerifyPassed,
    VerifyFailedContinue,
    VerifyFailedTerminal,
    SystemError,
    WorkspaceAcquired,
}

impl IterationTransition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BuildStarted => "BUILD_STARTED",
            Self::BuildFailed => "BUILD_FAILED",
            Self::VerifyPassed => "VERIFY_PASSED",
            Self::VerifyFailedContinue => "VERIFY_FAILED_CONTINUE",
            Self::VerifyFailedTerminal => "VERIFY_FAILED_TERMINAL",
            Self::SystemError => "SYSTEM_ERROR",
            Self::WorkspaceAcquired => "WORKSPACE_ACQUIRED",
        }
    }
}

pub struct PhaseServices<'a> {
    pub agent_driver: &'a dyn AgentDriver,
    pub snapshotter: &'a dyn Snapshotter,
    pub verifier: &'a dyn Verifier,
}

pub struct IterationOutcome {
    pub data: IterationData,
    pub transition: IterationTransition,
    pub session_id: Option<String>,
    pub snapshot: Option<Snapshot>,
    pub verification: Option<VerificationReport>,
    pub feedback_for_next: Option<String>,
    pub error: Option<AgentGateError>,
}

/// Runs one full iteration. `continue_on_fail` comes from the Loop
/// Strategy's decision about whether there will be a next iteration; it
/// only affects whether the Feedback phase runs and which of the two
/// verify-failed transitions is reported.
pub async fn run_iteration(
    ctx: &PhaseContext,
    services: &PhaseServices<'_>,
    continue_on_fail: bool,
) -> IterationOutcome {
    let mut data = IterationData::new(ctx.iteration);
    ctx.emit(StreamEventPayload::RunIteration {
        work_order_id: ctx.work_order_id.clone(),
        run_id: ctx.run_id.clone(),
        iteration: ctx.iteration,
    });

    let build_started = std::time::Instant::now();
    let build_result = build::run(ctx, services.agent_driver).await;
    data.timings.build_ms = build_started.elapsed().as_millis() as u64;

    let Some(session_id) = build_result.session_id.clone() else {
        data.error = build_result.error.as_ref().map(|e| e.to_string());
        data.ended_at = Some(chrono::Utc::now());
        let transition = match &build_result.error {
            Some(AgentGateError::Cancelled(_)) => IterationTransition::SystemError,
            _ => IterationTransition::BuildFailed,
        };
        return IterationOutcome {
            data,
            transition,
            session_id: None,
            snapshot: None,
            verification: None,
            feedback_for_next: None,
            error: build_result.error,
        };
    };

    let snapshot_started = std::time::Instant::now();
    let snapshot_result = snapshot::run(ctx, services.snapshotter).await;
    data.timings.snapshot_ms = snapshot_started.elapsed().as_millis() as u64;

    let snap = match snapshot_result {
        Ok(snap) => {
            data.snapshot_id = Some(snap.id.clone());
            Some(snap)
        }
        Err(e) => {
            data.error = Some(e.to_string());
            data.ended_at = Some(chrono::Utc::now());
            return IterationOutcome {
                data,
                transition: IterationTransition::SystemError,
                session_id: Some(session_id),
                snapshot: None,
                verification: None,
                feedback_for_next: None,
                error: Some(e),
            };
        }
    };

    let verify_started = std::time::Instant::now();
    let verification = verify::run(ctx, services.verifier).await;
    data.timings.verify_ms = verify_started.elapsed().as_millis() as u64;

    let report = match verification {
        Ok(report) => {
            data.verification_passed = Some(report.passed);
            report
        }
        Err(e) => {
            data.error = Some(e.to_string());
            data.ended_at = Some(chrono::Utc::now());
            return IterationOutcome {
                data,
                transition: IterationTransition::SystemError,
                session_id: Some(session_id),
                snapshot: snap,
                verification: None,
                feedback_for_next: None,
                error: Some(e),
            };
        }
    };

    let mut feedback_for_next = None;
    if !report.passed && continue_on_fail {
        let feedback_started = std::time::Instant::now();
        feedback_for_next = Some(feedback::generate(&report));
        data.feedback_generated = true;
        data.timings.feedback_ms = feedback_started.elapsed().as_millis() as u64;
    }

    data.ended_at = Some(chrono::Utc::now());
    let transition = if report.passed {
        IterationTransition::VerifyPassed
    } else if continue_on_fail {
        IterationTransition::VerifyFailedContinue
    } else {
        IterationTransition::VerifyFailedTerminal
    };

    IterationOutcome {
        data,
        transition,
        session_id: Some(session_id),
        snapshot: snap,
        verification: Some(report),
        feedback_for_next,
        error: None,
    }
}
