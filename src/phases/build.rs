//! Build phase (`spec.md` §4.8.1): invokes the agent driver and classifies
//! its result into a typed outcome.

use super::PhaseContext;
use crate::drivers::{AgentDriver, AgentDriverResult};
use crate::error::AgentGateError;
use crate::events::StreamEventPayload;

pub struct BuildResult {
    pub session_id: Option<String>,
    pub driver_result: Option<AgentDriverResult>,
    pub error: Option<AgentGateError>,
}

pub async fn run(ctx: &PhaseContext, driver: &dyn AgentDriver) -> BuildResult {
    let outcome = driver
        .run(
            &ctx.task_prompt,
            ctx.feedback.as_deref(),
            ctx.prior_session_id.as_deref(),
            &ctx.workspace_path,
        )
        .await;

    let result = match outcome {
        Err(e) => {
            return BuildResult { session_id: None, driver_result: None, error: Some(e) };
        }
        Ok(r) => r,
    };

    ctx.emit(StreamEventPayload::AgentOutput {
        work_order_id: ctx.work_order_id.clone(),
        run_id: ctx.run_id.clone(),
        chunk: result.stdout.clone(),
    });
    if !result.stderr.is_empty() {
        ctx.emit(StreamEventPayload::AgentOutput {
            work_order_id: ctx.work_order_id.clone(),
            run_id: ctx.run_id.clone(),
            chunk: result.stderr.clone(),
        });
    }

    if result.success && result.exit_code == Some(0) {
        return BuildResult {
            session_id: result.session_id.clone(),
            driver_result: Some(result),
            error: None,
        };
    }

    let combined = format!("{}\n{}", result.stdout, result.stderr);
    let error = if !result.success && result.exit_code == Some(0) {
        AgentGateError::AgentTaskFailure { message: "agent reported failure with exit code 0".to_string() }
    } else {
        AgentGateError::classify_agent_failure(result.exit_code, &combined)
    };

    BuildResult { session_id: None, driver_result: Some(result), error: Some(error) }
}
