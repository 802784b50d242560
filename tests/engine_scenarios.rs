//! End-to-end Engine scenarios (`spec.md` §8): happy path, retry-on-OOM,
//! wall-clock timeout, and gate stop-on-failure, each driven through the
//! real `Engine`/`WorkOrderStore`/`AuditLog` wiring with fake external
//! collaborators.

mod common;

use agentgate::drivers::AgentDriverResult;
use agentgate::error::{AgentGateError, Result as AgResult};
use agentgate::models::{
    AgentType, Gate, GateCheck, GateCondition, GateFailureAction, GateFailurePolicy, RunResult, WorkOrder,
    WorkOrderStatus, WorkspaceSource,
};
use common::{build_harness, build_harness_with_gates, FakeGateRunner, ScriptedAgentDriver};
use std::sync::Arc;

fn local_work_order(max_iterations: u32, max_wall_clock_seconds: u64) -> WorkOrder {
    WorkOrder::new(
        "refactor the parser module".to_string(),
        WorkspaceSource::Local { path: "/tmp/agentgate-test".to_string() },
        AgentType::ClaudeCodeSubscription,
        max_iterations,
        max_wall_clock_seconds,
    )
}

/// Scenario 1: agent succeeds, verifier passes on the first iteration ->
/// the work order completes with `RunResult::Passed` and status
/// `Completed`.
#[tokio::test]
async fn happy_path_completes_on_first_passing_verification() {
    let driver = Arc::new(ScriptedAgentDriver::success_forever());
    let harness = build_harness(0, true, 3, driver).await;

    let wo = local_work_order(3, 60);
    harness.store.save(&wo).await.unwrap();

    let run = harness.engine.execute(wo.clone(), "/tmp/agentgate-test".to_string()).await.unwrap();

    assert_eq!(run.result, Some(RunResult::Passed));
    assert_eq!(harness.verifier.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    let reloaded = harness.store.load(&wo.id).await.unwrap();
    assert_eq!(reloaded.status, WorkOrderStatus::Completed);
}

/// Scenario 2: the agent driver is OOM-killed (exit 137); the error
/// classifies as retryable and the Retry Manager schedules a retry,
/// landing the work order in `WaitingRetry` rather than `Failed`.
#[tokio::test]
async fn oom_kill_schedules_a_retry_instead_of_failing() {
    let driver = Arc::new(ScriptedAgentDriver::success_forever().queue(Ok(AgentDriverResult {
        success: false,
        exit_code: Some(137),
        stdout: String::new(),
        stderr: "process killed: out of memory".to_string(),
        session_id: None,
        tokens_used: None,
    })));
    let harness = build_harness(3, true, 3, driver).await;

    let wo = local_work_order(3, 60);
    harness.store.save(&wo).await.unwrap();

    let outcome = harness.engine.execute(wo.clone(), "/tmp/agentgate-test".to_string()).await;
    assert!(matches!(outcome, Err(AgentGateError::OomKilled { .. })));

    let reloaded = harness.store.load(&wo.id).await.unwrap();
    assert_eq!(reloaded.status, WorkOrderStatus::WaitingRetry);

    let timeline = harness.audit.get_work_order_timeline(&wo.id).await;
    assert!(timeline.iter().any(|e| e.event_type == "run_failed"));
}

/// Scenario 3: the agent hangs past `maxWallClock`; the Engine's timeout
/// wrapper fires, marking the work order `Failed` with a timeout error
/// rather than leaving it stuck `Running`.
#[tokio::test]
async fn wall_clock_timeout_fails_a_hung_run() {
    let driver = Arc::new(ScriptedAgentDriver::with_delay(std::time::Duration::from_secs(2)));
    let harness = build_harness(0, true, 3, driver).await;

    let wo = local_work_order(3, 1);
    harness.store.save(&wo).await.unwrap();

    let outcome = harness.engine.execute(wo.clone(), "/tmp/agentgate-test".to_string()).await;
    assert!(matches!(outcome, Err(AgentGateError::Timeout { .. })));

    let reloaded = harness.store.load(&wo.id).await.unwrap();
    assert_eq!(reloaded.status, WorkOrderStatus::Failed);
}

/// Scenario 4: a gate configured with `onFailure.action = stop` fails on
/// the only iteration available; the pipeline records `stoppedAt` and the
/// run finishes as `FailedVerification` rather than retrying blindly.
#[tokio::test]
async fn failing_stop_gate_ends_the_run_as_failed_verification() {
    let driver = Arc::new(ScriptedAgentDriver::success_forever());
    let failing_gate_runner: Arc<dyn agentgate::drivers::GateRunner> =
        Arc::new(FakeGateRunner { passed: false, message: "lint found 3 errors".to_string() });
    let harness =
        build_harness_with_gates(0, true, 3, driver, vec![("custom-command", failing_gate_runner)]).await;

    let mut wo = local_work_order(1, 60);
    wo.gates = vec![Gate {
        name: "lint".to_string(),
        check: GateCheck::CustomCommand { command: "cargo clippy".to_string() },
        on_failure: GateFailurePolicy {
            action: GateFailureAction::Stop,
            max_attempts: 1,
            feedback_mode: "full".to_string(),
            backoff: false,
        },
        on_success: None,
        condition: GateCondition::Always,
        skip_if: None,
    }];
    harness.store.save(&wo).await.unwrap();

    let run = harness.engine.execute(wo.clone(), "/tmp/agentgate-test".to_string()).await.unwrap();

    assert_eq!(run.result, Some(RunResult::FailedVerification));
    let reloaded = harness.store.load(&wo.id).await.unwrap();
    assert_eq!(reloaded.status, WorkOrderStatus::Failed);
}

/// A non-retryable agent failure (e.g. a fatal/invalid result) should not
/// be handed to the Retry Manager at all.
#[tokio::test]
async fn non_retryable_failure_goes_straight_to_failed() {
    let driver = Arc::new(ScriptedAgentDriver::success_forever().queue(Ok(AgentDriverResult {
        success: false,
        exit_code: Some(1),
        stdout: String::new(),
        stderr: "unexpected panic in agent harness".to_string(),
        session_id: None,
        tokens_used: None,
    }) as AgResult<AgentDriverResult>));
    let harness = build_harness(5, true, 3, driver).await;

    let wo = local_work_order(3, 60);
    harness.store.save(&wo).await.unwrap();

    let outcome = harness.engine.execute(wo.clone(), "/tmp/agentgate-test".to_string()).await;
    assert!(outcome.is_err());

    let reloaded = harness.store.load(&wo.id).await.unwrap();
    assert_eq!(reloaded.status, WorkOrderStatus::Failed);
}
