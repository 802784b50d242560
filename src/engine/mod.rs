//! Execution Engine facade (`spec.md` §4.12): the single public entry
//! point — accepts a work order, creates a run, loops phases through the
//! Phase Orchestrator, persists results, emits progress.

use crate::audit::{AuditDetails, AuditLog};
use crate::config::{parse_duration_to_secs, EngineConfig};
use crate::drivers::{DriverRegistry, SandboxProvider, Snapshotter, VcsAdapter, Verifier};
use crate::error::{AgentGateError, Result};
use crate::events::{StreamEvent, StreamEventPayload};
use crate::execution::run_guarded;
use crate::gates;
use crate::loop_strategy::{CompletionSignal, Decision, FixedStrategy, IterationSignal, LoopContext, LoopStrategy};
use crate::models::{AgentType, Run, RunResult, WorkOrder, WorkOrderStatus};
use crate::phases::{self, PhaseContext, PhaseServices, StreamSink};
use crate::resource_monitor::ResourceMonitor;
use crate::retry::RetryManager;
use crate::state_machine::{StateEvent, StateMachine};
use crate::store::WorkOrderStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

fn agent_type_key(agent_type: AgentType) -> &'static str {
    match agent_type {
        AgentType::ClaudeCodeSubscription => "claude-code-subscription",
        AgentType::OpenaiCodex => "openai-codex",
        AgentType::Opencode => "opencode",
    }
}

struct ActiveRun {
    work_order_id: String,
    cancelled: Arc<AtomicBool>,
}

/// The Engine's collaborators — everything the Phase Orchestrator and Gate
/// Pipeline need but that isn't itself part of the orchestration core
/// (`spec.md` §1's "external collaborators").
pub struct EngineServices {
    pub vcs_adapter: Arc<dyn VcsAdapter>,
    pub snapshotter: Arc<dyn Snapshotter>,
    pub verifier: Arc<dyn Verifier>,
    pub sandbox_provider: Arc<dyn SandboxProvider>,
    pub drivers: Arc<DriverRegistry>,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<WorkOrderStore>,
    state_machine: Arc<StateMachine>,
    resource_monitor: Arc<ResourceMonitor>,
    retry_manager: Arc<RetryManager>,
    audit: Arc<AuditLog>,
    services: EngineServices,
    active: Mutex<HashMap<String, ActiveRun>>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<WorkOrderStore>,
        state_machine: Arc<StateMachine>,
        resource_monitor: Arc<ResourceMonitor>,
        retry_manager: Arc<RetryManager>,
        audit: Arc<AuditLog>,
        services: EngineServices,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                config,
                store,
                state_machine,
                resource_monitor,
                retry_manager,
                audit,
                services,
                active: Mutex::new(HashMap::new()),
                event_tx,
            }),
            event_rx,
        )
    }

    pub async fn get_active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn get_status(&self, run_id: &str) -> Result<WorkOrderStatus> {
        let active = self.active.lock().await;
        let entry = active.get(run_id).ok_or_else(|| AgentGateError::RunNotFound(run_id.to_string()))?;
        let wo = self.store.load(&entry.work_order_id).await?;
        Ok(wo.status)
    }

    /// Marks `run_id` cancelled; the running loop observes this on its next
    /// cancellation check and breaks out cooperatively.
    pub async fn cancel(&self, run_id: &str, reason: &str) -> Result<()> {
        let active = self.active.lock().await;
        let entry = active.get(run_id).ok_or_else(|| AgentGateError::RunNotFound(run_id.to_string()))?;
        entry.cancelled.store(true, Ordering::SeqCst);
        self.audit
            .record(&entry.work_order_id, "run_cancel_requested", AuditDetails::Generic(serde_json::json!({"reason": reason})))
            .await;
        Ok(())
    }

    /// Cancels whichever active run belongs to `work_order_id`, if any.
    /// Used both by the cancel-work-order API and the Scheduler's
    /// dead-process sweep, neither of which tracks run ids directly.
    pub async fn cancel_by_work_order(&self, work_order_id: &str, reason: &str) -> Result<()> {
        let active = self.active.lock().await;
        let Some(entry) = active.values().find(|e| e.work_order_id == work_order_id) else {
            return Ok(());
        };
        entry.cancelled.store(true, Ordering::SeqCst);
        self.audit
            .record(work_order_id, "run_cancel_requested", AuditDetails::Generic(serde_json::json!({"reason": reason})))
            .await;
        Ok(())
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.event_tx.send(event);
    }

    fn stream_sink(&self, work_order_id: String) -> StreamSink {
        let tx = self.event_tx.clone();
        Arc::new(move |payload: StreamEventPayload| {
            let _ = tx.send(StreamEvent::new(work_order_id.clone(), payload));
        })
    }

    /// `execute`: creates a new Run, captures before-state, loops phases
    /// until the Loop Strategy says stop or `maxWallClock` elapses.
    pub async fn execute(self: &Arc<Self>, work_order: WorkOrder, workspace_path: String) -> Result<Run> {
        self.execute_with_slot(work_order, workspace_path, None).await
    }

    /// Same as [`Engine::execute`], but takes a slot the caller already
    /// reserved from the Resource Monitor (the Scheduler, at admission
    /// time) instead of letting the run acquire its own — the slot is
    /// transferred, not double-reserved.
    pub async fn execute_with_slot(
        self: &Arc<Self>,
        work_order: WorkOrder,
        workspace_path: String,
        slot: Option<crate::resource_monitor::SlotHandle>,
    ) -> Result<Run> {
        {
            let active = self.active.lock().await;
            if active.len() >= self.config.max_concurrent_runs {
                return Err(AgentGateError::ConcurrencyLimit { active: active.len(), max: self.config.max_concurrent_runs });
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.active.lock().await.insert(
            run_id.clone(),
            ActiveRun { work_order_id: work_order.id.clone(), cancelled: cancelled.clone() },
        );

        // The Scheduler admits work orders in PREPARING (post-claim); the
        // Engine owns the PREPARING -> RUNNING transition once it actually
        // starts driving iterations.
        self.state_machine
            .apply(&work_order.id, WorkOrderStatus::Preparing, StateEvent::Ready, 0)
            .await?;
        self.store.update_status(&work_order.id, WorkOrderStatus::Running).await?;

        let max_wall_clock_secs = if work_order.max_wall_clock_seconds > 0 {
            work_order.max_wall_clock_seconds
        } else {
            self.config.default_max_wall_clock_secs
        };

        let this = self.clone();
        let wo = work_order.clone();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(max_wall_clock_secs),
            this.run_iterations(wo, run_id.clone(), workspace_path, cancelled.clone(), slot),
        )
        .await;

        self.active.lock().await.remove(&run_id);

        match result {
            Ok(inner) => inner,
            Err(_) => {
                const TIMEOUT_MESSAGE: &str = "Execution timeout exceeded";
                self.state_machine
                    .apply(&work_order.id, WorkOrderStatus::Running, StateEvent::Fail { retryable: false, reason: TIMEOUT_MESSAGE.to_string() }, 0)
                    .await?;
                self.store.update_status(&work_order.id, WorkOrderStatus::Failed).await?;

                let mut run = Run::new(work_order.id.clone(), work_order.max_iterations);
                run.id = run_id.clone();
                run.state = WorkOrderStatus::Failed;
                run.result = Some(RunResult::FailedTimeout);
                run.completed_at = Some(chrono::Utc::now());

                self.audit
                    .record(
                        &work_order.id,
                        "run_failed",
                        AuditDetails::Failure {
                            message: TIMEOUT_MESSAGE.to_string(),
                            classification: format!("{:?}", crate::error::ErrorClass::Fatal),
                            stack: None,
                            exit_code: None,
                            context: "engine.execute.timeout".to_string(),
                        },
                    )
                    .await;
                // A timeout is a terminal `RunResult`, not an open-ended
                // failure, so it is projected through `RunCompleted` (the
                // only payload the run registry reads a `result` from)
                // rather than `RunFailed`.
                self.emit(StreamEvent::new(
                    work_order.id.clone(),
                    StreamEventPayload::RunCompleted {
                        work_order_id: work_order.id.clone(),
                        run_id: run.id.clone(),
                        result: format!("{:?}", RunResult::FailedTimeout),
                    },
                ));

                Err(AgentGateError::Timeout { message: TIMEOUT_MESSAGE.to_string() })
            }
        }
    }

    async fn run_iterations(
        self: &Arc<Self>,
        work_order: WorkOrder,
        run_id: String,
        workspace_path: String,
        cancelled: Arc<AtomicBool>,
        slot: Option<crate::resource_monitor::SlotHandle>,
    ) -> Result<Run> {
        let mut run = Run::new(work_order.id.clone(), work_order.max_iterations);
        run.id = run_id.clone();

        self.emit(StreamEvent::new(
            work_order.id.clone(),
            StreamEventPayload::RunStarted { work_order_id: work_order.id.clone(), run_id: run_id.clone() },
        ));

        let driver = self
            .services
            .drivers
            .agent_drivers
            .get(agent_type_key(work_order.agent_type))
            .cloned()
            .ok_or_else(|| AgentGateError::Configuration(format!("no agent driver registered for {:?}", work_order.agent_type)))?;

        let before_state = self.services.vcs_adapter.capture_before_state(&workspace_path).await?;

        let outcome = run_guarded(
            &work_order.id,
            self.resource_monitor.clone(),
            self.services.sandbox_provider.clone(),
            &workspace_path,
            std::time::Duration::ZERO,
            slot,
            {
                let sink = self.stream_sink(work_order.id.clone());
                move |payload| sink(payload)
            },
            |sandbox_path| {
                let this = self.clone();
                let work_order = work_order.clone();
                let run_id = run_id.clone();
                let driver = driver.clone();
                let before_state = before_state.clone();
                let cancelled = cancelled.clone();
                async move {
                    this.drive_loop(&work_order, run_id, sandbox_path, driver.as_ref(), before_state, cancelled)
                        .await
                }
            },
        )
        .await;

        match outcome {
            Ok((final_run, result)) => {
                run.iterations = final_run.iterations;
                run.iteration = final_run.iteration;
                run.session_id = final_run.session_id;
                run.result = Some(result);
                run.completed_at = Some(chrono::Utc::now());
                let status = match result {
                    RunResult::Passed => {
                        self.state_machine
                            .apply(&work_order.id, WorkOrderStatus::Running, StateEvent::Complete, 0)
                            .await?;
                        WorkOrderStatus::Completed
                    }
                    RunResult::Canceled => {
                        self.state_machine
                            .apply(&work_order.id, WorkOrderStatus::Running, StateEvent::Cancel { reason: "run cancelled".to_string() }, 0)
                            .await?;
                        WorkOrderStatus::Canceled
                    }
                    _ => {
                        self.state_machine
                            .apply(&work_order.id, WorkOrderStatus::Running, StateEvent::Fail { retryable: false, reason: format!("{result:?}") }, 0)
                            .await?;
                        WorkOrderStatus::Failed
                    }
                };
                self.store.update_status(&work_order.id, status).await?;
                self.emit(StreamEvent::new(
                    work_order.id.clone(),
                    StreamEventPayload::RunCompleted {
                        work_order_id: work_order.id.clone(),
                        run_id: run.id.clone(),
                        result: format!("{result:?}"),
                    },
                ));
                Ok(run)
            }
            Err(e) => {
                self.audit
                    .record(
                        &work_order.id,
                        "run_failed",
                        AuditDetails::Failure {
                            message: e.to_string(),
                            classification: format!("{:?}", e.classify()),
                            stack: None,
                            exit_code: None,
                            context: "engine.run_iterations".to_string(),
                        },
                    )
                    .await;
                let retryable = e.classify() == crate::error::ErrorClass::Retryable;
                self.state_machine
                    .apply(&work_order.id, WorkOrderStatus::Running, StateEvent::Fail { retryable, reason: e.to_string() }, 0)
                    .await?;
                if retryable && self.retry_manager.maybe_schedule(&work_order.id, 0, &e).await {
                    self.store.update_status(&work_order.id, WorkOrderStatus::WaitingRetry).await?;
                } else {
                    self.store.update_status(&work_order.id, WorkOrderStatus::Failed).await?;
                }
                self.emit(StreamEvent::new(
                    work_order.id.clone(),
                    StreamEventPayload::RunFailed { work_order_id: work_order.id.clone(), run_id: run.id.clone(), error: e.to_string() },
                ));
                Err(e)
            }
        }
    }

    async fn drive_loop(
        self: &Arc<Self>,
        work_order: &WorkOrder,
        run_id: String,
        workspace_path: String,
        driver: &dyn crate::drivers::AgentDriver,
        before_state: crate::drivers::BeforeState,
        cancelled: Arc<AtomicBool>,
    ) -> Result<(Run, RunResult)> {
        let mut run = Run::new(work_order.id.clone(), work_order.max_iterations);
        run.id = run_id.clone();

        let mut strategy: Box<dyn LoopStrategy> = Box::new(FixedStrategy {
            enabled_signals: vec![CompletionSignal::VerificationPass, CompletionSignal::NoChanges],
        });
        let mut loop_ctx = LoopContext { max_iterations: work_order.max_iterations, history: Vec::new() };
        let mut feedback: Option<String> = None;
        let mut prior_session_id = work_order.run_id.clone();
        let mut final_result = RunResult::FailedError;

        for iteration in 0..work_order.max_iterations {
            if cancelled.load(Ordering::SeqCst) {
                final_result = RunResult::Canceled;
                break;
            }

            let services = PhaseServices {
                agent_driver: driver,
                snapshotter: self.services.snapshotter.as_ref(),
                verifier: self.services.verifier.as_ref(),
            };
            let sink = self.stream_sink(work_order.id.clone());
            let ctx = PhaseContext {
                work_order_id: work_order.id.clone(),
                run_id: run_id.clone(),
                iteration,
                task_prompt: work_order.task_prompt.clone(),
                workspace_path: workspace_path.clone(),
                feedback: feedback.take(),
                prior_session_id: prior_session_id.clone(),
                before_state: before_state.clone(),
                gates: work_order.gates.clone(),
                stream: Some(sink),
            };

            let provisional_continue = iteration + 1 < work_order.max_iterations;
            let outcome = phases::run_iteration(&ctx, &services, provisional_continue).await;
            run.iteration = iteration;
            run.iterations.push(outcome.data.clone());
            prior_session_id = outcome.session_id.clone();
            run.session_id = outcome.session_id.clone();

            if let Some(snapshot) = &outcome.snapshot {
                self.audit
                    .record(
                        &work_order.id,
                        "snapshot_created",
                        AuditDetails::Generic(serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null)),
                    )
                    .await;
            }

            if let Some(e) = outcome.error {
                final_result = RunResult::FailedError;
                return Err(e);
            }

            let gate_result = if !work_order.gates.is_empty() {
                Some(
                    gates::run_pipeline(
                        &work_order.gates,
                        &self.services.drivers,
                        &workspace_path,
                        iteration,
                        outcome.snapshot.as_ref().map(|s| s.files_changed).unwrap_or(0),
                        outcome.verification.clone(),
                    )
                    .await,
                )
            } else {
                None
            };

            let verification_passed = gate_result.as_ref().map(|g| g.passed).unwrap_or_else(|| {
                outcome.verification.as_ref().map(|v| v.passed).unwrap_or(false)
            });

            let signal = IterationSignal {
                iteration,
                verification_passed,
                files_changed: outcome.snapshot.as_ref().map(|s| s.files_changed).unwrap_or(0),
                loop_detection_confidence: 0.0,
                ci_pass: None,
                progress_score: if verification_passed { 1.0 } else { 0.5 },
                fingerprint: outcome.snapshot.as_ref().map(|s| s.after_sha.clone()).unwrap_or_default(),
            };
            loop_ctx.history.push(signal);

            if verification_passed {
                final_result = RunResult::Passed;
                strategy.on_iteration_end(&loop_ctx, &Decision::Stop("verification_pass".to_string()));
                break;
            }

            let decision = strategy.should_continue(&loop_ctx);
            strategy.on_iteration_end(&loop_ctx, &decision);
            match decision {
                Decision::Continue => {
                    feedback = gate_result.and_then(|g| g.feedback).or(outcome.feedback_for_next);
                }
                Decision::Stop(_) => {
                    final_result = RunResult::FailedVerification;
                    break;
                }
                Decision::Pause => {
                    final_result = RunResult::FailedVerification;
                    break;
                }
            }
        }

        if run.iteration + 1 >= work_order.max_iterations && final_result == RunResult::FailedError {
            final_result = RunResult::FailedVerification;
        }

        Ok((run, final_result))
    }
}
