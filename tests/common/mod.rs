//! Shared fixtures for the end-to-end scenario tests (`spec.md` §8).
//! Fakes stand in for the external collaborators (agent process, VCS,
//! verifier) so the scenarios exercise the real Store/Engine/Scheduler
//! wiring without shelling out to git or a real agent binary.

use agentgate::audit::AuditLog;
use agentgate::config::{EngineConfig, ResourceMonitorConfig, RetryConfig, SchedulerConfig};
use agentgate::drivers::local::InProcessSandboxProvider;
use agentgate::drivers::{
    AgentDriver, AgentDriverResult, BeforeState, DriverRegistry, GateRunner, GateRunnerContext, Snapshotter, VcsAdapter,
    Verifier,
};
use agentgate::engine::{Engine, EngineServices};
use agentgate::error::Result;
use agentgate::events::StreamEvent;
use agentgate::models::{LevelResult, Snapshot, VerificationReport};
use agentgate::resource_monitor::ResourceMonitor;
use agentgate::retry::RetryManager;
use agentgate::state_machine::StateMachine;
use agentgate::store::WorkOrderStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Always-successful agent run, optionally with an injected delay so
/// wall-clock-timeout scenarios have something to time out on.
pub struct ScriptedAgentDriver {
    pub results: std::sync::Mutex<std::collections::VecDeque<Result<AgentDriverResult>>>,
    pub delay: std::time::Duration,
}

impl ScriptedAgentDriver {
    pub fn success_forever() -> Self {
        Self { results: std::sync::Mutex::new(std::collections::VecDeque::new()), delay: std::time::Duration::ZERO }
    }

    pub fn with_delay(delay: std::time::Duration) -> Self {
        Self { results: std::sync::Mutex::new(std::collections::VecDeque::new()), delay }
    }

    pub fn queue(self, result: Result<AgentDriverResult>) -> Self {
        self.results.lock().unwrap().push_back(result);
        self
    }
}

fn ok_result() -> AgentDriverResult {
    AgentDriverResult {
        success: true,
        exit_code: Some(0),
        stdout: "did the thing".to_string(),
        stderr: String::new(),
        session_id: Some("session-1".to_string()),
        tokens_used: Some(100),
    }
}

#[async_trait]
impl AgentDriver for ScriptedAgentDriver {
    async fn run(&self, _task_prompt: &str, _feedback: Option<&str>, _prior_session_id: Option<&str>, _workspace_path: &str) -> Result<AgentDriverResult> {
        if self.delay > std::time::Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.results.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => Ok(ok_result()),
        }
    }
}

pub struct FakeVcsAdapter;

#[async_trait]
impl VcsAdapter for FakeVcsAdapter {
    async fn capture_before_state(&self, _workspace_path: &str) -> Result<BeforeState> {
        Ok(BeforeState { sha: "deadbeef".to_string(), branch: "main".to_string(), dirty: false })
    }
}

pub struct FakeSnapshotter {
    pub files_changed: u32,
}

#[async_trait]
impl Snapshotter for FakeSnapshotter {
    async fn snapshot(&self, _workspace_path: &str, before: &BeforeState, run_id: &str, iteration: u32) -> Result<Snapshot> {
        if self.files_changed == 0 {
            return Ok(Snapshot::no_changes(run_id.to_string(), iteration, before.sha.clone(), before.branch.clone()));
        }
        Ok(Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            iteration,
            before_sha: before.sha.clone(),
            after_sha: "cafefeed".to_string(),
            branch: before.branch.clone(),
            commit_message: "agent changes".to_string(),
            files_changed: self.files_changed,
            insertions: self.files_changed * 3,
            deletions: 1,
            created_at: chrono::Utc::now(),
        })
    }
}

/// Reports `passed` on every call; `calls` lets a test assert how many
/// iterations actually ran before the loop stopped.
pub struct FakeVerifier {
    pub passed: bool,
    pub calls: AtomicUsize,
}

impl FakeVerifier {
    pub fn new(passed: bool) -> Self {
        Self { passed, calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Verifier for FakeVerifier {
    async fn verify(&self, _workspace_path: &str, _gates: &[agentgate::models::Gate]) -> Result<VerificationReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(VerificationReport {
            levels: vec![LevelResult {
                level: 0,
                passed: self.passed,
                checks: Vec::new(),
                duration_ms: 5,
            }],
            passed: self.passed,
            total_duration_ms: 5,
            diagnostics: HashMap::new(),
        })
    }
}

/// Gate runner whose verdict is fixed at construction, standing in for a
/// real `custom-command`/`verification-levels` runner in gate-pipeline
/// scenarios.
pub struct FakeGateRunner {
    pub passed: bool,
    pub message: String,
}

#[async_trait]
impl GateRunner for FakeGateRunner {
    async fn run(&self, gate: &agentgate::models::Gate, _ctx: &GateRunnerContext) -> Result<agentgate::models::GateResult> {
        Ok(agentgate::models::GateResult {
            gate_name: gate.name.clone(),
            passed: self.passed,
            skipped: false,
            message: self.message.clone(),
            duration_ms: 1,
            details: None,
        })
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig { max_concurrent_runs: 4, default_max_iterations: 3, default_max_wall_clock_secs: 3600 }
}

pub fn resource_monitor_config() -> ResourceMonitorConfig {
    ResourceMonitorConfig { max_concurrent_slots: 4, memory_per_slot_mb: 1, poll_interval_ms: 60_000 }
}

pub fn retry_config(max_retries: u32) -> RetryConfig {
    RetryConfig { max_retries, base_delay_ms: 5, max_delay_ms: 20, backoff_multiplier: 2.0, jitter_factor: 0.0 }
}

pub fn scheduler_config(stale_threshold_ms: u64, max_running_time_ms: u64) -> SchedulerConfig {
    SchedulerConfig {
        tick_interval_ms: 50,
        stagger_delay_ms: 0,
        stale_check_interval_ms: 50,
        stale_threshold_ms,
        max_running_time_ms,
        shutdown_grace_ms: 100,
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub engine_rx: mpsc::UnboundedReceiver<StreamEvent>,
    pub store: Arc<WorkOrderStore>,
    pub audit: Arc<AuditLog>,
    pub verifier: Arc<FakeVerifier>,
    _tempdir: tempfile::TempDir,
}

/// Assembles a real `Engine` wired to fakes for every external
/// collaborator, backed by a real on-disk `WorkOrderStore` in a scratch
/// directory.
pub async fn build_harness(
    max_retries: u32,
    verifier_passes: bool,
    files_changed: u32,
    agent_driver: Arc<dyn AgentDriver>,
) -> Harness {
    build_harness_with_gates(max_retries, verifier_passes, files_changed, agent_driver, Vec::new()).await
}

pub async fn build_harness_with_gates(
    max_retries: u32,
    verifier_passes: bool,
    files_changed: u32,
    agent_driver: Arc<dyn AgentDriver>,
    gate_runners: Vec<(&str, Arc<dyn GateRunner>)>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(WorkOrderStore::new(dir.path()).await.unwrap());
    let audit = Arc::new(AuditLog::new(1_000));
    let state_machine = Arc::new(StateMachine::new(audit.clone(), max_retries));
    let resource_monitor = ResourceMonitor::new(resource_monitor_config());
    let (retry_manager, _retry_rx) = RetryManager::new(retry_config(max_retries));

    let mut drivers = DriverRegistry::new();
    drivers.register_agent_driver("claude-code-subscription", agent_driver);
    for (key, runner) in gate_runners {
        drivers.register_gate_runner(key, runner);
    }
    let drivers = Arc::new(drivers);

    let verifier = Arc::new(FakeVerifier::new(verifier_passes));

    let services = EngineServices {
        vcs_adapter: Arc::new(FakeVcsAdapter),
        snapshotter: Arc::new(FakeSnapshotter { files_changed }),
        verifier: verifier.clone(),
        sandbox_provider: Arc::new(InProcessSandboxProvider),
        drivers,
    };

    let (engine, engine_rx) = Engine::new(
        engine_config(),
        store.clone(),
        state_machine,
        resource_monitor,
        retry_manager,
        audit.clone(),
        services,
    );

    Harness { engine, engine_rx, store, audit, verifier, _tempdir: dir }
}
