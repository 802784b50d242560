//! Core data model: work orders, runs, iterations, snapshots, verification
//! reports and gates (`spec.md` §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Where the agent's workspace comes from. Tagged to match the REST body
/// schema in `spec.md` §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkspaceSource {
    Local {
        path: String,
    },
    #[serde(rename = "github")]
    GitHubClone {
        owner: String,
        repo: String,
        #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
        git_ref: Option<String>,
    },
    #[serde(rename = "github-new")]
    GitHubNew {
        owner: String,
        repo_name: String,
        #[serde(default)]
        private: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        template: Option<String>,
    },
}

/// Which agent backend should run the work order (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    ClaudeCodeSubscription,
    OpenaiCodex,
    Opencode,
}

impl Default for AgentType {
    fn default() -> Self {
        Self::ClaudeCodeSubscription
    }
}

/// Lifecycle status of a work order. Mirrors the state machine's states
/// (`spec.md` §4.3) in their on-disk, externally-visible spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    Pending,
    Preparing,
    Running,
    Completed,
    Failed,
    WaitingRetry,
    Canceled,
}

impl WorkOrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Terminal classification of a finished run (`spec.md` §7's `RunResult`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Passed,
    FailedVerification,
    FailedError,
    FailedTimeout,
    Canceled,
}

/// A persistent request for the system to drive a workspace to green.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrder {
    pub id: String,
    pub task_prompt: String,
    pub workspace_source: WorkspaceSource,
    pub agent_type: AgentType,
    pub max_iterations: u32,
    pub max_wall_clock_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub status: WorkOrderStatus,
    pub parent_id: Option<String>,
    pub root_id: Option<String>,
    pub depth: u32,
    pub run_id: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub terminal_error: Option<String>,
    #[serde(default)]
    pub gates: Vec<Gate>,
}

impl WorkOrder {
    pub fn new(
        task_prompt: String,
        workspace_source: WorkspaceSource,
        agent_type: AgentType,
        max_iterations: u32,
        max_wall_clock_seconds: u64,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            id: id.clone(),
            task_prompt,
            workspace_source,
            agent_type,
            max_iterations,
            max_wall_clock_seconds,
            created_at: Utc::now(),
            status: WorkOrderStatus::Pending,
            parent_id: None,
            root_id: None,
            depth: 0,
            run_id: None,
            completed_at: None,
            terminal_error: None,
            gates: Vec::new(),
        }
    }

    /// A spawned child references its parent by id only, never by pointer
    /// (`spec.md` §9: cyclic references are avoided).
    pub fn spawn_child(&self, task_prompt: String, workspace_source: WorkspaceSource) -> Self {
        let mut child = Self::new(
            task_prompt,
            workspace_source,
            self.agent_type,
            self.max_iterations,
            self.max_wall_clock_seconds,
        );
        child.parent_id = Some(self.id.clone());
        child.root_id = Some(self.root_id.clone().unwrap_or_else(|| self.id.clone()));
        child.depth = self.depth + 1;
        child
    }
}

/// One attempt at a work order, composed of iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub work_order_id: String,
    pub state: WorkOrderStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<RunResult>,
    pub iterations: Vec<IterationData>,
    pub session_id: Option<String>,
    pub vcs_branch: Option<String>,
    pub pull_request_url: Option<String>,
}

impl Run {
    pub fn new(work_order_id: String, max_iterations: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            work_order_id,
            state: WorkOrderStatus::Preparing,
            iteration: 0,
            max_iterations,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            iterations: Vec::new(),
            session_id: None,
            vcs_branch: None,
            pull_request_url: None,
        }
    }
}

/// Per-phase timing for one iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTimings {
    pub build_ms: u64,
    pub snapshot_ms: u64,
    pub verify_ms: u64,
    pub feedback_ms: u64,
}

impl PhaseTimings {
    pub fn total_ms(&self) -> u64 {
        self.build_ms + self.snapshot_ms + self.verify_ms + self.feedback_ms
    }
}

/// Record of one Build -> Snapshot -> Verify -> Feedback cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationData {
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub timings: PhaseTimings,
    pub snapshot_id: Option<String>,
    pub verification_passed: Option<bool>,
    pub feedback_generated: bool,
    pub error: Option<String>,
}

impl IterationData {
    pub fn new(iteration: u32) -> Self {
        Self {
            iteration,
            started_at: Utc::now(),
            ended_at: None,
            timings: PhaseTimings::default(),
            snapshot_id: None,
            verification_passed: None,
            feedback_generated: false,
            error: None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self.ended_at {
            Some(end) => (end - self.started_at).num_milliseconds().max(0) as u64,
            None => 0,
        }
    }
}

/// Captured VCS state after the agent's changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub run_id: String,
    pub iteration: u32,
    pub before_sha: String,
    pub after_sha: String,
    pub branch: String,
    pub commit_message: String,
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn no_changes(run_id: String, iteration: u32, sha: String, branch: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id,
            iteration,
            before_sha: sha.clone(),
            after_sha: sha,
            branch,
            commit_message: String::new(),
            files_changed: 0,
            insertions: 0,
            deletions: 0,
            created_at: Utc::now(),
        }
    }
}

/// A single named check inside a verification level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// Result of one verification level (L0 contract .. L3 integration).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelResult {
    pub level: u8,
    pub passed: bool,
    pub checks: Vec<CheckResult>,
    pub duration_ms: u64,
}

/// Aggregated output of the Verifier for one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub levels: Vec<LevelResult>,
    pub passed: bool,
    pub total_duration_ms: u64,
    pub diagnostics: HashMap<String, String>,
}

impl VerificationReport {
    pub fn all_passed(&self) -> bool {
        self.passed
    }

    pub fn failing_checks(&self) -> Vec<&CheckResult> {
        self.levels
            .iter()
            .flat_map(|l| l.checks.iter())
            .filter(|c| !c.passed)
            .collect()
    }
}

/// Action a gate's failure policy can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateFailureAction {
    Iterate,
    Stop,
    Escalate,
}

/// Variant of check a gate performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GateCheck {
    VerificationLevels,
    CiPoll,
    CustomCommand { command: String },
    Approval,
    Convergence,
}

/// When a gate should be evaluated at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateCondition {
    Always,
    OnChange,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateFailurePolicy {
    pub action: GateFailureAction,
    pub max_attempts: u32,
    pub feedback_mode: String,
    pub backoff: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateSuccessAction {
    Continue,
    SkipRemaining,
}

/// One ordered checkpoint in the gate pipeline (`spec.md` §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gate {
    pub name: String,
    pub check: GateCheck,
    pub on_failure: GateFailurePolicy,
    pub on_success: Option<GateSuccessAction>,
    pub condition: GateCondition,
    pub skip_if: Option<String>,
}

/// Result of evaluating one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub gate_name: String,
    pub passed: bool,
    pub skipped: bool,
    pub message: String,
    pub duration_ms: u64,
    pub details: Option<serde_json::Value>,
}

/// Outcome of running the whole gate pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatePipelineResult {
    pub passed: bool,
    pub results: Vec<GateResult>,
    pub stopped_at: Option<String>,
    pub feedback: Option<String>,
}
