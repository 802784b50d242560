//! External collaborator interfaces (`spec.md` §1's "treated as external
//! collaborators with defined interfaces"): the AI agent process, VCS
//! snapshotting, verification level runners, and the sandbox provider.
//! Each is an interface value plus a string-keyed registry, never a deep
//! trait hierarchy (`spec.md` §9).

use crate::error::Result;
use crate::models::{Gate, VerificationReport, WorkspaceSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Raw result of one agent invocation, before Build-phase classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDriverResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub session_id: Option<String>,
    pub tokens_used: Option<u64>,
}

#[async_trait]
pub trait AgentDriver: Send + Sync {
    async fn run(
        &self,
        task_prompt: &str,
        feedback: Option<&str>,
        prior_session_id: Option<&str>,
        workspace_path: &str,
    ) -> Result<AgentDriverResult>;
}

/// Before-state captured ahead of the Build phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeforeState {
    pub sha: String,
    pub branch: String,
    pub dirty: bool,
}

#[async_trait]
pub trait VcsAdapter: Send + Sync {
    async fn capture_before_state(&self, workspace_path: &str) -> Result<BeforeState>;
}

#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn snapshot(
        &self,
        workspace_path: &str,
        before: &BeforeState,
        run_id: &str,
        iteration: u32,
    ) -> Result<crate::models::Snapshot>;
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, workspace_path: &str, gates: &[Gate]) -> Result<VerificationReport>;
}

/// An isolated environment in which the agent runs; created per work
/// order and destroyed on every exit path (`spec.md` §4.7).
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create_sandbox(&self, workspace_path: &str) -> Result<SandboxHandle>;
    async fn destroy_sandbox(&self, handle: &SandboxHandle) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
    pub workspace_path: String,
}

/// Resolves a `WorkspaceSource` to a concrete, ready-to-use filesystem path.
/// Cloning or scaffolding a GitHub-backed workspace is itself a
/// Git/workspace operation, which `spec.md` §1 treats as an external
/// collaborator concern (it names the snapshotter + VCS adapter, not this
/// resolver, but the same boundary applies): this crate's orchestration
/// core only needs *a path*, not an opinion on how one came to exist.
#[async_trait]
pub trait WorkspaceResolver: Send + Sync {
    async fn resolve(&self, source: &WorkspaceSource) -> Result<String>;
}

/// Runner for one gate check variant (`spec.md` §4.10).
#[async_trait]
pub trait GateRunner: Send + Sync {
    async fn run(&self, gate: &Gate, ctx: &GateRunnerContext) -> Result<crate::models::GateResult>;
}

pub struct GateRunnerContext {
    pub gate_name: String,
    pub workspace_path: String,
    pub prior_results: Vec<crate::models::GateResult>,
    pub verification_report: Option<VerificationReport>,
}

/// String-keyed registries, resolved at admission time rather than via
/// reflection (`spec.md` §9).
#[derive(Clone)]
pub struct DriverRegistry {
    pub agent_drivers: HashMap<String, Arc<dyn AgentDriver>>,
    pub gate_runners: HashMap<String, Arc<dyn GateRunner>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            agent_drivers: HashMap::new(),
            gate_runners: HashMap::new(),
        }
    }

    pub fn register_agent_driver(&mut self, key: impl Into<String>, driver: Arc<dyn AgentDriver>) {
        self.agent_drivers.insert(key.into(), driver);
    }

    pub fn register_gate_runner(&mut self, key: impl Into<String>, runner: Arc<dyn GateRunner>) {
        self.gate_runners.insert(key.into(), runner);
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub mod local;
