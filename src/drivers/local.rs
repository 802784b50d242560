//! Default, in-process implementations of the external collaborator
//! traits: enough to run the engine end-to-end in tests and local
//! development. Grounded in the teacher's `CliClient`/`command_builder`
//! pattern of shelling out via `std::process::Command` and capturing
//! stdout/stderr, but generalised from "call the Claude CLI" to "run any
//! configured command".

use super::{
    AgentDriver, AgentDriverResult, BeforeState, GateRunner, GateRunnerContext, SandboxHandle,
    SandboxProvider, Snapshotter, VcsAdapter, Verifier, WorkspaceResolver,
};
use crate::error::{AgentGateError, Result};
use crate::models::{CheckResult, Gate, GateCheck, GateResult, LevelResult, Snapshot, VerificationReport, WorkspaceSource};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Instant;
use tokio::process::Command;
use uuid::Uuid;

/// Runs a configured shell command as the agent, treating exit 0 as
/// success. Real deployments supply a richer driver; this one exists so
/// the orchestration core is exercisable without one.
pub struct LocalAgentDriver {
    pub command: String,
    pub args: Vec<String>,
}

#[async_trait]
impl AgentDriver for LocalAgentDriver {
    async fn run(
        &self,
        task_prompt: &str,
        feedback: Option<&str>,
        prior_session_id: Option<&str>,
        workspace_path: &str,
    ) -> Result<AgentDriverResult> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args).current_dir(workspace_path).env("AGENTGATE_TASK_PROMPT", task_prompt);
        if let Some(fb) = feedback {
            cmd.env("AGENTGATE_FEEDBACK", fb);
        }
        if let Some(session) = prior_session_id {
            cmd.env("AGENTGATE_SESSION_ID", session);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| AgentGateError::SandboxCreationFailed { message: e.to_string() })?;
        Ok(AgentDriverResult {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            session_id: Some(Uuid::new_v4().to_string()),
            tokens_used: None,
        })
    }
}

/// Shells out to `git` the way the teacher's `git_ops.rs` does for its
/// self-update snapshots, but generalised into the `Snapshotter`/
/// `VcsAdapter` interfaces this crate's Snapshot phase expects.
pub struct GitVcsAdapter;

async fn run_git(workspace_path: &str, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace_path)
        .output()
        .await
        .map_err(|e| AgentGateError::WorkspaceError(e.to_string()))?;
    if !output.status.success() {
        return Err(AgentGateError::WorkspaceError(format!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl VcsAdapter for GitVcsAdapter {
    async fn capture_before_state(&self, workspace_path: &str) -> Result<BeforeState> {
        let sha = run_git(workspace_path, &["rev-parse", "HEAD"]).await?;
        let branch = run_git(workspace_path, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let status = run_git(workspace_path, &["status", "--porcelain"]).await?;
        Ok(BeforeState { sha, branch, dirty: !status.is_empty() })
    }
}

pub struct GitSnapshotter;

#[async_trait]
impl Snapshotter for GitSnapshotter {
    async fn snapshot(
        &self,
        workspace_path: &str,
        before: &BeforeState,
        run_id: &str,
        iteration: u32,
    ) -> Result<Snapshot> {
        let status = run_git(workspace_path, &["status", "--porcelain"])
            .await
            .map_err(|e| AgentGateError::SnapshotError(e.to_string()))?;
        if status.is_empty() {
            return Ok(Snapshot::no_changes(run_id.to_string(), iteration, before.sha.clone(), before.branch.clone()));
        }
        let message = format!("agentgate: iteration {iteration}");
        run_git(workspace_path, &["add", "-A"]).await.map_err(|e| AgentGateError::SnapshotError(e.to_string()))?;
        run_git(workspace_path, &["commit", "-m", &message])
            .await
            .map_err(|e| AgentGateError::SnapshotError(e.to_string()))?;
        let after_sha = run_git(workspace_path, &["rev-parse", "HEAD"])
            .await
            .map_err(|e| AgentGateError::SnapshotError(e.to_string()))?;
        let stat = run_git(workspace_path, &["diff", "--shortstat", &before.sha, &after_sha])
            .await
            .unwrap_or_default();
        let (insertions, deletions) = parse_shortstat(&stat);
        let files_changed = status.lines().count() as u32;
        Ok(Snapshot {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            iteration,
            before_sha: before.sha.clone(),
            after_sha,
            branch: before.branch.clone(),
            commit_message: message,
            files_changed,
            insertions,
            deletions,
            created_at: chrono::Utc::now(),
        })
    }
}

fn parse_shortstat(stat: &str) -> (u32, u32) {
    let mut insertions = 0u32;
    let mut deletions = 0u32;
    for part in stat.split(',') {
        let part = part.trim();
        if let Some(n) = part.strip_suffix(" insertion(+)").or_else(|| part.strip_suffix(" insertions(+)")) {
            insertions = n.trim().parse().unwrap_or(0);
        } else if let Some(n) = part.strip_suffix(" deletion(-)").or_else(|| part.strip_suffix(" deletions(-)")) {
            deletions = n.trim().parse().unwrap_or(0);
        }
    }
    (insertions, deletions)
}

/// Runs one configured shell command per verification level.
pub struct CommandVerifier {
    pub level_commands: HashMap<u8, Vec<String>>,
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn verify(&self, workspace_path: &str, _gates: &[Gate]) -> Result<VerificationReport> {
        let mut levels = Vec::new();
        let mut all_passed = true;
        let total_start = Instant::now();
        let mut sorted_levels: Vec<_> = self.level_commands.keys().copied().collect();
        sorted_levels.sort_unstable();
        for level in sorted_levels {
            let commands = &self.level_commands[&level];
            let level_start = Instant::now();
            let mut checks = Vec::new();
            let mut level_passed = true;
            for command in commands {
                let start = Instant::now();
                let output = Command::new("sh").arg("-c").arg(command).current_dir(workspace_path).output().await;
                let (passed, message) = match output {
                    Ok(out) => (out.status.success(), String::from_utf8_lossy(&out.stdout).to_string()),
                    Err(e) => (false, e.to_string()),
                };
                level_passed &= passed;
                checks.push(CheckResult {
                    name: command.clone(),
                    passed,
                    message,
                    details: None,
                });
                let _ = start.elapsed();
            }
            all_passed &= level_passed;
            levels.push(LevelResult {
                level,
                passed: level_passed,
                checks,
                duration_ms: level_start.elapsed().as_millis() as u64,
            });
        }
        Ok(VerificationReport {
            levels,
            passed: all_passed,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
            diagnostics: HashMap::new(),
        })
    }
}

/// Resolves `Local` sources directly; GitHub-backed sources need a clone or
/// repo-creation step this crate does not implement (`spec.md` §1 puts
/// Git/workspace operations out of scope), so they fail fast with a clear
/// error rather than silently falling back to some default path.
pub struct LocalOnlyWorkspaceResolver;

#[async_trait]
impl WorkspaceResolver for LocalOnlyWorkspaceResolver {
    async fn resolve(&self, source: &WorkspaceSource) -> Result<String> {
        match source {
            WorkspaceSource::Local { path } => Ok(path.clone()),
            WorkspaceSource::GitHubClone { owner, repo, .. } => Err(AgentGateError::GithubError(format!(
                "no WorkspaceResolver configured to clone {owner}/{repo}; supply one backed by a real VCS adapter"
            ))),
            WorkspaceSource::GitHubNew { owner, repo_name, .. } => Err(AgentGateError::GithubError(format!(
                "no WorkspaceResolver configured to create {owner}/{repo_name}; supply one backed by the GitHub API"
            ))),
        }
    }
}

/// A sandbox is just the workspace path for the in-process default
/// provider: no container boundary. Real deployments supply a real
/// `SandboxProvider` (`spec.md` §1's sandboxing policy Non-goal).
pub struct InProcessSandboxProvider;

#[async_trait]
impl SandboxProvider for InProcessSandboxProvider {
    async fn create_sandbox(&self, workspace_path: &str) -> Result<SandboxHandle> {
        Ok(SandboxHandle { id: Uuid::new_v4().to_string(), workspace_path: workspace_path.to_string() })
    }

    async fn destroy_sandbox(&self, _handle: &SandboxHandle) -> Result<()> {
        Ok(())
    }
}

/// Gate runner for `GateCheck::VerificationLevels`: delegates to the
/// context's prior verification report.
pub struct VerificationGateRunner;

#[async_trait]
impl GateRunner for VerificationGateRunner {
    async fn run(&self, gate: &Gate, ctx: &GateRunnerContext) -> Result<GateResult> {
        let start = Instant::now();
        let passed = ctx.verification_report.as_ref().map(|r| r.passed).unwrap_or(false);
        let message = if passed {
            "all verification levels passed".to_string()
        } else {
            "one or more verification levels failed".to_string()
        };
        Ok(GateResult {
            gate_name: gate.name.clone(),
            passed,
            skipped: false,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
            details: ctx.verification_report.as_ref().and_then(|r| serde_json::to_value(r).ok()),
        })
    }
}

/// Gate runner for `GateCheck::CustomCommand`. Stateless: the workspace to
/// run in comes from the per-call `GateRunnerContext`, since one registry
/// instance is shared across every run.
pub struct CustomCommandGateRunner;

#[async_trait]
impl GateRunner for CustomCommandGateRunner {
    async fn run(&self, gate: &Gate, ctx: &GateRunnerContext) -> Result<GateResult> {
        let start = Instant::now();
        let GateCheck::CustomCommand { command } = &gate.check else {
            return Ok(GateResult {
                gate_name: gate.name.clone(),
                passed: false,
                skipped: false,
                message: format!("No runner for type '{:?}'", gate.check),
                duration_ms: start.elapsed().as_millis() as u64,
                details: None,
            });
        };
        let output = Command::new("sh").arg("-c").arg(command).current_dir(&ctx.workspace_path).output().await;
        let (passed, message) = match output {
            Ok(out) => (out.status.success(), String::from_utf8_lossy(&out.stdout).to_string()),
            Err(e) => (false, e.to_string()),
        };
        Ok(GateResult {
            gate_name: gate.name.clone(),
            passed,
            skipped: false,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
            details: None,
        })
    }
}
