//! Snapshot phase (`spec.md` §4.8.2): captures post-agent VCS state.

use super::PhaseContext;
use crate::drivers::Snapshotter;
use crate::error::{AgentGateError, Result};
use crate::models::Snapshot;

pub async fn run(ctx: &PhaseContext, snapshotter: &dyn Snapshotter) -> Result<Snapshot> {
    snapshotter
        .snapshot(&ctx.workspace_path, &ctx.before_state, &ctx.run_id, ctx.iteration)
        .await
        .map_err(|e| AgentGateError::SnapshotError(e.to_string()))
}
