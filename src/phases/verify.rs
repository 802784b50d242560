//! Verify phase (`spec.md` §4.8.3): runs the configured verifier against
//! the gate plan. Report persistence is the caller's responsibility and is
//! best-effort — a persistence failure must never fail this phase.

use super::PhaseContext;
use crate::drivers::Verifier;
use crate::error::Result;
use crate::models::VerificationReport;

pub async fn run(ctx: &PhaseContext, verifier: &dyn Verifier) -> Result<VerificationReport> {
    verifier.verify(&ctx.workspace_path, &ctx.gates).await
}
