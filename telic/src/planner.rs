//! Planning phase driver: VRC-1 → plan generation → blocker verification →
//! quality gates → planning → VRC-2 → preflight.
//!
//! Quality gates run a bounded remediation loop: the gate agent edits its
//! own inputs until a re-hash shows no further changes. Gate exhaustion
//! passes anyway — the loop must make forward progress even under imperfect
//! upstream quality; stuck detection is the backstop.

use std::fs;
use std::path::Path;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::agents::AgentCtx;
use crate::core::gates::Gate;
use crate::core::types::{AgentRole, ResultToken};
use crate::io::state::LoopState;

/// Remediation rounds per quality gate before it passes unconditionally.
const MAX_REMEDIATION_ROUNDS: u32 = 3;

/// What the planner observed; `files_changed` feeds the outer stuck
/// detector (remediation edits count as progress).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanningOutcome {
    pub files_changed: bool,
    /// Plan generation was attempted but the plan file still does not
    /// exist; the decision engine retries on the next pass.
    pub plan_missing: bool,
}

/// Run every planning activity whose gate is not yet passed.
pub fn run_planning(ctx: &AgentCtx<'_>, state: &mut LoopState) -> Result<PlanningOutcome> {
    let mut outcome = PlanningOutcome::default();
    let iteration = state.iteration;

    if !state.is_passed(&Gate::Vrc1) {
        let invocation = ctx.invoke_default(AgentRole::VisionRealityCheck, "vrc1", iteration, &[]);
        match invocation {
            Ok(inv) if inv.token != ResultToken::Pass => {
                warn!(token = %inv.token, "vrc1 reported gaps, continuing");
            }
            Err(err) => warn!(%err, "vrc1 invocation failed, continuing"),
            Ok(_) => {}
        }
        state.mark_passed(Gate::Vrc1);
        outcome.files_changed = true;
    }

    // Plan generation is guarded by the plan file itself, not a named gate:
    // once the file exists the planner never regenerates it wholesale.
    if !ctx.sprint.plan_exists() {
        info!("plan file missing, generating");
        if let Err(err) =
            ctx.invoke_default(AgentRole::PlanGeneration, "plan-generation", iteration, &[])
        {
            warn!(%err, "plan generation invocation failed");
        }
        if !ctx.sprint.plan_exists() {
            warn!("plan generation produced no plan file");
            outcome.plan_missing = true;
            return Ok(outcome);
        }
        outcome.files_changed = true;
    }

    // Blocker verification is idempotent; it runs on every planning pass so
    // reclassified blockers surface before the quality gates look at the
    // plan.
    if let Err(err) =
        ctx.invoke_default(AgentRole::VerifyBlockers, "verify-blockers", iteration, &[])
    {
        warn!(%err, "verify-blockers invocation failed, continuing");
    }

    for (gate, role) in quality_pipeline() {
        if state.is_passed(&gate) {
            continue;
        }
        let changed = run_remediation_loop(ctx, state, &gate, role)?;
        outcome.files_changed |= changed;
        state.mark_passed(gate);
    }

    if !state.is_passed(&Gate::Planning) {
        state.mark_passed(Gate::Planning);
    }

    if !state.is_passed(&Gate::Vrc2) {
        if let Err(err) = ctx.invoke_default(AgentRole::VisionRealityCheck, "vrc2", iteration, &[])
        {
            warn!(%err, "vrc2 invocation failed, continuing");
        }
        state.mark_passed(Gate::Vrc2);
    }

    if !state.is_passed(&Gate::Preflight) {
        if let Err(err) = ctx.invoke_default(AgentRole::Preflight, "preflight", iteration, &[]) {
            warn!(%err, "preflight invocation failed, continuing");
        }
        state.mark_passed(Gate::Preflight);
    }

    Ok(outcome)
}

fn quality_pipeline() -> [(Gate, AgentRole); 5] {
    [
        (Gate::QualityCraap, AgentRole::QualityCraap),
        (Gate::QualityClarity, AgentRole::QualityClarity),
        (Gate::QualityValidate, AgentRole::QualityValidate),
        (Gate::QualityConnect, AgentRole::QualityConnect),
        (Gate::QualityTidy, AgentRole::QualityTidy),
    ]
}

/// One quality gate's self-healing loop. Returns whether any round changed
/// the gated files.
fn run_remediation_loop(
    ctx: &AgentCtx<'_>,
    state: &LoopState,
    gate: &Gate,
    role: AgentRole,
) -> Result<bool> {
    let mut any_change = false;
    let mut before = gated_files_hash(ctx)?;

    for round in 1..=MAX_REMEDIATION_ROUNDS {
        let label = format!("{gate}-r{round}");
        if let Err(err) = ctx.invoke_default(role, &label, state.iteration, &[]) {
            warn!(%gate, %err, "quality gate invocation failed, continuing");
        }
        let after = gated_files_hash(ctx)?;
        if after == before {
            debug!(%gate, round, "gate inputs stable, passing");
            return Ok(any_change);
        }
        any_change = true;
        before = after;
    }

    warn!(%gate, rounds = MAX_REMEDIATION_ROUNDS, "remediation cap reached, passing anyway");
    Ok(any_change)
}

/// Hash of the files a quality gate is allowed to edit: the plan and the
/// value checklist. Missing files hash as empty.
fn gated_files_hash(ctx: &AgentCtx<'_>) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in [
        &ctx.sprint.paths.plan_path,
        &ctx.sprint.paths.value_checklist_path,
    ] {
        hash_file(&mut hasher, path)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_file(hasher: &mut Sha256, path: &Path) -> Result<()> {
    if path.is_file() {
        let bytes = fs::read(path)?;
        hasher.update(&bytes);
    }
    hasher.update([0u8]);
    Ok(())
}
