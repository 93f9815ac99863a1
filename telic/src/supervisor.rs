//! Service readiness supervisor.
//!
//! Verifies every declared service is reachable; converts non-running
//! services into tasks (`IMPL-*` greenfield, `SVC-*` startup fix) and
//! re-evaluates on later passes. After the attempt cap the gate passes
//! unconditionally — dependent tests will fail predictably and the test
//! phase owns that evidence.

use anyhow::Result;
use tracing::{info, warn};

use crate::agents::AgentCtx;
use crate::core::blockers::{Blocker, BlockerKind};
use crate::core::gates::Gate;
use crate::core::plan::{Task, TaskId, TaskKind};
use crate::core::types::{AgentRole, ResultToken};
use crate::io::services::{ProbeResult, ServiceProbe, probe_all};
use crate::io::state::LoopState;

/// What one supervision pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisionOutcome {
    pub gate_passed: bool,
    /// Ids of tasks appended to the plan this pass.
    pub tasks_added: Vec<String>,
}

/// One pass over the declared services.
pub fn run_supervision(
    ctx: &AgentCtx<'_>,
    state: &mut LoopState,
    probe: &dyn ServiceProbe,
) -> Result<SupervisionOutcome> {
    let mut outcome = SupervisionOutcome::default();
    if ctx.config.services.is_empty() {
        state.mark_passed(Gate::ServicesReady);
        outcome.gate_passed = true;
        return Ok(outcome);
    }

    state.service_attempts += 1;
    let attempt = state.service_attempts;
    let results = probe_all(probe, &ctx.config.services, ctx.config.timeouts.service())?;

    let down: Vec<_> = results
        .into_iter()
        .filter_map(|(service, result)| match result {
            ProbeResult::Running => None,
            ProbeResult::NotRunning { reason } => Some((service, reason)),
        })
        .collect();

    if down.is_empty() {
        info!(attempt, "all services running");
        state.mark_passed(Gate::ServicesReady);
        outcome.gate_passed = true;
        return Ok(outcome);
    }

    if attempt > ctx.config.limits.max_service_attempts {
        warn!(
            attempt,
            down = down.len(),
            "service attempts exhausted, proceeding with services as they are"
        );
        state.mark_passed(Gate::ServicesReady);
        outcome.gate_passed = true;
        return Ok(outcome);
    }

    let mut plan = if ctx.sprint.plan_exists() {
        ctx.sprint.read_plan()?
    } else {
        Default::default()
    };
    let mut blockers = ctx.sprint.read_blockers()?;
    let mut blockers_changed = false;

    for (service, reason) in down {
        let code_exists = service
            .code_dir
            .as_ref()
            .is_some_and(|dir| ctx.sprint.paths.root.join(dir).is_dir());

        if !code_exists {
            // Greenfield: the service has no code yet; readiness cannot be
            // diagnosed into existence.
            let id = TaskId::derived(TaskKind::Greenfield, &service.name);
            if plan.find(&id).is_none() {
                info!(service = %service.name, "no code found, creating implementation task");
                plan.append_task(Task::pending(
                    id.clone(),
                    format!("Implement the {} service ({reason})", service.name),
                ));
                outcome.tasks_added.push(id.to_string());
            }
            continue;
        }

        // Brownfield: code exists but the service is down. Let the
        // diagnosis agent try an in-process fix first.
        let label = format!("diagnose-{}", service.name);
        let log_file = ctx
            .sprint
            .paths
            .telic_dir
            .join(format!("{}.diagnose.log", service.name));
        let invocation = ctx.invoke_default(
            AgentRole::ServiceDiagnose,
            &label,
            state.iteration,
            &[
                ("SERVICE_NAME", service.name.clone()),
                ("PORT", service.port.to_string()),
                ("LOG_FILE", log_file.display().to_string()),
            ],
        );

        match invocation {
            Ok(inv) if inv.token == ResultToken::Pass => {
                info!(service = %service.name, "diagnosis reports service fixed");
            }
            Ok(inv) if inv.token == ResultToken::BlockedExternal => {
                // Missing secret or similar: an external blocker, not a task.
                blockers.upsert(Blocker::open(
                    format!("SVC-{}", service.name),
                    BlockerKind::Credential,
                    format!("{} cannot start: {reason}", service.name),
                ));
                blockers_changed = true;
            }
            Ok(_) | Err(_) => {
                let id = TaskId::derived(TaskKind::Service, &service.name);
                if plan.find(&id).is_none() {
                    plan.append_task(Task::pending(
                        id.clone(),
                        format!("Repair startup of the {} service ({reason})", service.name),
                    ));
                    outcome.tasks_added.push(id.to_string());
                }
            }
        }
    }

    if !outcome.tasks_added.is_empty() {
        ctx.sprint.write_plan(&plan)?;
    }
    if blockers_changed {
        ctx.sprint.write_blockers(&blockers)?;
    }
    Ok(outcome)
}
