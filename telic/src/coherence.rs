//! Coherence evaluator driver.
//!
//! Quick mode is deterministic and free: file-level checks over the first
//! two dimensions. Full mode asks the coherence sub-agent for all seven.
//! Findings influence the *next* decision (critical invalidates planning
//! gates); they never block the task in flight.

use anyhow::Result;
use tracing::{info, warn};

use crate::agents::AgentCtx;
use crate::core::coherence::{
    CoherenceReport, Dimension, Finding, Mode, Severity, parse_findings,
};
use crate::core::plan::TaskKind;
use crate::core::types::AgentRole;
use crate::io::state::LoopState;

/// Deterministic quick pass: structural integrity (the orchestrated files
/// parse and carry work) and interaction coherence (remediation tasks point
/// at tests that exist).
pub fn quick_check(ctx: &AgentCtx<'_>) -> Result<CoherenceReport> {
    let mut findings = Vec::new();

    if ctx.sprint.plan_exists() {
        let plan = ctx.sprint.read_plan()?;
        if plan.tasks().count() == 0 {
            findings.push(Finding {
                dimension: Dimension::StructuralIntegrity,
                severity: Severity::Warning,
                message: "implementation plan parses to zero tasks".to_string(),
            });
        }

        if ctx.sprint.test_plan_exists() {
            let test_plan = ctx.sprint.read_test_plan()?;
            let known: Vec<String> = test_plan
                .tests()
                .into_iter()
                .map(|t| t.id.to_string())
                .collect();
            for task in plan.tasks() {
                if matches!(task.id.kind, TaskKind::Fix | TaskKind::Regression) {
                    let suffix = task
                        .id
                        .as_str()
                        .split_once('-')
                        .map(|(_, rest)| rest)
                        .unwrap_or_default();
                    if !known.iter().any(|id| id == suffix) {
                        findings.push(Finding {
                            dimension: Dimension::InteractionCoherence,
                            severity: Severity::Warning,
                            message: format!(
                                "{} references unknown test '{suffix}'",
                                task.id
                            ),
                        });
                    }
                }
            }
        }
    } else {
        findings.push(Finding {
            dimension: Dimension::StructuralIntegrity,
            severity: Severity::Info,
            message: "no implementation plan yet".to_string(),
        });
    }

    Ok(CoherenceReport {
        mode: Mode::Quick,
        findings,
    })
}

/// LLM-backed full pass across all seven dimensions.
pub fn full_check(ctx: &AgentCtx<'_>, state: &LoopState) -> Result<CoherenceReport> {
    let findings = match ctx.invoke_default(
        AgentRole::CoherenceFull,
        "coherence-full",
        state.iteration,
        &[],
    ) {
        Ok(invocation) => parse_findings(&invocation.stdout),
        Err(err) => {
            warn!(%err, "full coherence invocation failed");
            Vec::new()
        }
    };
    Ok(CoherenceReport {
        mode: Mode::Full,
        findings,
    })
}

/// Fold a report into the loop: critical findings invalidate planning
/// gates; warnings are logged for later consideration.
pub fn apply_report(report: &CoherenceReport, state: &mut LoopState) {
    for finding in &report.findings {
        match finding.severity {
            Severity::Critical => {
                warn!(dimension = %finding.dimension, message = %finding.message, "critical coherence finding");
            }
            Severity::Warning => {
                info!(dimension = %finding.dimension, message = %finding.message, "coherence warning");
            }
            Severity::Info => {}
        }
    }
    if report.has_critical() {
        state.invalidate_all_planning();
    }
}
