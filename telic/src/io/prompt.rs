//! Prompt templates: directory-loaded with embedded fallbacks, rendered by
//! literal `{PLACEHOLDER}` substitution.
//!
//! Rendering is pure string substitution. The core reserves the names
//! `SPRINT`, `SPRINT_DIR`, `SERVICE_NAME`, `LOG_FILE`, and `PORT`: a
//! reserved placeholder with no binding renders as the empty string. Every
//! other unbound placeholder passes through untouched — it belongs to the
//! template author, not the core.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use tracing::debug;

use crate::core::types::AgentRole;

/// Placeholder names owned by the core.
const RESERVED: [&str; 5] = ["SPRINT", "SPRINT_DIR", "SERVICE_NAME", "LOG_FILE", "PORT"];

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Z][A-Z0-9_]*)\}").unwrap());

/// Substitute `{NAME}` placeholders from `vars`.
pub fn render(template: &str, vars: &BTreeMap<&str, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let name = &caps[1];
            match vars.get(name) {
                Some(value) => value.clone(),
                None if RESERVED.contains(&name) => String::new(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Role→template lookup: `<prompt_dir>/<role>.md` when present, otherwise
/// the embedded minimal template. The corpus of rich prompts is external;
/// the fallbacks only guarantee the output contract is always stated.
#[derive(Debug, Clone)]
pub struct PromptStore {
    dir: PathBuf,
}

impl PromptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn load(&self, role: AgentRole) -> Result<String> {
        let path = self.dir.join(format!("{}.md", role.template_name()));
        if path.is_file() {
            debug!(template = %path.display(), "loading prompt template");
            return fs::read_to_string(&path)
                .with_context(|| format!("read template {}", path.display()));
        }
        Ok(embedded(role).to_string())
    }
}

fn embedded(role: AgentRole) -> &'static str {
    // Minimal single-purpose fallbacks. Sprint-local templates are expected
    // to be far richer; these keep the loop operable without them.
    match role {
        AgentRole::VisionRealityCheck => {
            "Compare the current state of the deliverable in {SPRINT_DIR} against VISION.md and PRD.md. List gaps. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::PlanGeneration => {
            "Read VISION.md, PRD.md, and ARCHITECTURE.md (if present) in {SPRINT_DIR}. Write IMPLEMENTATION_PLAN.md as a checkbox task list (`- [ ] Task N.M: ...`) and VALUE_CHECKLIST.md. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::VerifyBlockers => {
            "Review BLOCKERS.md in {SPRINT_DIR}. For each blocker decide whether it is truly external (CREDENTIAL, AUTH, THIRD_PARTY, HARDWARE) or BUILDABLE inside the sprint; update the register. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::QualityCraap => {
            "Apply the CRAAP source-quality review to IMPLEMENTATION_PLAN.md and VALUE_CHECKLIST.md in {SPRINT_DIR}; edit the files to fix what you find. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::QualityClarity => {
            "Review IMPLEMENTATION_PLAN.md in {SPRINT_DIR} for ambiguous tasks; rewrite unclear ones in place. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::QualityValidate => {
            "Check every task in IMPLEMENTATION_PLAN.md in {SPRINT_DIR} against PRD.md acceptance criteria; fix mismatches in place. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::QualityConnect => {
            "Verify task ordering and dependencies in IMPLEMENTATION_PLAN.md in {SPRINT_DIR}; reorder or add wiring tasks in place. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::QualityTidy => {
            "Remove duplicates and dead tasks from IMPLEMENTATION_PLAN.md in {SPRINT_DIR}. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::Preflight => {
            "Confirm the sprint in {SPRINT_DIR} is ready for implementation: plan present, tooling available, no missing inputs. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::ImplementTask => {
            "Implement the following task from IMPLEMENTATION_PLAN.md in {SPRINT_DIR}, then mark it `[x]` in the plan:\n\n{TASK}\n\nEnd your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::ServiceDiagnose => {
            "The service {SERVICE_NAME} (port {PORT}) is not reachable in {SPRINT_DIR}. Diagnose why (port conflict, missing dependency, database or queue not running) and fix what you can; log findings to {LOG_FILE}. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::TestPlan => {
            "Write BETA_TEST_PLAN_v1.md in {SPRINT_DIR}: a checkbox list of typed tests (BT-*, INT-*, VAL-*, UX-*, EDGE-*) derived from VISION.md and PRD.md. Annotate browser-automatable tests with (E2E: \"<name>\"). End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::RunTest => {
            "{PREAMBLE}\n\nExecute this test against the deliverable in {SPRINT_DIR} and report honestly:\n\n{TEST_BLOCK}\n\nEnd your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::FixTest => {
            "Test {TEST_ID} failed in {SPRINT_DIR}. Evidence from the failing run:\n\n{EVIDENCE}\n\nFix the underlying problem. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::DiscoverValue => {
            "Progress has stalled in {SPRINT_DIR}. Re-read VISION.md and the current plan; find undelivered value and append concrete tasks to IMPLEMENTATION_PLAN.md. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::Strategy => {
            "The loop in {SPRINT_DIR} is unhealthy: {DIAGNOSIS}. Choose one adjustment and output it as `STRATEGY: <TOKEN>` with TOKEN one of CHANGE_TEST_APPROACH, CHANGE_FIX_APPROACH, CHANGE_EXECUTION_ORDER, REDUCE_SCOPE, CHANGE_RESEARCH_TIMING, LOWER_ESCALATION_THRESHOLD. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::CoherenceFull => {
            "Assess the deliverable in {SPRINT_DIR} across: structural_integrity, interaction_coherence, conceptual_integrity, behavioural_consistency, informational_flow_integrity, resilience, evolutionary_capacity. Output one line per finding: `COHERENCE: <INFO|WARNING|CRITICAL> <dimension> <message>`. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::EpicDecompose => {
            "Decompose the vision in {SPRINT_DIR} into at most 5 ordered epics, each an independently demonstrable horizontal slice. Write .telic/epics.json with id, position, value_statement, completion_criteria, depends_on, detail, state. End your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
        AgentRole::EpicRefine => {
            "Refine epic {EPIC_ID} in {SPRINT_DIR} from sketch to a full plan, folding in these notes if any:\n\n{NOTES}\n\nEnd your output with a line `RESULT: <TOKEN>` where TOKEN is one of PASS, FAIL, BLOCKED, BLOCKED_EXTERNAL, BLOCKED_FIXABLE."
        }
    }
}
