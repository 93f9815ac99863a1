//! Epic manager: multi-epic classification, decomposition, the epic store,
//! and between-epic checkpoints.
//!
//! The store (`.telic/epics.json`) is validated against an embedded JSON
//! Schema on every load, then against semantic invariants. An empty or
//! absent store means a single-run vision.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use crate::agents::AgentCtx;
use crate::core::epic::{
    CheckpointDecision, DetailLevel, Epic, EpicList, EpicState, VisionSignals,
};
use crate::core::types::AgentRole;
use crate::io::checkpoint::CheckpointPrompter;
use crate::io::state::LoopState;

const EPIC_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/epic_list/v1.schema.json"
));

/// Load and validate the epic store. Absent file → empty list.
pub fn load_epics(path: &Path) -> Result<EpicList> {
    if !path.exists() {
        return Ok(EpicList::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let instance: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_schema(&instance)?;
    let list: EpicList = serde_json::from_str(&contents)
        .with_context(|| format!("parse {} as epic list", path.display()))?;
    let errors = list.validate();
    if !errors.is_empty() {
        bail!("epic invariants violated:\n- {}", errors.join("\n- "));
    }
    Ok(list)
}

pub fn write_epics(path: &Path, list: &EpicList) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(list).context("serialize epic list")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(EPIC_SCHEMA).context("parse embedded epic schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile epic schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("epic schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

static INTEGRATION_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(stripe|oauth|webhook|third[- ]party|integration|payment|s3|twilio|sendgrid)\b")
        .unwrap()
});

static DOMAIN_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(frontend|backend|mobile|cli|data pipeline|machine learning|ml model|desktop)\b")
        .unwrap()
});

/// Extract classification signals from the vision text and the current
/// plan size. Deterministic by construction: the same inputs always yield
/// the same signals.
pub fn extract_signals(vision: &str, plan_task_count: usize) -> VisionSignals {
    let deliverables = vision
        .lines()
        .filter(|line| line.starts_with("## "))
        .count();
    let integrations: std::collections::BTreeSet<String> = INTEGRATION_HINT
        .find_iter(vision)
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect();
    let domains: std::collections::BTreeSet<String> = DOMAIN_HINT
        .find_iter(vision)
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect();
    // Dependency depth is approximated by nested list indentation.
    let dependency_depth = vision
        .lines()
        .filter(|l| l.trim_start().starts_with('-'))
        .map(|l| (l.len() - l.trim_start().len()) / 2 + 1)
        .max()
        .unwrap_or(0);

    VisionSignals {
        independent_deliverables: u32::try_from(deliverables).unwrap_or(u32::MAX),
        estimated_tasks: u32::try_from(plan_task_count).unwrap_or(u32::MAX),
        dependency_depth: u32::try_from(dependency_depth).unwrap_or(u32::MAX),
        technology_domains: u32::try_from(domains.len()).unwrap_or(u32::MAX),
        external_integrations: u32::try_from(integrations.len()).unwrap_or(u32::MAX),
    }
}

/// Classify the vision and, for multi-epic visions without a store yet,
/// decompose via the sub-agent. Returns the (possibly empty) epic list.
pub fn classify_and_decompose(ctx: &AgentCtx<'_>, state: &LoopState) -> Result<EpicList> {
    let epics_path = &ctx.sprint.paths.epics_path;
    let existing = load_epics(epics_path)?;
    if !existing.epics.is_empty() {
        return Ok(existing);
    }

    let vision = fs::read_to_string(&ctx.sprint.paths.vision_path)
        .with_context(|| format!("read {}", ctx.sprint.paths.vision_path.display()))?;
    let plan_tasks = if ctx.sprint.plan_exists() {
        ctx.sprint.read_plan()?.tasks().count()
    } else {
        0
    };
    let signals = extract_signals(&vision, plan_tasks);
    if !signals.is_multi_epic() {
        info!("vision classified single-run, skipping decomposition");
        return Ok(EpicList::default());
    }

    info!(?signals, "vision classified multi-epic, decomposing");
    if let Err(err) =
        ctx.invoke_default(AgentRole::EpicDecompose, "epic-decompose", state.iteration, &[])
    {
        warn!(%err, "epic decomposition invocation failed");
    }
    match load_epics(epics_path) {
        Ok(list) if !list.epics.is_empty() => Ok(list),
        Ok(_) => {
            warn!("decomposition produced no epics, running single-run");
            Ok(EpicList::default())
        }
        Err(err) => {
            warn!(%err, "decomposition output invalid, running single-run");
            Ok(EpicList::default())
        }
    }
}

/// Activate the next runnable epic: mark it active and refine its plan
/// from sketch to full just-in-time.
pub fn activate_epic(
    ctx: &AgentCtx<'_>,
    state: &LoopState,
    list: &mut EpicList,
    id: &str,
    notes: Option<&str>,
) -> Result<()> {
    if list.find(id).is_some_and(|e| e.detail == DetailLevel::Sketch) {
        let invocation = ctx.invoke_default(
            AgentRole::EpicRefine,
            &format!("refine-{id}"),
            state.iteration,
            &[
                ("EPIC_ID", id.to_string()),
                ("NOTES", notes.unwrap_or_default().to_string()),
            ],
        );
        if let Err(err) = invocation {
            warn!(epic = %id, %err, "epic refinement failed, proceeding on the sketch");
        }
        list.refine(id);
    }
    list.set_state(id, EpicState::Active);
    write_epics(&ctx.sprint.paths.epics_path, list)?;
    Ok(())
}

/// Curated checkpoint summary: delivered / vision mapping / next preview.
pub fn checkpoint_summary(completed: &Epic, next: Option<&Epic>) -> String {
    let mut buf = String::new();
    buf.push_str(&format!("Epic '{}' complete.\n\nDelivered:\n", completed.id));
    for criterion in &completed.completion_criteria {
        buf.push_str(&format!("- {criterion}\n"));
    }
    buf.push_str(&format!("\nVision mapping:\n{}\n", completed.value_statement));
    match next {
        Some(next) => {
            buf.push_str(&format!(
                "\nNext epic: '{}' — {}\n",
                next.id, next.value_statement
            ));
        }
        None => buf.push_str("\nNo further epics.\n"),
    }
    buf
}

/// Run the between-epic checkpoint. The completed epic transitions
/// awaiting-checkpoint → complete unless the human stops the run.
pub fn run_checkpoint(
    ctx: &AgentCtx<'_>,
    prompter: &dyn CheckpointPrompter,
    list: &mut EpicList,
    completed_id: &str,
) -> Result<CheckpointDecision> {
    list.set_state(completed_id, EpicState::AwaitingCheckpoint);
    let completed = list
        .find(completed_id)
        .cloned()
        .with_context(|| format!("unknown epic '{completed_id}'"))?;
    let next = list
        .epics
        .iter()
        .find(|e| e.state == EpicState::Pending)
        .cloned();

    let summary = checkpoint_summary(&completed, next.as_ref());
    let decision = prompter.ask(&summary, ctx.config.timeouts.epic_feedback())?;

    match &decision {
        CheckpointDecision::Stop => {
            info!(epic = %completed_id, "checkpoint: stop requested");
        }
        CheckpointDecision::Proceed | CheckpointDecision::Adjust(_) => {
            list.set_state(completed_id, EpicState::Complete);
        }
    }
    write_epics(&ctx.sprint.paths.epics_path, list)?;
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::LoopConfig;
    use crate::io::prompt::PromptStore;
    use crate::io::sprint::Sprint;
    use crate::test_support::{ScriptedInvoker, ScriptedPrompter};

    fn epic(id: &str, position: u32, state: EpicState) -> Epic {
        Epic {
            id: id.to_string(),
            position,
            value_statement: format!("{id} delivers value"),
            completion_criteria: vec![format!("{id} demo works")],
            depends_on: Vec::new(),
            detail: DetailLevel::Sketch,
            state,
        }
    }

    fn setup(temp: &tempfile::TempDir) -> (Sprint, LoopConfig, PromptStore) {
        let sprint = Sprint::open(temp.path()).expect("open");
        sprint.ensure_scaffolding().expect("scaffold");
        (sprint, LoopConfig::default(), PromptStore::new(temp.path().join("prompts")))
    }

    #[test]
    fn store_round_trips_and_validates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("epics.json");
        let list = EpicList {
            epics: vec![
                epic("e1", 1, EpicState::Complete),
                epic("e2", 2, EpicState::Pending),
            ],
        };
        write_epics(&path, &list).expect("write");
        let loaded = load_epics(&path).expect("load");
        assert_eq!(loaded, list);
    }

    #[test]
    fn schema_rejects_malformed_stores() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("epics.json");
        fs::write(&path, r#"{"epics": [{"id": "e1"}]}"#).expect("write");
        let err = load_epics(&path).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn invariant_violations_are_rejected_after_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("epics.json");
        let list = EpicList {
            epics: vec![epic("e1", 2, EpicState::Pending)],
        };
        // Bypass write-side validation by writing raw JSON.
        fs::write(&path, serde_json::to_string(&list).unwrap()).expect("write");
        let err = load_epics(&path).unwrap_err();
        assert!(format!("{err:#}").contains("epic invariants"));
    }

    #[test]
    fn simple_visions_skip_decomposition() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp);
        fs::write(&sprint.paths.vision_path, "# Vision\n\nA small static site.\n")
            .expect("write");
        let invoker = ScriptedInvoker::passing();
        let ctx = AgentCtx {
            sprint: &sprint,
            config: &config,
            invoker: &invoker,
            prompts: &prompts,
        };

        let list = classify_and_decompose(&ctx, &LoopState::default()).expect("classify");
        assert!(list.epics.is_empty());
        assert!(invoker.calls().is_empty());
    }

    #[test]
    fn multi_epic_vision_decomposes_through_the_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp);
        let vision = "\
# Vision

## Storefront
## Admin
## Analytics
## Billing

Stripe integration and a Twilio webhook.
";
        fs::write(&sprint.paths.vision_path, vision).expect("write");

        let epics_path = sprint.paths.epics_path.clone();
        let invoker = ScriptedInvoker::passing().on_role(AgentRole::EpicDecompose, move |_| {
            let list = EpicList {
                epics: vec![
                    Epic {
                        id: "storefront".to_string(),
                        position: 1,
                        value_statement: "customers can buy".to_string(),
                        completion_criteria: vec!["checkout works".to_string()],
                        depends_on: Vec::new(),
                        detail: DetailLevel::Full,
                        state: EpicState::Pending,
                    },
                    Epic {
                        id: "admin".to_string(),
                        position: 2,
                        value_statement: "operators can manage".to_string(),
                        completion_criteria: vec!["catalog editable".to_string()],
                        depends_on: vec!["storefront".to_string()],
                        detail: DetailLevel::Sketch,
                        state: EpicState::Pending,
                    },
                ],
            };
            write_epics(&epics_path, &list).expect("write epics");
        });
        let ctx = AgentCtx {
            sprint: &sprint,
            config: &config,
            invoker: &invoker,
            prompts: &prompts,
        };

        let list = classify_and_decompose(&ctx, &LoopState::default()).expect("classify");
        assert_eq!(list.epics.len(), 2);
        assert_eq!(list.next_runnable().expect("runnable").id, "storefront");
    }

    #[test]
    fn checkpoint_proceed_completes_the_epic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp);
        let invoker = ScriptedInvoker::passing();
        let ctx = AgentCtx {
            sprint: &sprint,
            config: &config,
            invoker: &invoker,
            prompts: &prompts,
        };

        let mut list = EpicList {
            epics: vec![
                epic("e1", 1, EpicState::Active),
                epic("e2", 2, EpicState::Pending),
            ],
        };
        let prompter = ScriptedPrompter::replying(None);
        let decision = run_checkpoint(&ctx, &prompter, &mut list, "e1").expect("checkpoint");

        assert_eq!(decision, CheckpointDecision::Proceed);
        assert_eq!(list.find("e1").unwrap().state, EpicState::Complete);
        // Summary carried all three sections.
        let summary = prompter.last_summary().expect("summary");
        assert!(summary.contains("Delivered:"));
        assert!(summary.contains("Vision mapping:"));
        assert!(summary.contains("Next epic: 'e2'"));
    }

    #[test]
    fn checkpoint_stop_leaves_epic_awaiting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp);
        let invoker = ScriptedInvoker::passing();
        let ctx = AgentCtx {
            sprint: &sprint,
            config: &config,
            invoker: &invoker,
            prompts: &prompts,
        };

        let mut list = EpicList {
            epics: vec![epic("e1", 1, EpicState::Active)],
        };
        let prompter = ScriptedPrompter::replying(Some("s"));
        let decision = run_checkpoint(&ctx, &prompter, &mut list, "e1").expect("checkpoint");
        assert_eq!(decision, CheckpointDecision::Stop);
        assert_eq!(list.find("e1").unwrap().state, EpicState::AwaitingCheckpoint);
    }

    #[test]
    fn activation_refines_sketches_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp);
        let invoker = ScriptedInvoker::passing();
        let ctx = AgentCtx {
            sprint: &sprint,
            config: &config,
            invoker: &invoker,
            prompts: &prompts,
        };

        let mut list = EpicList {
            epics: vec![epic("e1", 1, EpicState::Pending)],
        };
        activate_epic(&ctx, &LoopState::default(), &mut list, "e1", Some("notes"))
            .expect("activate");

        assert_eq!(list.find("e1").unwrap().state, EpicState::Active);
        assert_eq!(list.find("e1").unwrap().detail, DetailLevel::Full);
        let refines = invoker
            .calls()
            .iter()
            .filter(|c| c.role == AgentRole::EpicRefine)
            .count();
        assert_eq!(refines, 1);

        // Re-activating a full epic does not refine again.
        activate_epic(&ctx, &LoopState::default(), &mut list, "e1", None).expect("activate");
        let refines = invoker
            .calls()
            .iter()
            .filter(|c| c.role == AgentRole::EpicRefine)
            .count();
        assert_eq!(refines, 1);
    }

    #[test]
    fn signal_extraction_counts_sections_domains_and_integrations() {
        let vision = "\
# Vision

## One
## Two

- frontend work
  - backend work

Uses Stripe and a webhook to SendGrid.
";
        let signals = extract_signals(vision, 4);
        assert_eq!(signals.independent_deliverables, 2);
        assert_eq!(signals.estimated_tasks, 4);
        assert_eq!(signals.technology_domains, 2);
        assert_eq!(signals.external_integrations, 3);
        assert!(signals.dependency_depth >= 2);
    }
}
