//! Decision engine: the outer control loop.
//!
//! Given the persisted state, each iteration picks exactly one action in a
//! deterministic priority order — services → planning → implementation →
//! test-plan generation → testing → final VRC → final regression — and
//! restarts. Saturation, stuckness, and regressions all route back through
//! this order; the loop never re-executes itself, so attempt counters
//! survive a regression cycle.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::agents::AgentCtx;
use crate::coherence::{apply_report, full_check, quick_check};
use crate::core::coherence::{Mode, next_mode};
use crate::core::epic::{CheckpointDecision, EpicState};
use crate::core::fingerprint::{Fingerprint, StuckVerdict};
use crate::core::gates::Gate;
use crate::core::metrics::IterationSample;
use crate::core::plan::{TaskKind, TaskStatus};
use crate::core::types::{AgentRole, Phase, ResultToken, Termination};
use crate::epics::{activate_epic, classify_and_decompose, run_checkpoint};
use crate::executor::{ExecOutcome, run_task_iteration};
use crate::io::checkpoint::CheckpointPrompter;
use crate::io::config::LoopConfig;
use crate::io::git::{Vcs, refuse_protected};
use crate::io::invoker::AgentInvoker;
use crate::io::prompt::PromptStore;
use crate::io::services::ServiceProbe;
use crate::io::sprint::Sprint;
use crate::io::state::{LoopState, delete_state, load_state, write_state};
use crate::meta::MetaReasoner;
use crate::planner::run_planning;
use crate::scheduler::{
    E2eRunner, TestIteration, final_regression, generate_test_plan, run_test_iteration,
};
use crate::supervisor::run_supervision;

/// External collaborators the engine drives; scripted in tests.
pub struct EngineDeps<'a> {
    pub invoker: &'a dyn AgentInvoker,
    pub probe: &'a dyn ServiceProbe,
    pub prompter: &'a dyn CheckpointPrompter,
    pub e2e: &'a dyn E2eRunner,
    pub vcs: &'a dyn Vcs,
}

/// Why the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Verified value: every test passed.
    VerifiedValue,
    /// Everything runnable passed; blocked tests remain.
    Blocked,
    /// The iteration cap was reached; state is preserved for resume.
    Saturated,
    /// The human stopped the run at an epic checkpoint.
    StopRequested,
    /// Final VRC found undelivered vision and discovery produced no work.
    VisionNotDelivered,
}

/// Final report, mapped to the process exit code by the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub termination: Termination,
    pub stop: StopReason,
    pub iterations: u32,
    pub passed_tests: usize,
    pub blocked_tests: usize,
    pub pending_tests: usize,
}

enum Signal {
    Continue,
    Done(Termination, StopReason),
}

enum InnerStop {
    Done(Termination, StopReason),
    Saturated,
}

/// Sha256 of a file's contents, `None` when the file is absent.
fn content_hash(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)
        .with_context(|| format!("read {} for workspace snapshot", path.display()))?;
    Ok(Some(hex::encode(Sha256::digest(&bytes))))
}

/// Point-in-time view of the orchestrated workspace, diffed across one
/// iteration to feed the meta-reasoner real churn numbers.
#[derive(Debug, Default)]
struct WorkspaceView {
    /// Task and test statuses, keyed `task:<id>` / `test:<id>`.
    statuses: BTreeMap<String, String>,
    /// Content hash per orchestrated file; `None` when absent.
    file_hashes: BTreeMap<&'static str, Option<String>>,
}

impl WorkspaceView {
    /// Statuses that flipped, appeared, or disappeared since `self`.
    fn status_transitions(&self, after: &WorkspaceView) -> u32 {
        let mut count = 0u32;
        for (key, status) in &after.statuses {
            if self.statuses.get(key) != Some(status) {
                count += 1;
            }
        }
        for key in self.statuses.keys() {
            if !after.statuses.contains_key(key) {
                count += 1;
            }
        }
        count
    }

    /// Distinct orchestrated files whose content changed since `self`.
    fn files_changed(&self, after: &WorkspaceView) -> u32 {
        after
            .file_hashes
            .iter()
            .filter(|(name, hash)| self.file_hashes.get(*name) != Some(hash))
            .count()
            .try_into()
            .unwrap_or(u32::MAX)
    }
}

/// The orchestrator. Single-threaded and cooperative: one activity at a
/// time, children are the only parallelism.
pub struct Engine<'a> {
    sprint: Sprint,
    config: LoopConfig,
    prompts: PromptStore,
    deps: EngineDeps<'a>,
    max_iterations: u32,
    rng: StdRng,
    reasoner: MetaReasoner,
    /// Completed tasks since the last quick coherence pass.
    tasks_since_quick: u32,
    /// Set when the test phase saturated; testing is skipped afterwards.
    testing_saturated: bool,
    /// One final value-discovery attempt after a failing final VRC.
    final_discovery_spent: bool,
    /// Progress flags observed during the current iteration.
    iteration_progressed: bool,
    last_evidence_hash: Option<u64>,
}

impl<'a> Engine<'a> {
    pub fn new(
        sprint: Sprint,
        config: LoopConfig,
        deps: EngineDeps<'a>,
        max_iterations_override: Option<u32>,
    ) -> Self {
        let max_iterations = max_iterations_override.unwrap_or(config.limits.max_iterations);
        let prompt_dir = sprint.paths.root.join(&config.agent.prompt_dir);
        Self {
            sprint,
            prompts: PromptStore::new(prompt_dir),
            config,
            deps,
            max_iterations,
            rng: StdRng::from_os_rng(),
            reasoner: MetaReasoner::new(),
            tasks_since_quick: 0,
            testing_saturated: false,
            final_discovery_spent: false,
            iteration_progressed: false,
            last_evidence_hash: None,
        }
    }

    fn ctx(&self) -> AgentCtx<'_> {
        AgentCtx {
            sprint: &self.sprint,
            config: &self.config,
            invoker: self.deps.invoker,
            prompts: &self.prompts,
        }
    }

    /// Run to termination: docs check, branch setup, epic orchestration,
    /// and the inner loop(s).
    pub fn run(&mut self) -> Result<RunReport> {
        self.sprint.check_docs()?;
        self.sprint.ensure_scaffolding()?;

        let branch = self.deps.vcs.current_branch()?;
        refuse_protected(&branch)?;
        self.deps
            .vcs
            .ensure_branch(&format!("sprint/{}", self.sprint.name))
            .context("sprint branch setup")?;

        let mut state = load_state(&self.sprint.paths.loop_state_path)?;
        if state.phase == Phase::Docs {
            state.phase = Phase::Planning;
        }

        let mut epics = classify_and_decompose(&self.ctx(), &state)?;
        if epics.epics.is_empty() {
            let stop = self.run_inner(&mut state)?;
            return self.finish(&mut state, stop);
        }

        // Two-tier run: the inner loop per epic, checkpoints between.
        let mut adjust_notes: Option<String> = None;
        loop {
            let Some(next) = epics.next_runnable().cloned() else {
                let stop = if epics.all_complete() {
                    InnerStop::Done(Termination::FullSuccess, StopReason::VerifiedValue)
                } else {
                    warn!("next epic is dependency-blocked, stopping");
                    InnerStop::Done(Termination::Incomplete, StopReason::VisionNotDelivered)
                };
                return self.finish(&mut state, stop);
            };
            let epic_gate = Gate::EpicComplete(next.id.clone());
            if state.is_passed(&epic_gate) {
                epics.set_state(&next.id, EpicState::Complete);
                continue;
            }

            activate_epic(
                &self.ctx(),
                &state,
                &mut epics,
                &next.id,
                adjust_notes.take().as_deref(),
            )?;
            let stop = self.run_inner(&mut state)?;
            match stop {
                InnerStop::Done(Termination::FullSuccess, _) => {}
                other => return self.finish(&mut state, other),
            }

            // Epic boundary: full coherence pass, then the checkpoint.
            let report = full_check(&self.ctx(), &state)?;
            apply_report(&report, &mut state);

            let decision = run_checkpoint(&self.ctx(), self.deps.prompter, &mut epics, &next.id)?;
            match decision {
                CheckpointDecision::Stop => {
                    return self.finish(
                        &mut state,
                        InnerStop::Done(Termination::PartialSuccess, StopReason::StopRequested),
                    );
                }
                CheckpointDecision::Adjust(notes) => adjust_notes = Some(notes),
                CheckpointDecision::Proceed => {}
            }

            state.mark_passed(epic_gate);
            self.prepare_next_epic(&mut state)?;
        }
    }

    /// Archive the finished epic's plans and clear the gates the next epic
    /// must re-earn.
    fn prepare_next_epic(&mut self, state: &mut LoopState) -> Result<()> {
        let archive = self.sprint.paths.telic_dir.join("archive");
        std::fs::create_dir_all(&archive)?;
        for (path, name) in [
            (&self.sprint.paths.plan_path, "IMPLEMENTATION_PLAN.md"),
            (&self.sprint.paths.test_plan_path, "BETA_TEST_PLAN_v1.md"),
        ] {
            if path.is_file() {
                let target = archive.join(format!("{}-{name}", state.iteration));
                std::fs::rename(path, target)?;
            }
        }
        state.invalidate_all_planning();
        state.invalidate(&Gate::TestplanGenerated);
        state.test_attempts.clear();
        state.task_attempts.clear();
        state.consecutive_blocked = 0;
        self.testing_saturated = false;
        self.final_discovery_spent = false;
        write_state(&self.sprint.paths.loop_state_path, state)?;
        Ok(())
    }

    fn run_inner(&mut self, state: &mut LoopState) -> Result<InnerStop> {
        loop {
            if state.iteration >= self.max_iterations {
                warn!(iterations = state.iteration, "iteration cap reached, aborting");
                write_state(&self.sprint.paths.loop_state_path, state)?;
                return Ok(InnerStop::Saturated);
            }
            state.iteration += 1;
            self.iteration_progressed = false;
            debug!(iteration = state.iteration, phase = %state.phase, "loop iteration");

            let baseline = self.observe_workspace()?;
            let signal = self.step(state)?;
            if let Signal::Done(termination, stop) = signal {
                write_state(&self.sprint.paths.loop_state_path, state)?;
                return Ok(InnerStop::Done(termination, stop));
            }
            self.after_step(state, &baseline)?;
            write_state(&self.sprint.paths.loop_state_path, state)?;
        }
    }

    /// Snapshot the orchestrated files and every task/test status.
    fn observe_workspace(&self) -> Result<WorkspaceView> {
        let mut view = WorkspaceView::default();

        if self.sprint.plan_exists() {
            for task in self.sprint.read_plan()?.tasks() {
                view.statuses
                    .insert(format!("task:{}", task.id), format!("{:?}", task.status));
            }
        }
        if self.sprint.test_plan_exists() {
            for test in self.sprint.read_test_plan()?.tests() {
                view.statuses
                    .insert(format!("test:{}", test.id), format!("{:?}", test.status));
            }
        }

        for (name, path) in [
            ("plan", &self.sprint.paths.plan_path),
            ("test_plan", &self.sprint.paths.test_plan_path),
            ("value_checklist", &self.sprint.paths.value_checklist_path),
            ("blockers", &self.sprint.paths.blockers_path),
            ("epics", &self.sprint.paths.epics_path),
        ] {
            view.file_hashes.insert(name, content_hash(path)?);
        }
        Ok(view)
    }

    /// One decision: run the highest-priority activity whose gate demands
    /// it.
    fn step(&mut self, state: &mut LoopState) -> Result<Signal> {
        // Planning pipeline.
        if !state.is_passed(&Gate::Planning) {
            state.phase = Phase::Planning;
            let outcome = run_planning(&self.ctx(), state)?;
            self.iteration_progressed |= outcome.files_changed;
            return Ok(Signal::Continue);
        }

        // Service readiness.
        if !state.is_passed(&Gate::ServicesReady) {
            state.phase = Phase::Services;
            let outcome = run_supervision(&self.ctx(), state, self.deps.probe)?;
            if !outcome.tasks_added.is_empty() {
                info!(
                    tasks = outcome.tasks_added.len(),
                    "service tasks created, re-planning"
                );
                state.invalidate_all_planning();
                self.iteration_progressed = true;
            }
            return Ok(Signal::Continue);
        }

        // Implementation.
        if self.sprint.plan_exists() {
            let has_pending = self.sprint.read_plan()?.next_task().is_some();
            if has_pending {
                state.phase = Phase::Implement;
                let outcome = run_task_iteration(&self.ctx(), state)?;
                match &outcome {
                    ExecOutcome::Progress { task_id } => {
                        self.iteration_progressed = true;
                        self.tasks_since_quick += 1;
                        self.commit(state, &format!("task {task_id}"));
                    }
                    ExecOutcome::TaskBlocked { task_id } => {
                        warn!(task = %task_id, "task blocked, falling through to testing");
                    }
                    ExecOutcome::NoChange { .. } | ExecOutcome::NoPendingTask => {}
                }
                self.maybe_quick_coherence(state)?;
                return Ok(Signal::Continue);
            }
        }

        // Test-plan generation.
        if !state.is_passed(&Gate::TestplanGenerated) {
            state.phase = Phase::Testgen;
            generate_test_plan(&self.ctx(), state)?;
            return Ok(Signal::Continue);
        }

        // Testing.
        if !self.testing_saturated && self.sprint.read_test_plan()?.pending_count() > 0 {
            state.phase = Phase::Testing;
            // Built field-by-field so the rng can be borrowed alongside.
            let ctx = AgentCtx {
                sprint: &self.sprint,
                config: &self.config,
                invoker: self.deps.invoker,
                prompts: &self.prompts,
            };
            let outcome = run_test_iteration(&ctx, state, self.deps.e2e, &mut self.rng)?;
            match outcome {
                TestIteration::Ran {
                    ref test_id,
                    passed,
                    evidence_hash,
                    ..
                } => {
                    if passed {
                        self.iteration_progressed = true;
                        self.commit(state, &format!("test {test_id} passed"));
                    }
                    self.last_evidence_hash = evidence_hash;
                }
                TestIteration::PhaseSaturated => {
                    warn!("test phase saturated on consecutive blocked tests");
                    self.testing_saturated = true;
                }
                TestIteration::AllCapped { .. } | TestIteration::NonePending => {}
            }

            self.check_structural_threshold(state)?;
            if state.iteration % 10 == 0 {
                if let Err(err) = self.ctx().invoke_default(
                    AgentRole::VisionRealityCheck,
                    "vrc-interval",
                    state.iteration,
                    &[],
                ) {
                    warn!(%err, "interval VRC failed");
                }
            }
            return Ok(Signal::Continue);
        }

        // More blocked than passed: the vision is slipping away; rediscover
        // value before declaring anything.
        let test_plan = if self.sprint.test_plan_exists() {
            Some(self.sprint.read_test_plan()?)
        } else {
            None
        };
        let (passed, blocked) = test_plan
            .as_ref()
            .map(|p| (p.passed_count(), p.blocked_count()))
            .unwrap_or((0, 0));
        if blocked > passed && !self.final_discovery_spent {
            self.final_discovery_spent = true;
            self.value_discovery(state, "blocked-majority")?;
            return Ok(Signal::Continue);
        }

        // Final VRC, preceded by a full coherence pass.
        state.phase = Phase::FinalVrc;
        let report = full_check(&self.ctx(), state)?;
        apply_report(&report, state);
        if !state.is_passed(&Gate::Planning) {
            // Critical coherence findings re-opened planning.
            return Ok(Signal::Continue);
        }

        let vrc = self
            .ctx()
            .invoke_default(AgentRole::VisionRealityCheck, "vrc-final", state.iteration, &[]);
        let delivered = matches!(&vrc, Ok(inv) if inv.token == ResultToken::Pass);
        if !delivered {
            let plan = self.sprint.read_plan();
            let has_build = plan
                .map(|p| {
                    p.tasks()
                        .any(|t| t.id.kind == TaskKind::Build && t.status == TaskStatus::Pending)
                })
                .unwrap_or(false);
            if has_build {
                info!("final VRC found gaps, BUILD tasks pending");
                return Ok(Signal::Continue);
            }
            if !self.final_discovery_spent {
                self.final_discovery_spent = true;
                self.value_discovery(state, "vrc-final")?;
                return Ok(Signal::Continue);
            }
            warn!("vision not delivered and discovery exhausted");
            return Ok(Signal::Done(
                Termination::Incomplete,
                StopReason::VisionNotDelivered,
            ));
        }

        // Final regression sweep over every passing test.
        if let Some(plan) = &test_plan
            && plan.passed_count() > 0
        {
            let regressed = final_regression(&self.ctx(), state, self.deps.e2e)?;
            if !regressed.is_empty() {
                warn!(count = regressed.len(), "final regression reset tests, re-entering loop");
                self.testing_saturated = false;
                return Ok(Signal::Continue);
            }
        }

        // Terminate.
        state.phase = Phase::Complete;
        let (pending, blocked) = test_plan
            .as_ref()
            .map(|p| (p.pending_count(), p.blocked_count()))
            .unwrap_or((0, 0));
        let (termination, stop) = if pending == 0 && blocked == 0 {
            (Termination::FullSuccess, StopReason::VerifiedValue)
        } else if pending == 0 {
            (Termination::PartialSuccess, StopReason::Blocked)
        } else {
            (Termination::Incomplete, StopReason::VisionNotDelivered)
        };
        Ok(Signal::Done(termination, stop))
    }

    /// Per-iteration bookkeeping: fingerprint-layer stuck detection and the
    /// meta-reasoner sample diffed against the iteration's baseline.
    fn after_step(&mut self, state: &mut LoopState, baseline: &WorkspaceView) -> Result<()> {
        let (passed, blocked) = if self.sprint.test_plan_exists() {
            let plan = self.sprint.read_test_plan()?;
            (plan.passed_count(), plan.blocked_count())
        } else {
            (0, 0)
        };
        let done = if self.sprint.plan_exists() {
            self.sprint.read_plan()?.done_count()
        } else {
            0
        };

        let mut tracker = state.stuck_tracker();
        let verdict = tracker.record(
            Fingerprint::new(passed, blocked, done),
            self.iteration_progressed,
            self.config.limits.max_no_progress,
        );
        state.store_stuck_tracker(&tracker);

        if let StuckVerdict::Stuck { repeats } = verdict {
            warn!(repeats, "no progress anywhere, invoking value discovery");
            self.value_discovery(state, "stuck")?;
            let mut tracker = state.stuck_tracker();
            tracker.reset_repeats();
            state.store_stuck_tracker(&tracker);
        }

        let now = self.observe_workspace()?;
        let sample = IterationSample {
            settled_tests: u32::try_from(passed + blocked).unwrap_or(u32::MAX),
            error_surface: self.last_evidence_hash,
            files_touched: baseline.files_changed(&now),
            task_transitions: baseline.status_transitions(&now),
        };
        let ctx = AgentCtx {
            sprint: &self.sprint,
            config: &self.config,
            invoker: self.deps.invoker,
            prompts: &self.prompts,
        };
        self.reasoner.observe(&ctx, state, &sample)?;
        Ok(())
    }

    /// Verify blockers, rediscover value, and force a re-plan.
    fn value_discovery(&self, state: &mut LoopState, label: &str) -> Result<()> {
        state.phase = Phase::Planning;
        for (role, suffix) in [
            (AgentRole::VerifyBlockers, "verify"),
            (AgentRole::DiscoverValue, "discover"),
        ] {
            if let Err(err) = self.ctx().invoke_default(
                role,
                &format!("{label}-{suffix}"),
                state.iteration,
                &[],
            ) {
                warn!(%err, "value discovery invocation failed");
            }
        }
        state.invalidate_all_planning();
        Ok(())
    }

    /// Exactly when `significant_task_threshold` new structural tasks have
    /// accumulated, the quality gates are invalidated.
    fn check_structural_threshold(&mut self, state: &mut LoopState) -> Result<()> {
        if !self.sprint.plan_exists() {
            return Ok(());
        }
        let current = self.sprint.read_plan()?.structural_task_ids();
        let fresh: Vec<String> = current
            .difference(&state.structural_seen)
            .cloned()
            .collect();
        if fresh.len() >= self.config.limits.significant_task_threshold {
            info!(count = fresh.len(), "structural tasks accumulated, invalidating quality gates");
            state.invalidate_quality_gates();
            state.structural_seen.extend(fresh);
        }
        Ok(())
    }

    fn maybe_quick_coherence(&mut self, state: &mut LoopState) -> Result<()> {
        if next_mode(self.tasks_since_quick, false, false) == Some(Mode::Quick) {
            let report = quick_check(&self.ctx())?;
            apply_report(&report, state);
            self.tasks_since_quick = 0;
        }
        Ok(())
    }

    fn commit(&self, state: &LoopState, what: &str) {
        let message = format!(
            "chore(telic): sprint {} iter {} {}",
            self.sprint.name, state.iteration, what
        );
        match self.deps.vcs.commit_all(&message) {
            Ok(true) => debug!(%message, "committed"),
            Ok(false) => debug!("nothing to commit"),
            Err(err) => warn!(%err, "commit failed"),
        }
    }

    fn finish(&mut self, state: &mut LoopState, stop: InnerStop) -> Result<RunReport> {
        let (termination, reason) = match stop {
            InnerStop::Done(t, r) => (t, r),
            InnerStop::Saturated => (Termination::Incomplete, StopReason::Saturated),
        };

        let (passed, blocked, pending) = if self.sprint.test_plan_exists() {
            let plan = self.sprint.read_test_plan()?;
            (plan.passed_count(), plan.blocked_count(), plan.pending_count())
        } else {
            (0, 0, 0)
        };

        if termination == Termination::FullSuccess {
            delete_state(&self.sprint.paths.loop_state_path)?;
        } else {
            write_state(&self.sprint.paths.loop_state_path, state)?;
        }

        Ok(RunReport {
            termination,
            stop: reason,
            iterations: state.iteration,
            passed_tests: passed,
            blocked_tests: blocked,
            pending_tests: pending,
        })
    }
}
