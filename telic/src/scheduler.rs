//! Test scheduler: generate the test plan once, then iteratively select,
//! run, classify, fix, and re-verify tests, interleaving regression checks.
//!
//! Every fix is followed by a re-test in the same iteration so the fix is
//! validated while its evidence is fresh. The failing run's full captured
//! output is handed to the fix agent — classification alone is not
//! evidence.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::agents::AgentCtx;
use crate::core::gates::Gate;
use crate::core::plan::{Plan, Task, TaskId, TaskKind, TaskStatus};
use crate::core::testplan::{PendingSelection, TestCase, TestStatus, e2e_annotation};
use crate::core::types::{AgentRole, ResultToken};
use crate::io::process::run_captured;
use crate::io::regression_log::append_entry;
use crate::io::state::LoopState;

/// Outcome of one scheduler iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestIteration {
    /// No pending tests remain.
    NonePending,
    /// Every pending test is at its attempt cap; all were blocked.
    AllCapped { blocked: usize },
    /// One test was run (and possibly fixed and re-run).
    Ran {
        test_id: String,
        final_token: ResultToken,
        passed: bool,
        /// Hash of the latest failing evidence; the meta-reasoner watches
        /// this to see whether fixes change the error surface.
        evidence_hash: Option<u64>,
    },
    /// Consecutive blocked tests exceeded the configured maximum.
    PhaseSaturated,
}

/// Result of a direct end-to-end execution.
#[derive(Debug, Clone)]
pub struct E2eResult {
    pub passed: bool,
    pub output: String,
}

/// External end-to-end runner (spawned by command line, out of scope
/// beyond its exit status).
pub trait E2eRunner {
    fn run(&self, test_dir: &Path, grep: &str) -> Result<E2eResult>;
}

/// Production runner: the configured command with the quoted test name as
/// a grep filter, launched in the configured test directory.
pub struct CommandE2eRunner {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandE2eRunner {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

impl E2eRunner for CommandE2eRunner {
    fn run(&self, test_dir: &Path, grep: &str) -> Result<E2eResult> {
        let program = self.command.first().map(String::as_str).unwrap_or("npx");
        let mut cmd = Command::new(program);
        cmd.args(self.command.iter().skip(1))
            .arg("--grep")
            .arg(grep)
            .current_dir(test_dir);
        let captured = run_captured(cmd, None, self.timeout, self.output_limit_bytes)?;
        let passed = captured.success();
        let mut output = captured.stdout;
        if !captured.stderr.is_empty() {
            output.push_str("\n=== stderr ===\n");
            output.push_str(&captured.stderr);
        }
        Ok(E2eResult { passed, output })
    }
}

/// Generate the test plan once; gated by `testplan_generated`.
pub fn generate_test_plan(ctx: &AgentCtx<'_>, state: &mut LoopState) -> Result<bool> {
    if state.is_passed(&Gate::TestplanGenerated) {
        return Ok(true);
    }
    if let Err(err) = ctx.invoke_default(AgentRole::TestPlan, "test-plan", state.iteration, &[]) {
        warn!(%err, "test plan generation failed");
    }
    if !ctx.sprint.test_plan_exists() {
        warn!("test plan file still missing");
        return Ok(false);
    }
    state.mark_passed(Gate::TestplanGenerated);
    Ok(true)
}

/// One scheduler iteration: regression sweep / spot check as due, then one
/// select-run-classify-fix-retest cycle.
pub fn run_test_iteration<R: Rng>(
    ctx: &AgentCtx<'_>,
    state: &mut LoopState,
    e2e: &dyn E2eRunner,
    rng: &mut R,
) -> Result<TestIteration> {
    if state.fixes_since_regression >= ctx.config.regression.check_interval {
        run_regression_sweep(ctx, state, e2e)?;
        state.fixes_since_regression = 0;
    } else if ctx.config.regression.spot_check_probability > 0
        && rng.random_range(0..100) < ctx.config.regression.spot_check_probability
    {
        run_spot_check(ctx, state, e2e, rng)?;
    }

    let test_plan = ctx.sprint.read_test_plan()?;
    let cap = ctx.config.limits.max_test_fix_attempts;
    let selection = test_plan.next_pending(|id| state.test_attempts(id.as_str()), cap);

    let test = match selection {
        PendingSelection::NonePending => return Ok(TestIteration::NonePending),
        PendingSelection::AllCapped(stuck) => {
            // Resumption path: every pending test already exhausted its
            // budget. Without a live classification, fixable is the
            // conservative default.
            let mut plan = test_plan;
            for test in &stuck {
                plan.set_status(&test.id, TestStatus::BlockedFixable);
            }
            ctx.sprint.write_test_plan(&plan)?;
            return Ok(TestIteration::AllCapped {
                blocked: stuck.len(),
            });
        }
        PendingSelection::Selected(test) => test,
    };

    let (token, evidence) = execute_test(ctx, state, e2e, &test)?;
    debug!(test = %test.id, %token, "test executed");

    if token == ResultToken::Pass {
        return record_pass(ctx, state, &test);
    }

    // Failure or blockage: one attempt = one remediation task + fix agent
    // (fed the captured evidence) + re-test in the same iteration.
    let attempts = state.bump_test_attempts(test.id.as_str());
    append_remediation_task(ctx, &test, token)?;
    run_fix(ctx, state, &test, &evidence)?;
    let (retoken, re_evidence) = execute_test(ctx, state, e2e, &test)?;
    info!(test = %test.id, first = %token, retest = %retoken, "fix validated by re-test");

    if retoken == ResultToken::Pass {
        return record_pass(ctx, state, &test);
    }

    let evidence_hash = Some(surface_hash(&re_evidence));
    if attempts < cap {
        return Ok(TestIteration::Ran {
            test_id: test.id.to_string(),
            final_token: retoken,
            passed: false,
            evidence_hash,
        });
    }

    // Attempt cap reached: terminal classification from the last token.
    let status = match retoken {
        ResultToken::BlockedExternal | ResultToken::Blocked => TestStatus::BlockedExternal,
        _ => TestStatus::BlockedFixable,
    };
    let mut plan = ctx.sprint.read_test_plan()?;
    plan.set_status(&test.id, status);
    ctx.sprint.write_test_plan(&plan)?;
    warn!(test = %test.id, ?status, "attempt cap reached, test blocked");

    state.consecutive_blocked += 1;
    if state.consecutive_blocked > ctx.config.limits.max_consecutive_blocked {
        return Ok(TestIteration::PhaseSaturated);
    }
    Ok(TestIteration::Ran {
        test_id: test.id.to_string(),
        final_token: retoken,
        passed: false,
        evidence_hash,
    })
}

/// Truncated sha256 of failing evidence, compact enough for the metrics.
fn surface_hash(evidence: &str) -> u64 {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(evidence.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
}

fn record_pass(
    ctx: &AgentCtx<'_>,
    state: &mut LoopState,
    test: &TestCase,
) -> Result<TestIteration> {
    let mut plan = ctx.sprint.read_test_plan()?;
    plan.set_status(&test.id, TestStatus::Passed);
    ctx.sprint.write_test_plan(&plan)?;
    close_remediation_tasks(ctx, test)?;
    state.reset_test_attempts(test.id.as_str());
    state.fixes_since_regression += 1;
    state.consecutive_blocked = 0;
    Ok(TestIteration::Ran {
        test_id: test.id.to_string(),
        final_token: ResultToken::Pass,
        passed: true,
        evidence_hash: None,
    })
}

/// Run one test: direct execution for annotated tests, the test-runner
/// sub-agent otherwise. Returns the token plus the evidence for a fix.
fn execute_test(
    ctx: &AgentCtx<'_>,
    state: &LoopState,
    e2e: &dyn E2eRunner,
    test: &TestCase,
) -> Result<(ResultToken, String)> {
    let test_plan = ctx.sprint.read_test_plan()?;
    let block = test_plan
        .extract_block(&test.id)
        .unwrap_or_else(|| test.description.clone());

    if let Some(name) = e2e_annotation(&block) {
        let dir = e2e_dir(ctx);
        debug!(test = %test.id, grep = %name, dir = %dir.display(), "direct e2e execution");
        let result = e2e.run(&dir, &name)?;
        let token = if result.passed {
            ResultToken::Pass
        } else {
            ResultToken::Fail
        };
        return Ok((token, result.output));
    }

    let invocation = ctx.invoke(
        AgentRole::RunTest,
        &format!("run-{}", test.id),
        state.iteration,
        ctx.config.timeouts.test_runner(),
        &[
            ("PREAMBLE", ctx.config.agent.test_runner_preamble.clone()),
            ("TEST_BLOCK", block),
        ],
    );
    match invocation {
        Ok(inv) => {
            let evidence = inv.evidence();
            Ok((inv.token, evidence))
        }
        Err(err) => {
            warn!(test = %test.id, %err, "test-runner invocation failed");
            Ok((ResultToken::Fail, format!("test runner failed: {err:#}")))
        }
    }
}

fn e2e_dir(ctx: &AgentCtx<'_>) -> PathBuf {
    ctx.sprint.paths.root.join(&ctx.config.e2e.test_dir)
}

/// Append the remediation task matching the classification, if absent.
fn append_remediation_task(ctx: &AgentCtx<'_>, test: &TestCase, token: ResultToken) -> Result<()> {
    let (kind, phrase) = match token {
        ResultToken::Fail => (TaskKind::Fix, "Repair the failure behind"),
        ResultToken::BlockedExternal | ResultToken::Blocked => {
            (TaskKind::Feature, "Build the feature that would unblock")
        }
        ResultToken::BlockedFixable => (TaskKind::Arch, "Rework the architecture blocking"),
        ResultToken::Pass => return Ok(()),
    };
    let id = TaskId::derived(kind, test.id.as_str());
    let mut plan = read_or_empty_plan(ctx)?;
    if plan.find(&id).is_none() {
        plan.append_task(Task::pending(
            id,
            format!("{phrase} {}: {}", test.id, test.description),
        ));
        ctx.sprint.write_plan(&plan)?;
    }
    Ok(())
}

/// Remediation tasks are executed inside this scheduler; when their test
/// finally passes, the plan rows close with it.
fn close_remediation_tasks(ctx: &AgentCtx<'_>, test: &TestCase) -> Result<()> {
    if !ctx.sprint.plan_exists() {
        return Ok(());
    }
    let mut plan = ctx.sprint.read_plan()?;
    let mut changed = false;
    for kind in [
        TaskKind::Fix,
        TaskKind::Regression,
        TaskKind::Feature,
        TaskKind::Arch,
    ] {
        let id = TaskId::derived(kind, test.id.as_str());
        if plan
            .find(&id)
            .is_some_and(|t| t.status == TaskStatus::Pending)
        {
            plan.set_status(&id, TaskStatus::Done);
            changed = true;
        }
    }
    if changed {
        ctx.sprint.write_plan(&plan)?;
    }
    Ok(())
}

fn read_or_empty_plan(ctx: &AgentCtx<'_>) -> Result<Plan> {
    if ctx.sprint.plan_exists() {
        ctx.sprint.read_plan()
    } else {
        Ok(Plan::default())
    }
}

fn run_fix(
    ctx: &AgentCtx<'_>,
    state: &LoopState,
    test: &TestCase,
    evidence: &str,
) -> Result<()> {
    let invocation = ctx.invoke(
        AgentRole::FixTest,
        &format!("fix-{}", test.id),
        state.iteration,
        ctx.config.timeouts.fix(),
        &[
            ("TEST_ID", test.id.to_string()),
            ("EVIDENCE", evidence.to_string()),
        ],
    );
    if let Err(err) = invocation {
        warn!(test = %test.id, %err, "fix invocation failed");
    }
    Ok(())
}

/// Re-run every currently passing test; a test that no longer passes is
/// reset to pending with a CRITICAL `REG-*` task and a regression-log
/// entry.
pub fn run_regression_sweep(
    ctx: &AgentCtx<'_>,
    state: &mut LoopState,
    e2e: &dyn E2eRunner,
) -> Result<usize> {
    let passing = ctx.sprint.read_test_plan()?.passed_tests();
    info!(count = passing.len(), "regression sweep");
    let mut regressions = 0;
    for test in passing {
        if !reverify_test(ctx, state, e2e, &test)? {
            regressions += 1;
        }
    }
    Ok(regressions)
}

fn run_spot_check<R: Rng>(
    ctx: &AgentCtx<'_>,
    state: &mut LoopState,
    e2e: &dyn E2eRunner,
    rng: &mut R,
) -> Result<()> {
    let mut passing = ctx.sprint.read_test_plan()?.passed_tests();
    if passing.is_empty() {
        return Ok(());
    }
    passing.shuffle(rng);
    passing.truncate(ctx.config.regression.spot_check_count);
    info!(count = passing.len(), "random spot check");
    for test in passing {
        reverify_test(ctx, state, e2e, &test)?;
    }
    Ok(())
}

/// Re-run one passing test. Returns false (and resets it) on regression.
fn reverify_test(
    ctx: &AgentCtx<'_>,
    state: &mut LoopState,
    e2e: &dyn E2eRunner,
    test: &TestCase,
) -> Result<bool> {
    let (token, _) = execute_test(ctx, state, e2e, test)?;
    if token == ResultToken::Pass {
        return Ok(true);
    }

    warn!(test = %test.id, %token, "regression detected");
    let mut plan = ctx.sprint.read_test_plan()?;
    plan.set_status(&test.id, TestStatus::Pending);
    ctx.sprint.write_test_plan(&plan)?;

    let reg_id = TaskId::derived(TaskKind::Regression, test.id.as_str());
    let mut impl_plan = read_or_empty_plan(ctx)?;
    if impl_plan.find(&reg_id).is_none() {
        impl_plan.append_task(Task::pending(
            reg_id,
            format!("CRITICAL: restore regressed test {}: {}", test.id, test.description),
        ));
        ctx.sprint.write_plan(&impl_plan)?;
    }
    append_entry(
        &ctx.sprint.paths.regression_log_path,
        test.id.as_str(),
        &format!("regressed ({token}), reset to pending"),
    )?;
    state.fixes_since_regression = 0;
    Ok(false)
}

/// Re-run every passing test without resetting the fixes counter first —
/// the final pre-completion sweep. Returns the regressed test ids.
pub fn final_regression(
    ctx: &AgentCtx<'_>,
    state: &mut LoopState,
    e2e: &dyn E2eRunner,
) -> Result<Vec<String>> {
    let passing = ctx.sprint.read_test_plan()?.passed_tests();
    let mut regressed = Vec::new();
    for test in passing {
        if !reverify_test(ctx, state, e2e, &test)? {
            regressed.push(test.id.to_string());
        }
    }
    Ok(regressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::LoopConfig;
    use crate::io::prompt::PromptStore;
    use crate::io::sprint::Sprint;
    use crate::test_support::{NeverE2e, ScriptedInvoker, seeded_rng};
    use std::fs;

    fn setup(temp: &tempfile::TempDir, test_plan: &str) -> (Sprint, LoopConfig, PromptStore) {
        let sprint = Sprint::open(temp.path()).expect("open");
        sprint.ensure_scaffolding().expect("scaffold");
        fs::write(&sprint.paths.test_plan_path, test_plan).expect("write");
        let mut config = LoopConfig::default();
        // Spot checks are exercised explicitly, not at random.
        config.regression.spot_check_probability = 0;
        (sprint, config, PromptStore::new(temp.path().join("prompts")))
    }

    fn ctx<'a>(
        sprint: &'a Sprint,
        config: &'a LoopConfig,
        invoker: &'a ScriptedInvoker,
        prompts: &'a PromptStore,
    ) -> AgentCtx<'a> {
        AgentCtx {
            sprint,
            config,
            invoker,
            prompts,
        }
    }

    #[test]
    fn passing_test_is_marked_and_counters_reset() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp, "- [ ] BT-1: Landing renders\n");
        let invoker = ScriptedInvoker::passing();
        let ctx = ctx(&sprint, &config, &invoker, &prompts);

        let mut state = LoopState::default();
        state.consecutive_blocked = 2;
        let outcome =
            run_test_iteration(&ctx, &mut state, &NeverE2e, &mut seeded_rng()).expect("run");

        assert_eq!(
            outcome,
            TestIteration::Ran {
                test_id: "BT-1".to_string(),
                final_token: ResultToken::Pass,
                passed: true,
                evidence_hash: None,
            }
        );
        assert_eq!(state.fixes_since_regression, 1);
        assert_eq!(state.consecutive_blocked, 0);
        let plan = sprint.read_test_plan().expect("plan");
        assert_eq!(plan.passed_count(), 1);
    }

    #[test]
    fn failing_test_triggers_fix_task_fix_agent_and_retest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp, "- [ ] BT-1: Landing renders\n");
        let invoker = ScriptedInvoker::passing();
        invoker.queue_with_stdout(AgentRole::RunTest, ResultToken::Fail, "expected hero\nRESULT: FAIL");
        // Re-test after the fix passes.
        invoker.queue(AgentRole::RunTest, ResultToken::Pass);
        let ctx = ctx(&sprint, &config, &invoker, &prompts);

        let mut state = LoopState::default();
        let outcome =
            run_test_iteration(&ctx, &mut state, &NeverE2e, &mut seeded_rng()).expect("run");

        assert!(matches!(outcome, TestIteration::Ran { passed: true, .. }));
        // FIX task was appended.
        let plan = sprint.read_plan().expect("plan");
        assert!(plan.find(&TaskId::parse("FIX-BT-1").unwrap()).is_some());
        // The fix agent saw the captured failure evidence.
        let fix_call = invoker
            .calls()
            .into_iter()
            .find(|c| c.role == AgentRole::FixTest)
            .expect("fix call");
        assert!(fix_call.prompt.contains("expected hero"));
        // Attempt counter was reset by the eventual pass.
        assert_eq!(state.test_attempts("BT-1"), 0);
    }

    #[test]
    fn blocked_external_emits_feat_task() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp, "- [ ] VAL-1: Revenue total shown\n");
        let invoker = ScriptedInvoker::passing();
        invoker.queue(AgentRole::RunTest, ResultToken::BlockedExternal);
        invoker.queue(AgentRole::RunTest, ResultToken::BlockedExternal);
        let ctx = ctx(&sprint, &config, &invoker, &prompts);

        let mut state = LoopState::default();
        let outcome =
            run_test_iteration(&ctx, &mut state, &NeverE2e, &mut seeded_rng()).expect("run");

        assert!(matches!(outcome, TestIteration::Ran { passed: false, .. }));
        let plan = sprint.read_plan().expect("plan");
        assert!(plan.find(&TaskId::parse("FEAT-VAL-1").unwrap()).is_some());
        assert_eq!(state.test_attempts("VAL-1"), 1);
    }

    #[test]
    fn fix_attempts_exhaust_to_blocked_fixable_at_the_cap() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, mut config, prompts) = setup(&temp, "- [ ] BT-1: Renders\n");
        config.limits.max_test_fix_attempts = 3;
        let invoker = ScriptedInvoker::failing();
        let ctx = ctx(&sprint, &config, &invoker, &prompts);

        let mut state = LoopState::default();
        for _ in 0..2 {
            let outcome =
                run_test_iteration(&ctx, &mut state, &NeverE2e, &mut seeded_rng()).expect("run");
            assert!(matches!(outcome, TestIteration::Ran { passed: false, .. }));
            assert_eq!(sprint.read_test_plan().expect("plan").pending_count(), 1);
        }

        // Third fix attempt exhausts the budget.
        let outcome =
            run_test_iteration(&ctx, &mut state, &NeverE2e, &mut seeded_rng()).expect("run");
        assert!(matches!(outcome, TestIteration::Ran { passed: false, .. }));

        let plan = sprint.read_test_plan().expect("plan");
        assert_eq!(plan.blocked_count(), 1);
        assert_eq!(plan.pending_count(), 0);
        assert_eq!(state.consecutive_blocked, 1);
        // Exactly one fix invocation per attempt.
        let fixes = invoker
            .calls()
            .iter()
            .filter(|c| c.role == AgentRole::FixTest)
            .count();
        assert_eq!(fixes, 3);
    }

    #[test]
    fn phase_saturates_beyond_max_consecutive_blocked() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, mut config, prompts) =
            setup(&temp, "- [ ] BT-1: One\n- [ ] BT-2: Two\n");
        config.limits.max_test_fix_attempts = 1;
        config.limits.max_consecutive_blocked = 0;
        let invoker = ScriptedInvoker::failing();
        let ctx = ctx(&sprint, &config, &invoker, &prompts);

        let mut state = LoopState::default();
        let outcome =
            run_test_iteration(&ctx, &mut state, &NeverE2e, &mut seeded_rng()).expect("run");
        assert_eq!(outcome, TestIteration::PhaseSaturated);
    }

    #[test]
    fn all_capped_pending_tests_are_blocked_in_bulk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp, "- [ ] BT-1: One\n- [ ] BT-2: Two\n");
        let invoker = ScriptedInvoker::passing();
        let ctx = ctx(&sprint, &config, &invoker, &prompts);

        let mut state = LoopState::default();
        let cap = config.limits.max_test_fix_attempts;
        state.test_attempts.insert("BT-1".to_string(), cap);
        state.test_attempts.insert("BT-2".to_string(), cap);

        let outcome =
            run_test_iteration(&ctx, &mut state, &NeverE2e, &mut seeded_rng()).expect("run");
        assert_eq!(outcome, TestIteration::AllCapped { blocked: 2 });
        let plan = sprint.read_test_plan().expect("plan");
        assert_eq!(plan.blocked_count(), 2);
        assert!(invoker.calls().is_empty());
    }

    #[test]
    fn regression_sweep_resets_failing_passers_and_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(
            &temp,
            "- [x] BT-1: One\n- [x] BT-2: Two\n- [ ] BT-3: Three\n",
        );
        let invoker = ScriptedInvoker::passing();
        // BT-1 regresses, BT-2 still passes.
        invoker.queue(AgentRole::RunTest, ResultToken::Fail);
        invoker.queue(AgentRole::RunTest, ResultToken::Pass);
        let ctx = ctx(&sprint, &config, &invoker, &prompts);

        let mut state = LoopState::default();
        state.fixes_since_regression = 4;
        let regressions = run_regression_sweep(&ctx, &mut state, &NeverE2e).expect("sweep");

        assert_eq!(regressions, 1);
        assert_eq!(state.fixes_since_regression, 0);
        let plan = sprint.read_test_plan().expect("plan");
        assert_eq!(plan.passed_count(), 1);
        assert_eq!(plan.pending_count(), 2);

        let impl_plan = sprint.read_plan().expect("plan");
        let reg = impl_plan
            .find(&TaskId::parse("REG-BT-1").unwrap())
            .expect("REG task");
        assert!(reg.description.starts_with("CRITICAL:"));

        let log = fs::read_to_string(&sprint.paths.regression_log_path).expect("log");
        assert!(log.contains("BT-1: regressed"));
        assert!(!log.contains("BT-2: regressed"));
    }

    #[test]
    fn sweep_runs_when_fix_interval_reached() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, mut config, prompts) =
            setup(&temp, "- [x] BT-1: One\n- [ ] BT-2: Two\n");
        config.regression.check_interval = 2;
        let invoker = ScriptedInvoker::passing();
        let ctx = ctx(&sprint, &config, &invoker, &prompts);

        let mut state = LoopState::default();
        state.fixes_since_regression = 2;
        run_test_iteration(&ctx, &mut state, &NeverE2e, &mut seeded_rng()).expect("run");

        // Sweep re-ran BT-1, then the iteration ran BT-2 and passed it,
        // which re-increments the counter from its post-sweep reset.
        let run_calls = invoker
            .calls()
            .iter()
            .filter(|c| c.role == AgentRole::RunTest)
            .count();
        assert_eq!(run_calls, 2);
        assert_eq!(state.fixes_since_regression, 1);
    }

    #[test]
    fn annotated_tests_route_to_the_e2e_runner() {
        use std::sync::Mutex;

        struct Recorder {
            greps: Mutex<Vec<(PathBuf, String)>>,
        }
        impl E2eRunner for Recorder {
            fn run(&self, test_dir: &Path, grep: &str) -> Result<E2eResult> {
                self.greps
                    .lock()
                    .unwrap()
                    .push((test_dir.to_path_buf(), grep.to_string()));
                Ok(E2eResult {
                    passed: true,
                    output: "1 passed".to_string(),
                })
            }
        }

        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(
            &temp,
            "- [ ] BT-1: Landing renders (E2E: \"landing renders\")\n",
        );
        let invoker = ScriptedInvoker::passing();
        let ctx = ctx(&sprint, &config, &invoker, &prompts);
        let recorder = Recorder {
            greps: Mutex::new(Vec::new()),
        };

        let mut state = LoopState::default();
        let outcome =
            run_test_iteration(&ctx, &mut state, &recorder, &mut seeded_rng()).expect("run");

        assert!(matches!(outcome, TestIteration::Ran { passed: true, .. }));
        let greps = recorder.greps.lock().unwrap();
        assert_eq!(greps.len(), 1);
        assert_eq!(greps[0].1, "landing renders");
        assert!(greps[0].0.ends_with("e2e"));
        // No test-runner agent call for a direct execution.
        assert!(
            invoker
                .calls()
                .iter()
                .all(|c| c.role != AgentRole::RunTest)
        );
    }

    #[test]
    fn final_regression_reports_regressed_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp, "- [x] BT-1: One\n- [x] VAL-2: Two\n");
        let invoker = ScriptedInvoker::passing();
        invoker.queue(AgentRole::RunTest, ResultToken::Pass);
        invoker.queue(AgentRole::RunTest, ResultToken::Fail);
        let ctx = ctx(&sprint, &config, &invoker, &prompts);

        let mut state = LoopState::default();
        let regressed = final_regression(&ctx, &mut state, &NeverE2e).expect("final");
        assert_eq!(regressed, vec!["VAL-2".to_string()]);
    }

    #[test]
    fn test_plan_generation_is_gated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sprint = Sprint::open(temp.path()).expect("open");
        sprint.ensure_scaffolding().expect("scaffold");
        let config = LoopConfig::default();
        let prompts = PromptStore::new(temp.path().join("prompts"));

        let test_plan_path = sprint.paths.test_plan_path.clone();
        let invoker = ScriptedInvoker::passing().on_role(AgentRole::TestPlan, move |_| {
            fs::write(&test_plan_path, "- [ ] BT-1: Renders\n").expect("write");
        });
        let ctx = AgentCtx {
            sprint: &sprint,
            config: &config,
            invoker: &invoker,
            prompts: &prompts,
        };

        let mut state = LoopState::default();
        assert!(generate_test_plan(&ctx, &mut state).expect("generate"));
        assert!(state.is_passed(&Gate::TestplanGenerated));
        assert!(generate_test_plan(&ctx, &mut state).expect("generate again"));
        // Only one generation call despite two invocations.
        assert_eq!(invoker.calls().len(), 1);
    }
}
