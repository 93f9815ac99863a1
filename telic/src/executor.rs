//! Task executor: drives the implementation plan one task at a time.
//!
//! Progress is measured from the plan file itself: pending count, done
//! count, and the task-id set, snapshotted around each invocation. An agent
//! claiming success without moving the plan is an agent that made no
//! progress.

use anyhow::Result;
use tracing::{info, warn};

use crate::agents::AgentCtx;
use crate::core::plan::{TaskStatus, is_credential_task};
use crate::core::types::AgentRole;
use crate::io::state::LoopState;

/// Result of one executor iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// No executable pending task remains.
    NoPendingTask,
    /// The plan moved: fewer pending, more done, or new tasks.
    Progress { task_id: String },
    /// The attempt changed nothing; stuck counter advanced.
    NoChange { task_id: String, attempts: u32 },
    /// Stuck counter hit the cap; the task was marked `[B]`.
    TaskBlocked { task_id: String },
}

/// Execute one task-selection/invocation cycle.
pub fn run_task_iteration(ctx: &AgentCtx<'_>, state: &mut LoopState) -> Result<ExecOutcome> {
    let mut plan = ctx.sprint.read_plan()?;

    // Sweep: tasks that require a human action are marked `[U]` and never
    // handed to an agent.
    let user_action_ids: Vec<_> = plan
        .tasks()
        .filter(|t| t.status == TaskStatus::Pending && is_credential_task(&t.description))
        .map(|t| t.id.clone())
        .collect();
    if !user_action_ids.is_empty() {
        for id in &user_action_ids {
            info!(task = %id, "task requires a human action, marking [U]");
            plan.set_status(id, TaskStatus::UserAction);
        }
        ctx.sprint.write_plan(&plan)?;
    }

    let Some(task) = plan.next_task().cloned() else {
        return Ok(ExecOutcome::NoPendingTask);
    };
    let task_id = task.id.to_string();
    let before = plan.snapshot();

    let invocation = ctx.invoke_default(
        AgentRole::ImplementTask,
        &format!("implement-{task_id}"),
        state.iteration,
        &[("TASK", format!("{}: {}", task.id, task.description))],
    );
    if let Err(err) = invocation {
        warn!(task = %task_id, %err, "implementation invocation failed");
    }

    // The agent's effects are judged from disk, never from its own claims.
    let mut after_plan = ctx.sprint.read_plan()?;
    let after = after_plan.snapshot();

    if before.progressed_to(&after) {
        state.task_attempts.remove(&task_id);
        state.last_task = Some(task_id.clone());
        return Ok(ExecOutcome::Progress { task_id });
    }

    let same_task_as_last = state.last_task.as_deref() == Some(task_id.as_str());
    state.last_task = Some(task_id.clone());
    if !same_task_as_last {
        // A different task with no movement is a fresh first attempt.
        state.task_attempts.remove(&task_id);
    }
    let attempts = state.bump_task_attempts(&task_id);

    if attempts >= ctx.config.limits.max_impl_no_progress {
        warn!(task = %task_id, attempts, "no progress at cap, blocking task");
        after_plan.set_status(&task.id, TaskStatus::Blocked);
        ctx.sprint.write_plan(&after_plan)?;
        state.task_attempts.remove(&task_id);
        return Ok(ExecOutcome::TaskBlocked { task_id });
    }

    Ok(ExecOutcome::NoChange { task_id, attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{Plan, TaskId};
    use crate::io::config::LoopConfig;
    use crate::io::prompt::PromptStore;
    use crate::io::sprint::Sprint;
    use crate::test_support::ScriptedInvoker;
    use std::fs;

    fn setup(temp: &tempfile::TempDir, plan: &str) -> (Sprint, LoopConfig, PromptStore) {
        let sprint = Sprint::open(temp.path()).expect("open");
        sprint.ensure_scaffolding().expect("scaffold");
        fs::write(&sprint.paths.plan_path, plan).expect("write plan");
        (sprint, LoopConfig::default(), PromptStore::new(temp.path().join("prompts")))
    }

    #[test]
    fn progress_resets_the_stuck_counter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) =
            setup(&temp, "- [ ] Task 1.1: Build the dashboard\n");

        // The implement agent marks the task done in the plan.
        let plan_path = sprint.paths.plan_path.clone();
        let invoker = ScriptedInvoker::passing().on_role(AgentRole::ImplementTask, move |_| {
            fs::write(&plan_path, "- [x] Task 1.1: Build the dashboard\n").expect("edit");
        });
        let ctx = AgentCtx {
            sprint: &sprint,
            config: &config,
            invoker: &invoker,
            prompts: &prompts,
        };

        let mut state = LoopState::default();
        state.task_attempts.insert("Task 1.1".to_string(), 2);
        let outcome = run_task_iteration(&ctx, &mut state).expect("run");

        assert_eq!(
            outcome,
            ExecOutcome::Progress {
                task_id: "Task 1.1".to_string()
            }
        );
        assert_eq!(state.task_attempts("Task 1.1"), 0);
    }

    #[test]
    fn repeated_no_change_blocks_the_task_at_the_cap() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp, "- [ ] Task 1.1: Build it\n");
        let invoker = ScriptedInvoker::passing();
        let ctx = AgentCtx {
            sprint: &sprint,
            config: &config,
            invoker: &invoker,
            prompts: &prompts,
        };

        let mut state = LoopState::default();
        let cap = config.limits.max_impl_no_progress;

        for attempt in 1..cap {
            let outcome = run_task_iteration(&ctx, &mut state).expect("run");
            assert_eq!(
                outcome,
                ExecOutcome::NoChange {
                    task_id: "Task 1.1".to_string(),
                    attempts: attempt
                }
            );
        }

        let outcome = run_task_iteration(&ctx, &mut state).expect("run");
        assert_eq!(
            outcome,
            ExecOutcome::TaskBlocked {
                task_id: "Task 1.1".to_string()
            }
        );
        let plan = sprint.read_plan().expect("plan");
        let task = plan.find(&TaskId::parse("Task 1.1").unwrap()).expect("task");
        assert_eq!(task.status, TaskStatus::Blocked);
        // After blocking, nothing is selectable.
        assert_eq!(
            run_task_iteration(&ctx, &mut state).expect("run"),
            ExecOutcome::NoPendingTask
        );
    }

    #[test]
    fn switching_tasks_restarts_the_attempt_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp, "- [ ] BUILD-1: Add form\n");
        let invoker = ScriptedInvoker::passing();
        let ctx = AgentCtx {
            sprint: &sprint,
            config: &config,
            invoker: &invoker,
            prompts: &prompts,
        };

        let mut state = LoopState::default();
        state.last_task = Some("Task 9.9".to_string());
        state.task_attempts.insert("BUILD-1".to_string(), 2);

        let outcome = run_task_iteration(&ctx, &mut state).expect("run");
        assert_eq!(
            outcome,
            ExecOutcome::NoChange {
                task_id: "BUILD-1".to_string(),
                attempts: 1
            }
        );
    }

    #[test]
    fn credential_tasks_are_marked_user_action_and_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(
            &temp,
            "- [ ] Task 1.1: Configure the OAuth secret for staging\n",
        );
        let invoker = ScriptedInvoker::passing();
        let ctx = AgentCtx {
            sprint: &sprint,
            config: &config,
            invoker: &invoker,
            prompts: &prompts,
        };

        let mut state = LoopState::default();
        let outcome = run_task_iteration(&ctx, &mut state).expect("run");
        assert_eq!(outcome, ExecOutcome::NoPendingTask);
        assert!(invoker.calls().is_empty());

        let plan = sprint.read_plan().expect("plan");
        let rendered = plan.render();
        assert!(rendered.starts_with("- [U] Task 1.1:"));
        // The sweep is idempotent.
        let reparsed = Plan::parse(&rendered);
        assert_eq!(reparsed.pending_count(), 0);
    }

    #[test]
    fn new_tasks_created_by_the_agent_count_as_progress() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (sprint, config, prompts) = setup(&temp, "- [ ] Task 1.1: Build it\n");

        let plan_path = sprint.paths.plan_path.clone();
        let invoker = ScriptedInvoker::passing().on_role(AgentRole::ImplementTask, move |_| {
            fs::write(
                &plan_path,
                "- [ ] Task 1.1: Build it\n- [ ] INT-1: Wire it up\n",
            )
            .expect("edit");
        });
        let ctx = AgentCtx {
            sprint: &sprint,
            config: &config,
            invoker: &invoker,
            prompts: &prompts,
        };

        let mut state = LoopState::default();
        let outcome = run_task_iteration(&ctx, &mut state).expect("run");
        assert!(matches!(outcome, ExecOutcome::Progress { .. }));
    }
}
