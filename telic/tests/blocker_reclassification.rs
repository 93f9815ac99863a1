//! Scenario: a test claims an external blocker, the verify-blockers agent
//! decides the missing piece is buildable, and the loop builds it.

use std::fs;

use telic::core::blockers::BlockerKind;
use telic::core::types::{AgentRole, Termination};
use telic::engine::{Engine, EngineDeps};
use telic::io::config::LoopConfig;
use telic::test_support::{
    NeverE2e, RecordingVcs, ScriptedInvoker, ScriptedProbe, ScriptedPrompter, TempSprint,
};

#[test]
fn buildable_blocker_becomes_a_build_task_and_the_test_recovers() {
    let fixture = TempSprint::new().expect("fixture");
    // The test already sits blocked-external with a registered blocker;
    // the plan has nothing pending.
    fixture
        .write("IMPLEMENTATION_PLAN.md", "- [x] Task 1.1: Core flow\n")
        .expect("plan");
    fixture
        .write(
            "BETA_TEST_PLAN_v1.md",
            "- [U] BT-1: Viewer sees the dashboard without logging in to X\n",
        )
        .expect("test plan");
    fixture
        .write(
            "BLOCKERS.md",
            "| id | class | description | status |\n|---|---|---|---|\n| BT-1 | AUTH | user must log in to X | open |\n",
        )
        .expect("blockers");

    // Verify-blockers (during value discovery) reclassifies: the vision
    // promises a non-technical user and no login UI exists, so it converts
    // the blocker, appends a BUILD task, and resets the test.
    let blockers_path = fixture.sprint.paths.blockers_path.clone();
    let plan_path = fixture.sprint.paths.plan_path.clone();
    let test_plan_path = fixture.sprint.paths.test_plan_path.clone();
    let build_plan_path = plan_path.clone();
    let invoker = ScriptedInvoker::passing()
        .on_role(AgentRole::VerifyBlockers, move |call| {
            if !call.label.contains("-verify") {
                // Only the value-discovery pass reclassifies.
                return;
            }
            fs::write(
                &blockers_path,
                "| id | class | description | status |\n|---|---|---|---|\n| BT-1 | BUILDABLE | user must log in to X | resolved |\n",
            )
            .expect("blockers");
            let plan = fs::read_to_string(&plan_path).expect("plan");
            fs::write(
                &plan_path,
                format!("{plan}- [ ] BUILD-BT-1: Add a no-login viewer entry point\n"),
            )
            .expect("plan");
            fs::write(
                &test_plan_path,
                "- [ ] BT-1: Viewer sees the dashboard without logging in to X\n",
            )
            .expect("test plan");
        })
        .on_role(AgentRole::ImplementTask, move |_| {
            let plan = fs::read_to_string(&build_plan_path).expect("plan");
            fs::write(&build_plan_path, plan.replace("- [ ] BUILD-BT-1:", "- [x] BUILD-BT-1:"))
                .expect("plan");
        });

    let probe = ScriptedProbe::all_up();
    let prompter = ScriptedPrompter::replying(None);
    let vcs = RecordingVcs::on_branch("work");
    let deps = EngineDeps {
        invoker: &invoker,
        probe: &probe,
        prompter: &prompter,
        e2e: &NeverE2e,
        vcs: &vcs,
    };

    let mut config = LoopConfig::default();
    config.services.clear();
    config.regression.spot_check_probability = 0;

    let mut engine = Engine::new(fixture.sprint.clone(), config, deps, Some(30));
    let report = engine.run().expect("run");

    assert_eq!(report.termination, Termination::FullSuccess);
    assert_eq!(report.passed_tests, 1);
    assert_eq!(report.blocked_tests, 0);

    // The blocker row changed classification.
    let blockers = fixture.sprint.read_blockers().expect("blockers");
    assert_eq!(
        blockers.find("BT-1").expect("row").kind,
        BlockerKind::Buildable
    );
    assert_eq!(blockers.open_external_count(), 0);

    // The executor picked up and completed the BUILD task.
    let plan = fixture.read("IMPLEMENTATION_PLAN.md").expect("plan");
    assert!(plan.contains("- [x] BUILD-BT-1:"), "plan was: {plan}");
    let implemented = invoker
        .calls()
        .iter()
        .any(|c| c.role == AgentRole::ImplementTask && c.prompt.contains("BUILD-BT-1"));
    assert!(implemented);

    // The affected test was reset and then passed.
    let tests = fixture.read("BETA_TEST_PLAN_v1.md").expect("tests");
    assert!(tests.contains("- [x] BT-1:"), "test plan was: {tests}");
}
