//! Sprint directory layout and scaffolding.
//!
//! A sprint is the top-level unit of work: one directory holding the
//! human-authored inputs, the agent-owned plan files, and the
//! orchestrator-owned state under `.telic/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::blockers::BlockerRegister;
use crate::core::plan::Plan;
use crate::core::testplan::TestPlan;

/// All canonical paths within a sprint directory.
#[derive(Debug, Clone)]
pub struct SprintPaths {
    pub root: PathBuf,
    pub vision_path: PathBuf,
    pub prd_path: PathBuf,
    pub architecture_path: PathBuf,
    pub plan_path: PathBuf,
    pub test_plan_path: PathBuf,
    pub value_checklist_path: PathBuf,
    pub blockers_path: PathBuf,
    pub loop_state_path: PathBuf,
    pub regression_log_path: PathBuf,
    pub config_path: PathBuf,
    pub telic_dir: PathBuf,
    pub invocations_dir: PathBuf,
    pub epics_path: PathBuf,
}

impl SprintPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let telic_dir = root.join(".telic");
        Self {
            vision_path: root.join("VISION.md"),
            prd_path: root.join("PRD.md"),
            architecture_path: root.join("ARCHITECTURE.md"),
            plan_path: root.join("IMPLEMENTATION_PLAN.md"),
            test_plan_path: root.join("BETA_TEST_PLAN_v1.md"),
            value_checklist_path: root.join("VALUE_CHECKLIST.md"),
            blockers_path: root.join("BLOCKERS.md"),
            loop_state_path: root.join("LOOP_STATE.md"),
            regression_log_path: root.join("REGRESSION_LOG.md"),
            config_path: root.join("loop-config.toml"),
            invocations_dir: telic_dir.join("invocations"),
            epics_path: telic_dir.join("epics.json"),
            telic_dir,
            root,
        }
    }
}

/// One sprint: name, resolved paths, and nothing else. Configuration is
/// carried separately as a value so components never reach for ambient
/// state.
#[derive(Debug, Clone)]
pub struct Sprint {
    pub name: String,
    pub paths: SprintPaths,
}

impl Sprint {
    /// Open a sprint rooted at `root`. The directory must exist; its
    /// basename becomes the sprint name.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(anyhow!("sprint directory {} not found", root.display()));
        }
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("sprint directory {} has no name", root.display()))?;
        Ok(Self {
            name,
            paths: SprintPaths::new(root),
        })
    }

    /// The docs phase: vision and PRD must exist before anything runs.
    pub fn check_docs(&self) -> Result<()> {
        for (label, path) in [
            ("VISION.md", &self.paths.vision_path),
            ("PRD.md", &self.paths.prd_path),
        ] {
            if !path.is_file() {
                return Err(anyhow!(
                    "missing required input {} in {}",
                    label,
                    self.paths.root.display()
                ));
            }
        }
        Ok(())
    }

    /// Create orchestrator-owned scaffolding. Agent-owned files (plan, test
    /// plan, checklist) are created by sub-agents, not here.
    pub fn ensure_scaffolding(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.invocations_dir).with_context(|| {
            format!("create {}", self.paths.invocations_dir.display())
        })?;
        debug!(sprint = %self.name, "scaffolding ensured");
        Ok(())
    }

    pub fn plan_exists(&self) -> bool {
        self.paths.plan_path.is_file()
    }

    pub fn read_plan(&self) -> Result<Plan> {
        let text = fs::read_to_string(&self.paths.plan_path)
            .with_context(|| format!("read {}", self.paths.plan_path.display()))?;
        Ok(Plan::parse(&text))
    }

    pub fn write_plan(&self, plan: &Plan) -> Result<()> {
        fs::write(&self.paths.plan_path, plan.render())
            .with_context(|| format!("write {}", self.paths.plan_path.display()))
    }

    pub fn test_plan_exists(&self) -> bool {
        self.paths.test_plan_path.is_file()
    }

    pub fn read_test_plan(&self) -> Result<TestPlan> {
        let text = fs::read_to_string(&self.paths.test_plan_path)
            .with_context(|| format!("read {}", self.paths.test_plan_path.display()))?;
        Ok(TestPlan::parse(&text))
    }

    pub fn write_test_plan(&self, plan: &TestPlan) -> Result<()> {
        fs::write(&self.paths.test_plan_path, plan.render())
            .with_context(|| format!("write {}", self.paths.test_plan_path.display()))
    }

    /// Blocker register; an absent file reads as an empty register.
    pub fn read_blockers(&self) -> Result<BlockerRegister> {
        if !self.paths.blockers_path.is_file() {
            return Ok(BlockerRegister::default());
        }
        let text = fs::read_to_string(&self.paths.blockers_path)
            .with_context(|| format!("read {}", self.paths.blockers_path.display()))?;
        Ok(BlockerRegister::parse(&text))
    }

    pub fn write_blockers(&self, register: &BlockerRegister) -> Result<()> {
        fs::write(&self.paths.blockers_path, register.render())
            .with_context(|| format!("write {}", self.paths.blockers_path.display()))
    }
}
