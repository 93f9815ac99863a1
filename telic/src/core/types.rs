//! Shared deterministic types for the orchestrator core.
//!
//! These types define stable contracts between core components. They should
//! not depend on external state or I/O and must remain deterministic across
//! runs.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The machine-readable vocabulary a sub-agent may emit on its
/// `RESULT: <TOKEN>` line. Everything else in the output is free-form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultToken {
    Pass,
    Fail,
    Blocked,
    BlockedExternal,
    BlockedFixable,
}

impl ResultToken {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Blocked => "BLOCKED",
            Self::BlockedExternal => "BLOCKED_EXTERNAL",
            Self::BlockedFixable => "BLOCKED_FIXABLE",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "PASS" => Some(Self::Pass),
            "FAIL" => Some(Self::Fail),
            "BLOCKED" => Some(Self::Blocked),
            "BLOCKED_EXTERNAL" => Some(Self::BlockedExternal),
            "BLOCKED_FIXABLE" => Some(Self::BlockedFixable),
            _ => None,
        }
    }
}

impl fmt::Display for ResultToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static RESULT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*RESULT:\s*([A-Z_]+)\s*$").unwrap());

/// Scan captured stdout for the last `RESULT: <TOKEN>` line.
///
/// Missing line and unknown tokens both collapse to `FAIL`: an agent that
/// cannot state its outcome has not demonstrated success.
pub fn scan_result_token(stdout: &str) -> ResultToken {
    RESULT_LINE
        .captures_iter(stdout)
        .last()
        .and_then(|cap| ResultToken::parse(&cap[1]))
        .unwrap_or(ResultToken::Fail)
}

/// Orchestrator phase identifiers persisted in `LOOP_STATE.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Docs,
    Planning,
    Preflight,
    Services,
    Implement,
    Testgen,
    Testing,
    FinalVrc,
    Complete,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Docs => "docs",
            Self::Planning => "planning",
            Self::Preflight => "preflight",
            Self::Services => "services",
            Self::Implement => "implement",
            Self::Testgen => "testgen",
            Self::Testing => "testing",
            Self::FinalVrc => "final_vrc",
            Self::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "docs" => Some(Self::Docs),
            "planning" => Some(Self::Planning),
            "preflight" => Some(Self::Preflight),
            "services" => Some(Self::Services),
            "implement" => Some(Self::Implement),
            "testgen" => Some(Self::Testgen),
            "testing" => Some(Self::Testing),
            "final_vrc" => Some(Self::FinalVrc),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal classification of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// No pending tests, no blocked tests.
    FullSuccess,
    /// No pending tests, some blocked.
    PartialSuccess,
    /// Pending work remained (saturation, stop request, vision not delivered).
    Incomplete,
}

/// Sub-agent roles the orchestrator can invoke. Each maps to one prompt
/// template; per-role timeouts are configured explicitly so budgets never
/// nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    VisionRealityCheck,
    PlanGeneration,
    VerifyBlockers,
    QualityCraap,
    QualityClarity,
    QualityValidate,
    QualityConnect,
    QualityTidy,
    Preflight,
    ImplementTask,
    ServiceDiagnose,
    TestPlan,
    RunTest,
    FixTest,
    DiscoverValue,
    Strategy,
    CoherenceFull,
    EpicDecompose,
    EpicRefine,
}

impl AgentRole {
    /// Template file stem under the prompt directory (`<name>.md`).
    pub fn template_name(self) -> &'static str {
        match self {
            Self::VisionRealityCheck => "vision_reality_check",
            Self::PlanGeneration => "plan_generation",
            Self::VerifyBlockers => "verify_blockers",
            Self::QualityCraap => "quality_craap",
            Self::QualityClarity => "quality_clarity",
            Self::QualityValidate => "quality_validate",
            Self::QualityConnect => "quality_connect",
            Self::QualityTidy => "quality_tidy",
            Self::Preflight => "preflight",
            Self::ImplementTask => "implement_task",
            Self::ServiceDiagnose => "service_diagnose",
            Self::TestPlan => "test_plan",
            Self::RunTest => "run_test",
            Self::FixTest => "fix_test",
            Self::DiscoverValue => "discover_value",
            Self::Strategy => "strategy",
            Self::CoherenceFull => "coherence_full",
            Self::EpicDecompose => "epic_decompose",
            Self::EpicRefine => "epic_refine",
        }
    }
}
