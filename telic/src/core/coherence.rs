//! Coherence-evaluation model: dimensions, findings, and scheduling.
//!
//! Coherence findings are advisory signals to the decision engine; they
//! never block the task that is currently running.

use std::fmt;

/// The seven system-level dimensions, in report order. Quick mode covers
/// only the first two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    StructuralIntegrity,
    InteractionCoherence,
    ConceptualIntegrity,
    BehaviouralConsistency,
    InformationalFlowIntegrity,
    Resilience,
    EvolutionaryCapacity,
}

impl Dimension {
    pub const ALL: [Dimension; 7] = [
        Dimension::StructuralIntegrity,
        Dimension::InteractionCoherence,
        Dimension::ConceptualIntegrity,
        Dimension::BehaviouralConsistency,
        Dimension::InformationalFlowIntegrity,
        Dimension::Resilience,
        Dimension::EvolutionaryCapacity,
    ];

    pub const QUICK: [Dimension; 2] = [
        Dimension::StructuralIntegrity,
        Dimension::InteractionCoherence,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "structural_integrity" => Some(Self::StructuralIntegrity),
            "interaction_coherence" => Some(Self::InteractionCoherence),
            "conceptual_integrity" => Some(Self::ConceptualIntegrity),
            "behavioural_consistency" => Some(Self::BehaviouralConsistency),
            "informational_flow_integrity" => Some(Self::InformationalFlowIntegrity),
            "resilience" => Some(Self::Resilience),
            "evolutionary_capacity" => Some(Self::EvolutionaryCapacity),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StructuralIntegrity => "structural_integrity",
            Self::InteractionCoherence => "interaction_coherence",
            Self::ConceptualIntegrity => "conceptual_integrity",
            Self::BehaviouralConsistency => "behavioural_consistency",
            Self::InformationalFlowIntegrity => "informational_flow_integrity",
            Self::Resilience => "resilience",
            Self::EvolutionaryCapacity => "evolutionary_capacity",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(Self::Info),
            "WARNING" => Some(Self::Warning),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Dimensions 1–2, deterministic file-level checks, no LLM.
    Quick,
    /// All seven dimensions, LLM-backed.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub dimension: Dimension,
    pub severity: Severity,
    pub message: String,
}

/// Structured result of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoherenceReport {
    pub mode: Mode,
    pub findings: Vec<Finding>,
}

impl CoherenceReport {
    pub fn has_critical(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.severity == Severity::Critical)
    }
}

/// Parse findings from full-evaluation agent output. One finding per line:
/// `COHERENCE: <SEVERITY> <dimension> <message>`. Malformed lines are
/// skipped — the report is advisory, not a contract violation.
pub fn parse_findings(stdout: &str) -> Vec<Finding> {
    stdout
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("COHERENCE:")?.trim();
            let (severity_str, rest) = rest.split_once(' ')?;
            let (dimension_str, message) = rest.split_once(' ')?;
            Some(Finding {
                dimension: Dimension::parse(dimension_str)?,
                severity: Severity::parse(severity_str)?,
                message: message.trim().to_string(),
            })
        })
        .collect()
}

/// When to run which mode. `tasks_since_quick` counts completed tasks since
/// the last quick pass.
pub fn next_mode(
    tasks_since_quick: u32,
    at_epic_boundary: bool,
    before_final_vrc: bool,
) -> Option<Mode> {
    if at_epic_boundary || before_final_vrc {
        return Some(Mode::Full);
    }
    if tasks_since_quick >= 5 {
        return Some(Mode::Quick);
    }
    None
}
