//! Gate registry: named one-bit predicates whose truth is persisted.
//!
//! Gate identifiers form a closed set and membership is exact equality —
//! never a substring or prefix test — so `quality.validate` can never be
//! confused with `planning` or with another namespace.

use std::collections::BTreeSet;
use std::fmt;

/// A named, idempotent one-bit predicate. The only transitions are
/// absent→passed (`mark_passed`) and passed→absent (`invalidate`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Gate {
    Vrc1,
    QualityCraap,
    QualityClarity,
    QualityValidate,
    QualityConnect,
    QualityTidy,
    Planning,
    Vrc2,
    Preflight,
    ServicesReady,
    TestplanGenerated,
    /// One gate per completed epic, keyed by epic id.
    EpicComplete(String),
}

impl Gate {
    /// The five `quality.*` gates, in pipeline order.
    pub const QUALITY: [Gate; 5] = [
        Gate::QualityCraap,
        Gate::QualityClarity,
        Gate::QualityValidate,
        Gate::QualityConnect,
        Gate::QualityTidy,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vrc1" => Some(Self::Vrc1),
            "quality.craap" => Some(Self::QualityCraap),
            "quality.clarity" => Some(Self::QualityClarity),
            "quality.validate" => Some(Self::QualityValidate),
            "quality.connect" => Some(Self::QualityConnect),
            "quality.tidy" => Some(Self::QualityTidy),
            "planning" => Some(Self::Planning),
            "vrc2" => Some(Self::Vrc2),
            "preflight" => Some(Self::Preflight),
            "services_ready" => Some(Self::ServicesReady),
            "testplan_generated" => Some(Self::TestplanGenerated),
            other => {
                let id = other.strip_prefix("epic.")?;
                if id.is_empty() {
                    return None;
                }
                Some(Self::EpicComplete(id.to_string()))
            }
        }
    }

    fn is_quality(&self) -> bool {
        Gate::QUALITY.contains(self)
    }

    /// Gates cleared by `invalidate_all_planning`: the whole planning
    /// pipeline from VRC-1 through preflight.
    fn is_planning_pipeline(&self) -> bool {
        matches!(self, Self::Vrc1 | Self::Planning | Self::Vrc2 | Self::Preflight)
            || self.is_quality()
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vrc1 => f.write_str("vrc1"),
            Self::QualityCraap => f.write_str("quality.craap"),
            Self::QualityClarity => f.write_str("quality.clarity"),
            Self::QualityValidate => f.write_str("quality.validate"),
            Self::QualityConnect => f.write_str("quality.connect"),
            Self::QualityTidy => f.write_str("quality.tidy"),
            Self::Planning => f.write_str("planning"),
            Self::Vrc2 => f.write_str("vrc2"),
            Self::Preflight => f.write_str("preflight"),
            Self::ServicesReady => f.write_str("services_ready"),
            Self::TestplanGenerated => f.write_str("testplan_generated"),
            Self::EpicComplete(id) => write!(f, "epic.{id}"),
        }
    }
}

/// Exact-membership set of passed gates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateSet {
    passed: BTreeSet<Gate>,
}

impl GateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_passed(&self, gate: &Gate) -> bool {
        self.passed.contains(gate)
    }

    pub fn mark_passed(&mut self, gate: Gate) {
        self.passed.insert(gate);
    }

    pub fn invalidate(&mut self, gate: &Gate) {
        self.passed.remove(gate);
    }

    /// Clear exactly the `quality.*` gates and nothing else.
    pub fn invalidate_quality_gates(&mut self) {
        self.passed.retain(|g| !g.is_quality());
    }

    /// Clear the planning pipeline (vrc1, quality.*, planning, vrc2,
    /// preflight). Epic-completion and service gates are untouched.
    pub fn invalidate_all_planning(&mut self) {
        self.passed.retain(|g| !g.is_planning_pipeline());
    }

    pub fn reset_all_gates(&mut self) {
        self.passed.clear();
    }

    /// Iterate passed gates in stable (ordered) form for persistence.
    pub fn iter(&self) -> impl Iterator<Item = &Gate> {
        self.passed.iter()
    }

    pub fn len(&self) -> usize {
        self.passed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passed.is_empty()
    }
}

impl FromIterator<Gate> for GateSet {
    fn from_iter<T: IntoIterator<Item = Gate>>(iter: T) -> Self {
        Self {
            passed: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_identifiers_round_trip() {
        let gates = [
            Gate::Vrc1,
            Gate::QualityCraap,
            Gate::QualityClarity,
            Gate::QualityValidate,
            Gate::QualityConnect,
            Gate::QualityTidy,
            Gate::Planning,
            Gate::Vrc2,
            Gate::Preflight,
            Gate::ServicesReady,
            Gate::TestplanGenerated,
            Gate::EpicComplete("auth-flow".to_string()),
        ];
        for gate in gates {
            assert_eq!(Gate::parse(&gate.to_string()), Some(gate));
        }
    }

    #[test]
    fn unknown_and_empty_epic_identifiers_rejected() {
        assert_eq!(Gate::parse("quality"), None);
        assert_eq!(Gate::parse("epic."), None);
        assert_eq!(Gate::parse("vrc"), None);
    }

    #[test]
    fn mark_and_invalidate_round_trip() {
        let mut gates = GateSet::new();
        gates.mark_passed(Gate::Vrc1);
        assert!(gates.is_passed(&Gate::Vrc1));
        gates.invalidate(&Gate::Vrc1);
        assert!(!gates.is_passed(&Gate::Vrc1));
    }

    #[test]
    fn quality_invalidation_clears_exactly_the_quality_namespace() {
        let mut gates: GateSet = [
            Gate::Vrc1,
            Gate::QualityCraap,
            Gate::QualityTidy,
            Gate::Planning,
            Gate::ServicesReady,
        ]
        .into_iter()
        .collect();

        gates.invalidate_quality_gates();

        assert!(gates.is_passed(&Gate::Vrc1));
        assert!(gates.is_passed(&Gate::Planning));
        assert!(gates.is_passed(&Gate::ServicesReady));
        assert!(!gates.is_passed(&Gate::QualityCraap));
        assert!(!gates.is_passed(&Gate::QualityTidy));
    }

    #[test]
    fn planning_invalidation_spares_services_and_epics() {
        let mut gates: GateSet = [
            Gate::Vrc1,
            Gate::QualityConnect,
            Gate::Planning,
            Gate::Vrc2,
            Gate::Preflight,
            Gate::ServicesReady,
            Gate::TestplanGenerated,
            Gate::EpicComplete("e1".to_string()),
        ]
        .into_iter()
        .collect();

        gates.invalidate_all_planning();

        assert_eq!(gates.len(), 3);
        assert!(gates.is_passed(&Gate::ServicesReady));
        assert!(gates.is_passed(&Gate::TestplanGenerated));
        assert!(gates.is_passed(&Gate::EpicComplete("e1".to_string())));
    }

    #[test]
    fn epic_gates_are_distinct_per_id() {
        let mut gates = GateSet::new();
        gates.mark_passed(Gate::EpicComplete("e1".to_string()));
        assert!(!gates.is_passed(&Gate::EpicComplete("e2".to_string())));
    }
}
