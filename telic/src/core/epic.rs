//! Epic records and multi-epic vision classification.
//!
//! Epics are horizontal slices: each one independently demonstrable
//! end-to-end value. Only the active epic carries a full plan; later epics
//! stay sketches until they activate.

use serde::{Deserialize, Serialize};

/// Maximum epics a decomposition may produce.
pub const MAX_EPICS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EpicState {
    Pending,
    Active,
    AwaitingCheckpoint,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailLevel {
    Sketch,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub position: u32,
    pub value_statement: String,
    pub completion_criteria: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub detail: DetailLevel,
    pub state: EpicState,
}

/// Ordered epic list as stored in `.telic/epics.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpicList {
    pub epics: Vec<Epic>,
}

impl EpicList {
    /// Semantic invariants beyond the JSON schema: unique ids, contiguous
    /// positions from 1, known dependencies, no forward self-dependency,
    /// and the epic-count cap.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.epics.len() > MAX_EPICS {
            errors.push(format!(
                "{} epics exceed the maximum of {MAX_EPICS}",
                self.epics.len()
            ));
        }
        for (idx, epic) in self.epics.iter().enumerate() {
            let expected = u32::try_from(idx).unwrap_or(u32::MAX) + 1;
            if epic.position != expected {
                errors.push(format!(
                    "epic '{}' has position {} (expected {expected})",
                    epic.id, epic.position
                ));
            }
            if self.epics.iter().filter(|e| e.id == epic.id).count() > 1 {
                errors.push(format!("duplicate epic id '{}'", epic.id));
            }
            for dep in &epic.depends_on {
                if dep == &epic.id {
                    errors.push(format!("epic '{}' depends on itself", epic.id));
                } else if !self.epics.iter().any(|e| &e.id == dep) {
                    errors.push(format!("epic '{}' depends on unknown '{dep}'", epic.id));
                }
            }
        }
        errors.sort();
        errors.dedup();
        errors
    }

    pub fn find(&self, id: &str) -> Option<&Epic> {
        self.epics.iter().find(|e| e.id == id)
    }

    /// The epic that should run next: the first non-complete epic whose
    /// dependencies are all complete. `None` when every epic is complete
    /// or the next epic is dependency-blocked.
    pub fn next_runnable(&self) -> Option<&Epic> {
        let candidate = self.epics.iter().find(|e| e.state != EpicState::Complete)?;
        let deps_met = candidate.depends_on.iter().all(|dep| {
            self.find(dep)
                .is_some_and(|e| e.state == EpicState::Complete)
        });
        deps_met.then_some(candidate)
    }

    pub fn set_state(&mut self, id: &str, state: EpicState) -> bool {
        match self.epics.iter_mut().find(|e| e.id == id) {
            Some(epic) => {
                epic.state = state;
                true
            }
            None => false,
        }
    }

    /// Refine an epic's detail from sketch to full; only legal on
    /// activation.
    pub fn refine(&mut self, id: &str) -> bool {
        match self.epics.iter_mut().find(|e| e.id == id) {
            Some(epic) if epic.detail == DetailLevel::Sketch => {
                epic.detail = DetailLevel::Full;
                true
            }
            _ => false,
        }
    }

    pub fn all_complete(&self) -> bool {
        !self.epics.is_empty() && self.epics.iter().all(|e| e.state == EpicState::Complete)
    }
}

/// Vision-shape signals feeding the multi-epic classification. Extracted by
/// a sub-agent; the decision itself is deterministic.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VisionSignals {
    pub independent_deliverables: u32,
    pub estimated_tasks: u32,
    pub dependency_depth: u32,
    pub technology_domains: u32,
    pub external_integrations: u32,
}

impl VisionSignals {
    /// A vision is multi-epic when any single heuristic fires. Simple
    /// visions skip decomposition entirely.
    pub fn is_multi_epic(&self) -> bool {
        self.independent_deliverables > 3
            || self.estimated_tasks > 15
            || self.dependency_depth > 2
            || self.technology_domains > 2
            || self.external_integrations > 1
    }
}

/// Human response to a between-epic checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointDecision {
    Proceed,
    Adjust(String),
    Stop,
}

impl CheckpointDecision {
    /// Parse a checkpoint reply. First character decides; the remainder of
    /// an `a` reply becomes the adjustment notes. Unrecognised input is
    /// treated as Proceed, matching the timeout default.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        match trimmed.chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('s') => Self::Stop,
            Some('a') => {
                let notes = trimmed[1..].trim().to_string();
                Self::Adjust(notes)
            }
            _ => Self::Proceed,
        }
    }
}
