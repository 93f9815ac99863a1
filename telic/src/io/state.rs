//! Durable loop state in `LOOP_STATE.md`.
//!
//! The format is line-oriented, human-diffable, and self-describing: one
//! `key: value` per line, repeated keys building collections. Writes are
//! atomic (temp file + rename) so a partial write can never be observed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::core::fingerprint::{Fingerprint, StuckTracker};
use crate::core::gates::{Gate, GateSet};
use crate::core::types::Phase;

const HEADER: &str = "# Telic loop state. One key per line; edit with care.";

/// The persisted machine state for one sprint.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopState {
    pub phase: Phase,
    pub iteration: u32,
    pub gates: GateSet,
    /// Per-task attempt counters, keyed by task id.
    pub task_attempts: BTreeMap<String, u32>,
    /// Per-test attempt counters, keyed by test id.
    pub test_attempts: BTreeMap<String, u32>,
    pub fingerprint: Option<String>,
    pub fingerprint_repeats: u32,
    pub fixes_since_regression: u32,
    pub consecutive_blocked: u32,
    /// Iteration of the last strategy change, if any.
    pub strategy_iteration: Option<u32>,
    /// Service-readiness supervision attempts consumed.
    pub service_attempts: u32,
    /// Task selected by the previous executor iteration, for the inner
    /// stuck layer.
    pub last_task: Option<String>,
    /// Structural task ids already counted toward the significance
    /// threshold, so re-reads never double-count.
    pub structural_seen: BTreeSet<String>,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            phase: Phase::Docs,
            iteration: 0,
            gates: GateSet::new(),
            task_attempts: BTreeMap::new(),
            test_attempts: BTreeMap::new(),
            fingerprint: None,
            fingerprint_repeats: 0,
            fixes_since_regression: 0,
            consecutive_blocked: 0,
            strategy_iteration: None,
            service_attempts: 0,
            last_task: None,
            structural_seen: BTreeSet::new(),
        }
    }
}

impl LoopState {
    pub fn is_passed(&self, gate: &Gate) -> bool {
        self.gates.is_passed(gate)
    }

    pub fn mark_passed(&mut self, gate: Gate) {
        self.gates.mark_passed(gate);
    }

    pub fn invalidate(&mut self, gate: &Gate) {
        self.gates.invalidate(gate);
    }

    pub fn invalidate_quality_gates(&mut self) {
        self.gates.invalidate_quality_gates();
    }

    pub fn invalidate_all_planning(&mut self) {
        self.gates.invalidate_all_planning();
    }

    pub fn reset_all_gates(&mut self) {
        self.gates.reset_all_gates();
    }

    pub fn task_attempts(&self, id: &str) -> u32 {
        self.task_attempts.get(id).copied().unwrap_or(0)
    }

    pub fn bump_task_attempts(&mut self, id: &str) -> u32 {
        let counter = self.task_attempts.entry(id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn test_attempts(&self, id: &str) -> u32 {
        self.test_attempts.get(id).copied().unwrap_or(0)
    }

    pub fn bump_test_attempts(&mut self, id: &str) -> u32 {
        let counter = self.test_attempts.entry(id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn reset_test_attempts(&mut self, id: &str) {
        self.test_attempts.remove(id);
    }

    /// View of the persisted stuck-tracker pair.
    pub fn stuck_tracker(&self) -> StuckTracker {
        StuckTracker::new(
            self.fingerprint.clone().map(Fingerprint::from_raw),
            self.fingerprint_repeats,
        )
    }

    pub fn store_stuck_tracker(&mut self, tracker: &StuckTracker) {
        self.fingerprint = tracker.last().map(|fp| fp.as_str().to_string());
        self.fingerprint_repeats = tracker.repeats();
    }
}

/// Load state. Missing file → first-run state; unreadable or malformed →
/// fatal (the operator must resolve it, not the loop).
pub fn load_state(path: &Path) -> Result<LoopState> {
    if !path.exists() {
        return Ok(LoopState::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    parse_state(&contents).with_context(|| format!("parse state {}", path.display()))
}

/// Atomically persist state.
pub fn write_state(path: &Path, state: &LoopState) -> Result<()> {
    let contents = render_state(state);
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

/// Remove the state file (full success).
pub fn delete_state(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("delete state {}", path.display()))?;
    }
    Ok(())
}

fn render_state(state: &LoopState) -> String {
    let mut buf = String::new();
    buf.push_str(HEADER);
    buf.push('\n');
    buf.push_str(&format!("phase: {}\n", state.phase));
    buf.push_str(&format!("iteration: {}\n", state.iteration));
    for gate in state.gates.iter() {
        buf.push_str(&format!("gate: {gate}\n"));
    }
    for (id, count) in &state.task_attempts {
        buf.push_str(&format!("task_attempt: {id}={count}\n"));
    }
    for (id, count) in &state.test_attempts {
        buf.push_str(&format!("test_attempt: {id}={count}\n"));
    }
    if let Some(fp) = &state.fingerprint {
        buf.push_str(&format!("fingerprint: {fp}\n"));
    }
    buf.push_str(&format!(
        "fingerprint_repeats: {}\n",
        state.fingerprint_repeats
    ));
    buf.push_str(&format!(
        "fixes_since_regression: {}\n",
        state.fixes_since_regression
    ));
    buf.push_str(&format!(
        "consecutive_blocked: {}\n",
        state.consecutive_blocked
    ));
    if let Some(iter) = state.strategy_iteration {
        buf.push_str(&format!("strategy_iteration: {iter}\n"));
    }
    buf.push_str(&format!("service_attempts: {}\n", state.service_attempts));
    if let Some(task) = &state.last_task {
        buf.push_str(&format!("last_task: {task}\n"));
    }
    for id in &state.structural_seen {
        buf.push_str(&format!("structural_seen: {id}\n"));
    }
    buf
}

fn parse_state(contents: &str) -> Result<LoopState> {
    let mut state = LoopState::default();
    for (lineno, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (key, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("line {}: expected 'key: value'", lineno + 1))?;
        let value = value.trim();
        match key.trim() {
            "phase" => {
                state.phase = Phase::parse(value)
                    .ok_or_else(|| anyhow!("line {}: unknown phase '{value}'", lineno + 1))?;
            }
            "iteration" => {
                state.iteration = value
                    .parse()
                    .map_err(|_| anyhow!("line {}: bad iteration '{value}'", lineno + 1))?;
            }
            "gate" => {
                let gate = Gate::parse(value)
                    .ok_or_else(|| anyhow!("line {}: unknown gate '{value}'", lineno + 1))?;
                state.gates.mark_passed(gate);
            }
            "task_attempt" => {
                let (id, count) = parse_counter(value, lineno)?;
                state.task_attempts.insert(id, count);
            }
            "test_attempt" => {
                let (id, count) = parse_counter(value, lineno)?;
                state.test_attempts.insert(id, count);
            }
            "fingerprint" => state.fingerprint = Some(value.to_string()),
            "fingerprint_repeats" => {
                state.fingerprint_repeats = value
                    .parse()
                    .map_err(|_| anyhow!("line {}: bad repeats '{value}'", lineno + 1))?;
            }
            "fixes_since_regression" => {
                state.fixes_since_regression = value
                    .parse()
                    .map_err(|_| anyhow!("line {}: bad counter '{value}'", lineno + 1))?;
            }
            "consecutive_blocked" => {
                state.consecutive_blocked = value
                    .parse()
                    .map_err(|_| anyhow!("line {}: bad counter '{value}'", lineno + 1))?;
            }
            "strategy_iteration" => {
                state.strategy_iteration = Some(
                    value
                        .parse()
                        .map_err(|_| anyhow!("line {}: bad iteration '{value}'", lineno + 1))?,
                );
            }
            "service_attempts" => {
                state.service_attempts = value
                    .parse()
                    .map_err(|_| anyhow!("line {}: bad counter '{value}'", lineno + 1))?;
            }
            "last_task" => state.last_task = Some(value.to_string()),
            "structural_seen" => {
                state.structural_seen.insert(value.to_string());
            }
            other => {
                return Err(anyhow!("line {}: unrecognised key '{other}'", lineno + 1));
            }
        }
    }
    Ok(state)
}

fn parse_counter(value: &str, lineno: usize) -> Result<(String, u32)> {
    let (id, count) = value
        .rsplit_once('=')
        .ok_or_else(|| anyhow!("line {}: expected 'id=count'", lineno + 1))?;
    let count = count
        .parse()
        .map_err(|_| anyhow!("line {}: bad count in '{value}'", lineno + 1))?;
    Ok((id.trim().to_string(), count))
}
