//! Implementation-plan model: typed tasks parsed from the markdown checkbox
//! list in `IMPLEMENTATION_PLAN.md`.
//!
//! Task categories are an explicit tagged variant; the textual prefix
//! (`BUILD-`, `INT-`, …) is retained only for the human-readable plan file.
//! Parsing is lossless: non-task lines survive a parse/render round trip
//! byte for byte.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Task category, tagged by identifier prefix in the plan file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskKind {
    /// `BUILD-*` — UI gap promoted from a blocker.
    Build,
    /// `INT-*` — integration/wiring work.
    Integration,
    /// `FIX-*` — remediation for a failing test.
    Fix,
    /// `REG-*` — regression repair.
    Regression,
    /// `SVC-*` — service startup fix.
    Service,
    /// `IMPL-*` — greenfield service implementation.
    Greenfield,
    /// `FEAT-*` — feature that would unblock an externally blocked test.
    Feature,
    /// `ARCH-*` — architectural work behind a fixable blocker.
    Arch,
    /// `PREP-*` — preparatory/structural work.
    Prep,
    /// `Task N.M` — routine implementation from the original plan.
    Routine,
}

impl TaskKind {
    /// Kinds that count as structural when they appear mid-run; enough of
    /// them accumulating invalidates the quality gates.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            Self::Service | Self::Integration | Self::Arch | Self::Prep
        )
    }
}

/// Task status as stored in the checkbox marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// `[ ]`
    Pending,
    /// `[x]`
    Done,
    /// `[B]`
    Blocked,
    /// `[U]` — requires a human action (credentials, interactive auth).
    UserAction,
}

impl TaskStatus {
    fn marker(self) -> char {
        match self {
            Self::Pending => ' ',
            Self::Done => 'x',
            Self::Blocked => 'B',
            Self::UserAction => 'U',
        }
    }

    fn from_marker(c: char) -> Option<Self> {
        match c {
            ' ' => Some(Self::Pending),
            'x' => Some(Self::Done),
            'B' => Some(Self::Blocked),
            'U' => Some(Self::UserAction),
            _ => None,
        }
    }
}

/// Typed task identifier. `raw` is the exact text used in the plan file
/// (`BUILD-3`, `Task 2.1`); equality and ordering follow the raw form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId {
    pub kind: TaskKind,
    raw: String,
}

static ROUTINE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Task \d+\.\d+$").unwrap());

impl TaskId {
    pub fn parse(raw: &str) -> Option<Self> {
        let kind = if ROUTINE_ID.is_match(raw) {
            TaskKind::Routine
        } else {
            let (prefix, rest) = raw.split_once('-')?;
            if rest.is_empty() {
                return None;
            }
            match prefix {
                "BUILD" => TaskKind::Build,
                "INT" => TaskKind::Integration,
                "FIX" => TaskKind::Fix,
                "REG" => TaskKind::Regression,
                "SVC" => TaskKind::Service,
                "IMPL" => TaskKind::Greenfield,
                "FEAT" => TaskKind::Feature,
                "ARCH" => TaskKind::Arch,
                "PREP" => TaskKind::Prep,
                _ => return None,
            }
        };
        Some(Self {
            kind,
            raw: raw.to_string(),
        })
    }

    /// Build a typed id from a kind and suffix (`TaskId::derived(Fix, "BT-2")`
    /// → `FIX-BT-2`). Routine ids cannot be derived.
    pub fn derived(kind: TaskKind, suffix: &str) -> Self {
        let prefix = match kind {
            TaskKind::Build => "BUILD",
            TaskKind::Integration => "INT",
            TaskKind::Fix => "FIX",
            TaskKind::Regression => "REG",
            TaskKind::Service => "SVC",
            TaskKind::Greenfield => "IMPL",
            TaskKind::Feature => "FEAT",
            TaskKind::Arch => "ARCH",
            TaskKind::Prep => "PREP",
            TaskKind::Routine => "Task",
        };
        Self {
            kind,
            raw: format!("{prefix}-{suffix}"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One task row of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub description: String,
}

impl Task {
    pub fn pending(id: TaskId, description: impl Into<String>) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            description: description.into(),
        }
    }

    fn render(&self) -> String {
        format!(
            "- [{}] {}: {}",
            self.status.marker(),
            self.id,
            self.description
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PlanLine {
    Task(Task),
    Text(String),
}

static TASK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^- \[(.)\] ([^:]+): (.*)$").unwrap());

/// Keywords that mark a task as requiring a human (credential
/// configuration, interactive auth). Matching tasks are never auto-executed.
static CREDENTIAL_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(api[ _-]?key|credential|secret|password|oauth|2fa|mfa|sign[ _-]?up for|create an account)\b")
        .unwrap()
});

/// True when a task description names a human-only action.
pub fn is_credential_task(description: &str) -> bool {
    CREDENTIAL_KEYWORDS.is_match(description)
}

/// The full plan file: task rows plus surrounding prose, order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    lines: Vec<PlanLine>,
}

impl Plan {
    /// Parse plan text. Lines that look like task rows but carry an unknown
    /// prefix or marker are kept as plain text rather than rejected — plan
    /// files are agent- and human-edited.
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|line| match parse_task_line(line) {
                Some(task) => PlanLine::Task(task),
                None => PlanLine::Text(line.to_string()),
            })
            .collect();
        Self { lines }
    }

    pub fn render(&self) -> String {
        let mut buf = String::new();
        for line in &self.lines {
            match line {
                PlanLine::Task(task) => buf.push_str(&task.render()),
                PlanLine::Text(text) => buf.push_str(text),
            }
            buf.push('\n');
        }
        buf
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.lines.iter().filter_map(|line| match line {
            PlanLine::Task(task) => Some(task),
            PlanLine::Text(_) => None,
        })
    }

    pub fn find(&self, id: &TaskId) -> Option<&Task> {
        self.tasks().find(|task| &task.id == id)
    }

    /// Set a task's status. Returns false if the id is unknown.
    pub fn set_status(&mut self, id: &TaskId, status: TaskStatus) -> bool {
        for line in &mut self.lines {
            if let PlanLine::Task(task) = line
                && &task.id == id
            {
                task.status = status;
                return true;
            }
        }
        false
    }

    /// Append a task row at the end of the file.
    pub fn append_task(&mut self, task: Task) {
        self.lines.push(PlanLine::Task(task));
    }

    pub fn pending_count(&self) -> usize {
        self.tasks()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    pub fn done_count(&self) -> usize {
        self.tasks().filter(|t| t.status == TaskStatus::Done).count()
    }

    pub fn task_ids(&self) -> BTreeSet<String> {
        self.tasks().map(|t| t.id.to_string()).collect()
    }

    pub fn structural_task_ids(&self) -> BTreeSet<String> {
        self.tasks()
            .filter(|t| t.id.kind.is_structural())
            .map(|t| t.id.to_string())
            .collect()
    }

    /// Pick the next pending task in executor priority order:
    /// `BUILD-*` → `INT-*` → routine `Task N.M`. Routine tasks whose
    /// description names a credential action are excluded (they are marked
    /// `[U]` by the executor sweep, not run). `FIX`/`REG` are scheduled by
    /// the test scheduler and `IMPL`/`SVC` inside service readiness, so
    /// none of those are selected here.
    pub fn next_task(&self) -> Option<&Task> {
        for wanted in [TaskKind::Build, TaskKind::Integration, TaskKind::Routine] {
            let found = self.tasks().find(|t| {
                t.status == TaskStatus::Pending
                    && t.id.kind == wanted
                    && !(wanted == TaskKind::Routine && is_credential_task(&t.description))
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Pending `FIX`/`REG` tasks, in file order (the scheduler drains these).
    pub fn pending_fix_tasks(&self) -> Vec<&Task> {
        self.tasks()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && matches!(t.id.kind, TaskKind::Fix | TaskKind::Regression)
            })
            .collect()
    }

    /// Compact progress snapshot used by the executor to decide whether an
    /// implementation attempt changed anything.
    pub fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot {
            pending: self.pending_count(),
            done: self.done_count(),
            task_ids: self.task_ids(),
        }
    }
}

/// Point-in-time view of the plan for progress comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSnapshot {
    pub pending: usize,
    pub done: usize,
    pub task_ids: BTreeSet<String>,
}

impl PlanSnapshot {
    /// True when `after` shows forward movement relative to `self`:
    /// fewer pending tasks, more done tasks, or newly created tasks.
    pub fn progressed_to(&self, after: &PlanSnapshot) -> bool {
        after.pending < self.pending
            || after.done > self.done
            || after.task_ids.difference(&self.task_ids).next().is_some()
    }
}

fn parse_task_line(line: &str) -> Option<Task> {
    let caps = TASK_LINE.captures(line)?;
    let marker = caps[1].chars().next()?;
    let status = TaskStatus::from_marker(marker)?;
    let id = TaskId::parse(caps[2].trim())?;
    Some(Task {
        id,
        status,
        description: caps[3].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Implementation Plan

## Tasks

- [ ] Task 1.1: Scaffold the project
- [x] Task 1.2: Wire the API client
- [ ] BUILD-1: Add a login form
- [B] INT-2: Connect the payment webhook
- [ ] Task 2.1: Configure the OAuth secret for staging
- [ ] SVC-backend: Start the backend container
";

    #[test]
    fn parse_render_round_trips() {
        let plan = Plan::parse(SAMPLE);
        assert_eq!(plan.render(), SAMPLE);
    }

    #[test]
    fn typed_prefixes_parse_to_kinds() {
        let plan = Plan::parse(SAMPLE);
        let kinds: Vec<TaskKind> = plan.tasks().map(|t| t.id.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TaskKind::Routine,
                TaskKind::Routine,
                TaskKind::Build,
                TaskKind::Integration,
                TaskKind::Routine,
                TaskKind::Service,
            ]
        );
    }

    #[test]
    fn selection_prefers_build_over_routine() {
        let plan = Plan::parse(SAMPLE);
        let next = plan.next_task().expect("pending task");
        assert_eq!(next.id.as_str(), "BUILD-1");
    }

    #[test]
    fn selection_skips_credential_routine_tasks() {
        let text = "- [ ] Task 2.1: Configure the OAuth secret for staging\n";
        let plan = Plan::parse(text);
        assert!(plan.next_task().is_none());
        assert!(is_credential_task("Configure the OAuth secret for staging"));
    }

    #[test]
    fn selection_never_picks_service_or_fix_kinds() {
        let text = "- [ ] SVC-api: Start api\n- [ ] FIX-BT-1: Repair test\n";
        let plan = Plan::parse(text);
        assert!(plan.next_task().is_none());
        assert_eq!(plan.pending_fix_tasks().len(), 1);
    }

    #[test]
    fn set_status_and_counts() {
        let mut plan = Plan::parse(SAMPLE);
        let id = TaskId::parse("BUILD-1").expect("id");
        assert!(plan.set_status(&id, TaskStatus::Done));
        assert_eq!(plan.done_count(), 2);
        assert!(!plan.set_status(&TaskId::parse("BUILD-99").expect("id"), TaskStatus::Done));
    }

    #[test]
    fn snapshot_detects_new_tasks_as_progress() {
        let mut plan = Plan::parse(SAMPLE);
        let before = plan.snapshot();
        plan.append_task(Task::pending(
            TaskId::derived(TaskKind::Fix, "BT-3"),
            "Repair the failing flow",
        ));
        let after = plan.snapshot();
        assert!(before.progressed_to(&after));
        assert!(!after.progressed_to(&before.clone()));
    }

    #[test]
    fn snapshot_without_change_is_not_progress() {
        let plan = Plan::parse(SAMPLE);
        assert!(!plan.snapshot().progressed_to(&plan.snapshot()));
    }

    #[test]
    fn unknown_prefixes_stay_as_text() {
        let text = "- [ ] WAT-1: Unknown kind\n- [?] BUILD-2: Bad marker\n";
        let plan = Plan::parse(text);
        assert_eq!(plan.tasks().count(), 0);
        assert_eq!(plan.render(), text);
    }

    #[test]
    fn structural_ids_cover_svc_int_arch_prep() {
        let text = "\
- [ ] SVC-a: s
- [ ] INT-b: i
- [ ] ARCH-c: a
- [ ] PREP-d: p
- [ ] BUILD-e: b
";
        let plan = Plan::parse(text);
        let ids = plan.structural_task_ids();
        assert_eq!(ids.len(), 4);
        assert!(!ids.contains("BUILD-e"));
    }
}
