//! Test-plan model: typed test cases parsed from `BETA_TEST_PLAN_v1.md`.
//!
//! Uses the same checkbox line shape as the implementation plan. The two
//! blocked classes get distinct markers: `[U]` blocked-external (a human or
//! the outside world must act) and `[B]` blocked-fixable (buildable inside
//! the sprint).

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Maximum lines in an extracted test block, including the test line itself.
pub const TEST_BLOCK_MAX_LINES: usize = 25;

/// Test category, tagged by identifier prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TestKind {
    /// `BT-*` — UI behaviour.
    Ui,
    /// `INT-*` — real integration.
    Integration,
    /// `VAL-*` — value delivery proof.
    Value,
    /// `UX-*` — heuristic review.
    Ux,
    /// `EDGE-*` — edge case.
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    /// `[ ]`
    Pending,
    /// `[x]`
    Passed,
    /// `[U]`
    BlockedExternal,
    /// `[B]`
    BlockedFixable,
}

impl TestStatus {
    fn marker(self) -> char {
        match self {
            Self::Pending => ' ',
            Self::Passed => 'x',
            Self::BlockedExternal => 'U',
            Self::BlockedFixable => 'B',
        }
    }

    fn from_marker(c: char) -> Option<Self> {
        match c {
            ' ' => Some(Self::Pending),
            'x' => Some(Self::Passed),
            'U' => Some(Self::BlockedExternal),
            'B' => Some(Self::BlockedFixable),
            _ => None,
        }
    }
}

/// Typed test identifier (`BT-3`, `EDGE-1`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TestId {
    pub kind: TestKind,
    raw: String,
}

impl TestId {
    pub fn parse(raw: &str) -> Option<Self> {
        let (prefix, rest) = raw.split_once('-')?;
        if rest.is_empty() {
            return None;
        }
        let kind = match prefix {
            "BT" => TestKind::Ui,
            "INT" => TestKind::Integration,
            "VAL" => TestKind::Value,
            "UX" => TestKind::Ux,
            "EDGE" => TestKind::Edge,
            _ => return None,
        };
        Some(Self {
            kind,
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One test row plus its extracted block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub id: TestId,
    pub status: TestStatus,
    pub description: String,
}

static TEST_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^- \[(.)\] ([A-Z]+-[^:]+): (.*)$").unwrap());

static E2E_ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\(E2E:\s*"([^"]+)"\)"#).unwrap());

static HEADING_OR_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6} |---\s*$|\*\*\*\s*$)").unwrap());

/// Direct-execution annotation extracted from a test block: the quoted name
/// is handed to the external end-to-end runner as a grep filter.
pub fn e2e_annotation(block: &str) -> Option<String> {
    E2E_ANNOTATION
        .captures(block)
        .map(|caps| caps[1].to_string())
}

/// The full test-plan file. Like [`super::plan::Plan`], parsing is lossless.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestPlan {
    lines: Vec<String>,
}

impl TestPlan {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    pub fn render(&self) -> String {
        let mut buf = self.lines.join("\n");
        buf.push('\n');
        buf
    }

    pub fn tests(&self) -> Vec<TestCase> {
        self.lines
            .iter()
            .filter_map(|line| parse_test_line(line))
            .collect()
    }

    pub fn find(&self, id: &TestId) -> Option<TestCase> {
        self.tests().into_iter().find(|t| &t.id == id)
    }

    /// Set a test's status marker in place. Returns false for unknown ids.
    pub fn set_status(&mut self, id: &TestId, status: TestStatus) -> bool {
        for line in &mut self.lines {
            if let Some(test) = parse_test_line(line)
                && &test.id == id
            {
                let rendered = format!(
                    "- [{}] {}: {}",
                    status.marker(),
                    test.id,
                    test.description
                );
                *line = rendered;
                return true;
            }
        }
        false
    }

    /// Extract the test block: up to [`TEST_BLOCK_MAX_LINES`] consecutive
    /// lines starting at the test's own line, terminated early by another
    /// test line, a markdown heading, or a horizontal rule.
    pub fn extract_block(&self, id: &TestId) -> Option<String> {
        let start = self.lines.iter().position(|line| {
            parse_test_line(line).is_some_and(|test| &test.id == id)
        })?;

        let mut block = vec![self.lines[start].clone()];
        for line in self.lines.iter().skip(start + 1) {
            if block.len() >= TEST_BLOCK_MAX_LINES
                || parse_test_line(line).is_some()
                || HEADING_OR_RULE.is_match(line)
            {
                break;
            }
            block.push(line.clone());
        }
        Some(block.join("\n"))
    }

    pub fn pending_count(&self) -> usize {
        self.count(TestStatus::Pending)
    }

    pub fn passed_count(&self) -> usize {
        self.count(TestStatus::Passed)
    }

    /// Blocked tests of either class.
    pub fn blocked_count(&self) -> usize {
        self.count(TestStatus::BlockedExternal) + self.count(TestStatus::BlockedFixable)
    }

    fn count(&self, status: TestStatus) -> usize {
        self.tests().iter().filter(|t| t.status == status).count()
    }

    pub fn passed_tests(&self) -> Vec<TestCase> {
        self.tests()
            .into_iter()
            .filter(|t| t.status == TestStatus::Passed)
            .collect()
    }

    /// First pending test whose attempt counter is below the cap. Returns
    /// `None` with `all_capped = true` when pending tests exist but every
    /// one has exhausted its budget.
    pub fn next_pending(
        &self,
        attempts: impl Fn(&TestId) -> u32,
        max_attempts: u32,
    ) -> PendingSelection {
        let pending: Vec<TestCase> = self
            .tests()
            .into_iter()
            .filter(|t| t.status == TestStatus::Pending)
            .collect();
        if pending.is_empty() {
            return PendingSelection::NonePending;
        }
        match pending
            .iter()
            .find(|t| attempts(&t.id) < max_attempts)
            .cloned()
        {
            Some(test) => PendingSelection::Selected(test),
            None => PendingSelection::AllCapped(pending),
        }
    }
}

/// Outcome of pending-test selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingSelection {
    /// No pending tests remain.
    NonePending,
    /// The first eligible pending test.
    Selected(TestCase),
    /// Pending tests exist but all are at the attempt cap.
    AllCapped(Vec<TestCase>),
}

fn parse_test_line(line: &str) -> Option<TestCase> {
    let caps = TEST_LINE.captures(line)?;
    let marker = caps[1].chars().next()?;
    let status = TestStatus::from_marker(marker)?;
    let id = TestId::parse(caps[2].trim())?;
    Some(TestCase {
        id,
        status,
        description: caps[3].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Beta Test Plan v1

## UI

- [ ] BT-1: Landing page renders (E2E: \"landing renders\")
      Open the site root.
      Expect the hero headline.
- [x] BT-2: Signup form validates
      Submit an empty form.

---

## Value

- [U] VAL-1: Operator sees revenue total
- [B] EDGE-1: Empty dataset shows guidance
";

    #[test]
    fn parse_render_round_trips() {
        let plan = TestPlan::parse(SAMPLE);
        assert_eq!(plan.render(), SAMPLE);
    }

    #[test]
    fn statuses_map_to_markers() {
        let plan = TestPlan::parse(SAMPLE);
        let tests = plan.tests();
        assert_eq!(tests.len(), 4);
        assert_eq!(tests[0].status, TestStatus::Pending);
        assert_eq!(tests[1].status, TestStatus::Passed);
        assert_eq!(tests[2].status, TestStatus::BlockedExternal);
        assert_eq!(tests[3].status, TestStatus::BlockedFixable);
    }

    #[test]
    fn block_extraction_stops_at_next_test() {
        let plan = TestPlan::parse(SAMPLE);
        let id = TestId::parse("BT-1").expect("id");
        let block = plan.extract_block(&id).expect("block");
        assert!(block.contains("hero headline"));
        assert!(!block.contains("BT-2"));
    }

    #[test]
    fn block_extraction_stops_at_rule_and_heading() {
        let plan = TestPlan::parse(SAMPLE);
        let id = TestId::parse("BT-2").expect("id");
        let block = plan.extract_block(&id).expect("block");
        assert!(block.contains("empty form"));
        assert!(!block.contains("## Value"));
        assert!(!block.contains("---"));
    }

    #[test]
    fn block_extraction_caps_at_25_lines() {
        let mut text = String::from("- [ ] BT-9: Long block\n");
        for i in 0..40 {
            text.push_str(&format!("      step {i}\n"));
        }
        let plan = TestPlan::parse(&text);
        let block = plan
            .extract_block(&TestId::parse("BT-9").expect("id"))
            .expect("block");
        assert_eq!(block.lines().count(), TEST_BLOCK_MAX_LINES);
    }

    #[test]
    fn e2e_annotation_found_in_block() {
        let plan = TestPlan::parse(SAMPLE);
        let block = plan
            .extract_block(&TestId::parse("BT-1").expect("id"))
            .expect("block");
        assert_eq!(e2e_annotation(&block).as_deref(), Some("landing renders"));
        assert_eq!(e2e_annotation("no annotation here"), None);
    }

    #[test]
    fn next_pending_respects_attempt_cap() {
        let plan = TestPlan::parse(SAMPLE);
        let selected = plan.next_pending(|_| 0, 3);
        match selected {
            PendingSelection::Selected(test) => assert_eq!(test.id.as_str(), "BT-1"),
            other => panic!("unexpected selection {other:?}"),
        }

        let capped = plan.next_pending(|_| 3, 3);
        assert!(matches!(capped, PendingSelection::AllCapped(tests) if tests.len() == 1));
    }

    #[test]
    fn next_pending_reports_none_when_no_pending() {
        let mut plan = TestPlan::parse(SAMPLE);
        plan.set_status(&TestId::parse("BT-1").expect("id"), TestStatus::Passed);
        assert_eq!(plan.next_pending(|_| 0, 3), PendingSelection::NonePending);
    }

    #[test]
    fn set_status_rewrites_only_the_marker() {
        let mut plan = TestPlan::parse(SAMPLE);
        let id = TestId::parse("BT-1").expect("id");
        assert!(plan.set_status(&id, TestStatus::Passed));
        let rendered = plan.render();
        assert!(rendered.contains("- [x] BT-1: Landing page renders (E2E: \"landing renders\")"));
    }

    #[test]
    fn counts_cover_both_blocked_classes() {
        let plan = TestPlan::parse(SAMPLE);
        assert_eq!(plan.pending_count(), 1);
        assert_eq!(plan.passed_count(), 1);
        assert_eq!(plan.blocked_count(), 2);
    }
}
