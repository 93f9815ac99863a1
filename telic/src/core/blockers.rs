//! External-blocker register model for `BLOCKERS.md`.
//!
//! Blockers are items the system cannot resolve itself. `BUILDABLE` is the
//! re-classification escape hatch: a claimed blocker that turns out to be
//! missing product surface becomes a `BUILD-*` task and stops being a
//! blocker.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockerKind {
    /// A secret only a human can supply.
    Credential,
    /// A human must complete an interactive flow.
    Auth,
    /// An external service is unavailable.
    ThirdParty,
    /// Physical hardware is required.
    Hardware,
    /// Re-classified as internal work; no longer a blocker.
    Buildable,
}

impl BlockerKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREDENTIAL" => Some(Self::Credential),
            "AUTH" => Some(Self::Auth),
            "THIRD_PARTY" => Some(Self::ThirdParty),
            "HARDWARE" => Some(Self::Hardware),
            "BUILDABLE" => Some(Self::Buildable),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Credential => "CREDENTIAL",
            Self::Auth => "AUTH",
            Self::ThirdParty => "THIRD_PARTY",
            Self::Hardware => "HARDWARE",
            Self::Buildable => "BUILDABLE",
        }
    }
}

impl fmt::Display for BlockerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockerStatus {
    Open,
    Resolved,
}

impl BlockerStatus {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }
}

/// One register row. `id` ties the blocker to the test or task that hit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocker {
    pub id: String,
    pub kind: BlockerKind,
    pub description: String,
    pub status: BlockerStatus,
}

impl Blocker {
    pub fn open(id: impl Into<String>, kind: BlockerKind, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            description: description.into(),
            status: BlockerStatus::Open,
        }
    }

    fn render(&self) -> String {
        format!(
            "| {} | {} | {} | {} |",
            self.id,
            self.kind,
            self.description,
            self.status.as_str()
        )
    }
}

static ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\|\s*([^|]+?)\s*\|\s*([A-Z_]+)\s*\|\s*([^|]*?)\s*\|\s*(\w+)\s*\|$").unwrap()
});

const HEADER: &str = "| id | class | description | status |";
const SEPARATOR: &str = "|---|---|---|---|";

/// The blocker register: a markdown table, parsed leniently (prose around
/// the table is preserved on render).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockerRegister {
    preamble: Vec<String>,
    rows: Vec<Blocker>,
}

impl BlockerRegister {
    pub fn parse(text: &str) -> Self {
        let mut preamble = Vec::new();
        let mut rows = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed == HEADER || trimmed == SEPARATOR {
                continue;
            }
            match parse_row(trimmed) {
                Some(blocker) => rows.push(blocker),
                None => preamble.push(line.to_string()),
            }
        }
        // Trailing blank preamble lines would multiply across rewrites.
        while preamble.last().is_some_and(|l| l.trim().is_empty()) {
            preamble.pop();
        }
        Self { preamble, rows }
    }

    pub fn render(&self) -> String {
        let mut buf = String::new();
        for line in &self.preamble {
            buf.push_str(line);
            buf.push('\n');
        }
        if !self.preamble.is_empty() {
            buf.push('\n');
        }
        buf.push_str(HEADER);
        buf.push('\n');
        buf.push_str(SEPARATOR);
        buf.push('\n');
        for row in &self.rows {
            buf.push_str(&row.render());
            buf.push('\n');
        }
        buf
    }

    pub fn blockers(&self) -> &[Blocker] {
        &self.rows
    }

    pub fn find(&self, id: &str) -> Option<&Blocker> {
        self.rows.iter().find(|b| b.id == id)
    }

    /// Add a row, replacing any existing row with the same id.
    pub fn upsert(&mut self, blocker: Blocker) {
        match self.rows.iter_mut().find(|b| b.id == blocker.id) {
            Some(existing) => *existing = blocker,
            None => self.rows.push(blocker),
        }
    }

    /// Re-classify a blocker as buildable. Returns the row's description so
    /// the caller can phrase the `BUILD-*` task, or `None` for unknown ids.
    pub fn reclassify_buildable(&mut self, id: &str) -> Option<String> {
        let row = self.rows.iter_mut().find(|b| b.id == id)?;
        row.kind = BlockerKind::Buildable;
        row.status = BlockerStatus::Resolved;
        Some(row.description.clone())
    }

    pub fn open_external_count(&self) -> usize {
        self.rows
            .iter()
            .filter(|b| b.status == BlockerStatus::Open && b.kind != BlockerKind::Buildable)
            .count()
    }
}

fn parse_row(line: &str) -> Option<Blocker> {
    let caps = ROW.captures(line)?;
    Some(Blocker {
        id: caps[1].to_string(),
        kind: BlockerKind::parse(&caps[2])?,
        description: caps[3].to_string(),
        status: BlockerStatus::parse(&caps[4])?,
    })
}
