//! Progress fingerprinting and the layered stuck detector.
//!
//! There is exactly one detector with two layers. The inner layer watches a
//! single entity (one task, one test) within a phase via its attempt
//! counter; the outer layer watches the cross-phase progress fingerprint.
//! An inner force-block resets the entity's contribution before the outer
//! layer samples, so the two layers never compound on the same cause in the
//! same iteration.

/// Compact cross-phase progress summary:
/// `"<passed_tests>-<blocked_tests>-<done_tasks>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(passed_tests: usize, blocked_tests: usize, done_tasks: usize) -> Self {
        Self(format!("{passed_tests}-{blocked_tests}-{done_tasks}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

/// Outer-layer verdict after recording one iteration's fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckVerdict {
    /// Something changed since the previous iteration.
    Progressing,
    /// Unchanged, but below the no-progress bound.
    Stalling { repeats: u32 },
    /// Unchanged for the configured bound; trigger value discovery.
    Stuck { repeats: u32 },
}

/// Cross-phase stuck tracker. Persisted via its `(fingerprint, repeats)`
/// pair in `LOOP_STATE.md`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StuckTracker {
    last: Option<Fingerprint>,
    repeats: u32,
}

impl StuckTracker {
    pub fn new(last: Option<Fingerprint>, repeats: u32) -> Self {
        Self { last, repeats }
    }

    pub fn last(&self) -> Option<&Fingerprint> {
        self.last.as_ref()
    }

    pub fn repeats(&self) -> u32 {
        self.repeats
    }

    /// Record the fingerprint for one iteration. `extra_progress` marks
    /// change the fingerprint cannot see (remediation-loop file edits,
    /// newly created tasks); any change anywhere counts as progress.
    pub fn record(
        &mut self,
        current: Fingerprint,
        extra_progress: bool,
        max_no_progress: u32,
    ) -> StuckVerdict {
        let unchanged = self.last.as_ref() == Some(&current) && !extra_progress;
        if unchanged {
            self.repeats += 1;
        } else {
            self.repeats = 0;
        }
        self.last = Some(current);

        if self.repeats == 0 {
            StuckVerdict::Progressing
        } else if self.repeats >= max_no_progress {
            StuckVerdict::Stuck {
                repeats: self.repeats,
            }
        } else {
            StuckVerdict::Stalling {
                repeats: self.repeats,
            }
        }
    }

    /// Called after value discovery ran: the next identical fingerprint must
    /// re-accumulate from zero rather than instantly re-trigger.
    pub fn reset_repeats(&mut self) {
        self.repeats = 0;
    }
}
