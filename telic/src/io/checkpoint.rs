//! Between-epic checkpoint: the one place the loop waits for a human.
//!
//! The summary goes to the terminal and a single reply line is awaited on a
//! helper thread; silence past the configured timeout auto-proceeds. This
//! is a strategic checkpoint, not a tactical pause — the loop never blocks
//! on a human anywhere else.

use std::io::BufRead;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::core::epic::CheckpointDecision;

/// Abstraction over the checkpoint conversation; tests script replies.
pub trait CheckpointPrompter {
    /// Present `summary` and wait up to `timeout` for a decision.
    fn ask(&self, summary: &str, timeout: Duration) -> Result<CheckpointDecision>;
}

/// Terminal prompter reading one line from stdin.
pub struct StdinCheckpoint;

impl CheckpointPrompter for StdinCheckpoint {
    fn ask(&self, summary: &str, timeout: Duration) -> Result<CheckpointDecision> {
        eprintln!("{summary}");
        eprintln!("[p]roceed (default) / [a]djust <notes> / [s]top — auto-proceed in {}s", timeout.as_secs());

        let (tx, rx) = mpsc::channel();
        // Reader thread is detached on timeout; one stray line on a dead
        // channel is harmless.
        thread::spawn(move || {
            let mut line = String::new();
            if std::io::stdin().lock().read_line(&mut line).is_ok() {
                let _ = tx.send(line);
            }
        });

        match rx.recv_timeout(timeout) {
            Ok(line) => Ok(CheckpointDecision::parse(&line)),
            Err(_) => {
                info!(timeout_secs = timeout.as_secs(), "checkpoint timed out, auto-proceed");
                Ok(CheckpointDecision::Proceed)
            }
        }
    }
}
