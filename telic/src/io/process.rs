//! Child-process execution with wall-clock timeouts and bounded capture.
//!
//! Sub-agents and external runners are opaque children: the orchestrator
//! feeds stdin, bounds the wall clock, and drains both output streams on
//! reader threads so a chatty child can never deadlock the pipe.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Grace period between SIGTERM and SIGKILL for a timed-out child.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Captured child output. Streams are truncated in memory beyond the
/// configured limit; `truncated_bytes` records how much was dropped.
#[derive(Debug)]
pub struct Captured {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated_bytes: usize,
    pub stderr_truncated_bytes: usize,
    pub timed_out: bool,
}

impl Captured {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }
}

/// Run `cmd` to completion or `timeout`, feeding `stdin` and capturing up
/// to `output_limit_bytes` of each stream. A timed-out child gets SIGTERM,
/// a grace period, then SIGKILL; its partial output is retained.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_captured(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<Captured> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = cmd.spawn().context("spawn child process")?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading stdin breaks the pipe; that is
        // its prerogative, not an orchestrator error.
        let _ = child_stdin.write_all(input);
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_reader = thread::spawn(move || drain_limited(stdout, output_limit_bytes));
    let stderr_reader = thread::spawn(move || drain_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for child")? {
        Some(status) => Some(status),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "child timed out, terminating");
            timed_out = true;
            terminate(&mut child)?;
            None
        }
    };

    let (stdout, stdout_truncated_bytes) = join_reader(stdout_reader)?;
    let (stderr, stderr_truncated_bytes) = join_reader(stderr_reader)?;

    if stdout_truncated_bytes > 0 || stderr_truncated_bytes > 0 {
        warn!(
            stdout_truncated_bytes,
            stderr_truncated_bytes, "child output truncated"
        );
    }
    debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, "child finished");

    Ok(Captured {
        status,
        stdout,
        stderr,
        stdout_truncated_bytes,
        stderr_truncated_bytes,
        timed_out,
    })
}

/// SIGTERM, wait out the grace period, then SIGKILL.
fn terminate(child: &mut Child) -> Result<()> {
    let pid = Pid::from_raw(i32::try_from(child.id()).unwrap_or(i32::MAX));
    if let Err(err) = kill(pid, Signal::SIGTERM) {
        debug!(%err, "SIGTERM failed (child likely already gone)");
    }
    match child.wait_timeout(KILL_GRACE).context("wait after SIGTERM")? {
        Some(_) => Ok(()),
        None => {
            warn!("child ignored SIGTERM, killing");
            child.kill().context("kill child")?;
            child.wait().context("wait after kill")?;
            Ok(())
        }
    }
}

fn join_reader(handle: thread::JoinHandle<Result<(String, usize)>>) -> Result<(String, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

fn drain_limited<R: Read>(mut reader: R, limit: usize) -> Result<(String, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read child output")?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        let take = n.min(room);
        kept.extend_from_slice(&chunk[..take]);
        dropped += n - take;
    }
    Ok((String::from_utf8_lossy(&kept).into_owned(), dropped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let captured =
            run_captured(cmd, None, Duration::from_secs(5), 10_000).expect("run");
        assert!(captured.success());
        assert_eq!(captured.stdout.trim(), "out");
        assert_eq!(captured.stderr.trim(), "err");
        assert_eq!(captured.exit_code(), Some(0));
    }

    #[test]
    fn feeds_stdin_to_the_child() {
        let cmd = Command::new("cat");
        let captured =
            run_captured(cmd, Some(b"hello"), Duration::from_secs(5), 10_000).expect("run");
        assert_eq!(captured.stdout, "hello");
    }

    #[test]
    fn timeout_kills_and_flags_the_child() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo partial; sleep 30"]);
        let captured =
            run_captured(cmd, None, Duration::from_millis(200), 10_000).expect("run");
        assert!(captured.timed_out);
        assert!(!captured.success());
        // Partial output before the kill is retained.
        assert_eq!(captured.stdout.trim(), "partial");
    }

    #[test]
    fn output_beyond_the_limit_is_dropped_not_fatal() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'abcdefghij'"]);
        let captured = run_captured(cmd, None, Duration::from_secs(5), 4).expect("run");
        assert_eq!(captured.stdout, "abcd");
        assert_eq!(captured.stdout_truncated_bytes, 6);
    }

    #[test]
    fn nonzero_exit_is_reported_not_an_error() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        let captured = run_captured(cmd, None, Duration::from_secs(5), 1000).expect("run");
        assert!(!captured.success());
        assert_eq!(captured.exit_code(), Some(3));
    }
}
