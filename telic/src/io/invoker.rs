//! Sub-agent invocation: the uniform front-end for launching LLM child
//! processes.
//!
//! The invoker renders nothing and decides nothing — callers hand it a
//! fully rendered prompt and get back the captured output plus the parsed
//! `RESULT:` token. Full stdout/stderr is preserved on the returned
//! [`Invocation`] and in the audit directory so downstream fix agents can
//! be given real error evidence.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{AgentRole, ResultToken, scan_result_token};
use crate::io::process::run_captured;

/// Retry backoff schedule in seconds; length fixes the attempt cap.
const BACKOFF_SECS: [u64; 3] = [5, 10, 20];
const MAX_ATTEMPTS: usize = 3;

/// One sub-agent call.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub role: AgentRole,
    /// Fully rendered prompt text, fed to the child on stdin.
    pub prompt: String,
    pub timeout: Duration,
    /// Opaque tool allow-set, forwarded to the child as-is.
    pub allowed_tools: Vec<String>,
    /// Directory label: invocation artifacts land under
    /// `<invocations>/<iteration>-<label>/`.
    pub label: String,
    pub iteration: u32,
}

/// Outcome of a sub-agent call, retries already absorbed.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub token: ResultToken,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Spawn attempts consumed (1 unless retries happened).
    pub attempts: u32,
}

impl Invocation {
    /// Combined output used as evidence for fix agents.
    pub fn evidence(&self) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout);
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr);
        if self.timed_out {
            buf.push_str("\n[invocation timed out]\n");
        }
        buf
    }
}

/// Abstraction over sub-agent execution. The production implementation
/// spawns a child process; tests script outcomes.
pub trait AgentInvoker {
    fn invoke(&self, request: &InvokeRequest) -> Result<Invocation>;
}

/// Invoker that spawns the configured agent command.
pub struct CliAgentInvoker {
    command: Vec<String>,
    workdir: PathBuf,
    invocations_dir: PathBuf,
    output_limit_bytes: usize,
    /// Zeroed in tests so retries do not sleep.
    backoff_enabled: bool,
}

impl CliAgentInvoker {
    pub fn new(
        command: Vec<String>,
        workdir: impl Into<PathBuf>,
        invocations_dir: impl Into<PathBuf>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            invocations_dir: invocations_dir.into(),
            output_limit_bytes,
            backoff_enabled: true,
        }
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn without_backoff(mut self) -> Self {
        self.backoff_enabled = false;
        self
    }

    fn build_command(&self, request: &InvokeRequest) -> Result<Command> {
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..]);
        for tool in &request.allowed_tools {
            cmd.arg("--allowed-tools").arg(tool);
        }
        cmd.current_dir(&self.workdir);
        Ok(cmd)
    }

    fn sleep_backoff(&self, attempt: usize) {
        if !self.backoff_enabled {
            return;
        }
        let secs = BACKOFF_SECS[attempt.min(BACKOFF_SECS.len() - 1)];
        thread::sleep(Duration::from_secs(secs));
    }
}

impl AgentInvoker for CliAgentInvoker {
    #[instrument(skip_all, fields(role = request.role.template_name(), label = %request.label))]
    fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
        let started = Instant::now();
        let mut last_failure = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                self.sleep_backoff(attempt - 1);
                info!(attempt = attempt + 1, "retrying sub-agent");
            }

            let cmd = self.build_command(request)?;
            let captured = run_captured(
                cmd,
                Some(request.prompt.as_bytes()),
                request.timeout,
                self.output_limit_bytes,
            )
            .context("run sub-agent")?;

            let attempts = u32::try_from(attempt).unwrap_or(u32::MAX) + 1;

            if captured.timed_out {
                // A timeout is a synthesised outcome, not a retryable spawn
                // failure: the child's partial effects are already on disk.
                warn!(timeout_secs = request.timeout.as_secs(), "sub-agent timed out");
                let invocation = Invocation {
                    token: ResultToken::BlockedFixable,
                    stdout: captured.stdout,
                    stderr: captured.stderr,
                    exit_code: None,
                    timed_out: true,
                    attempts,
                };
                self.write_artifacts(request, &invocation, started)?;
                return Ok(invocation);
            }

            if captured.success() {
                let token = scan_result_token(&captured.stdout);
                debug!(%token, "sub-agent finished");
                let exit_code = captured.exit_code();
                let invocation = Invocation {
                    token,
                    stdout: captured.stdout,
                    stderr: captured.stderr,
                    exit_code,
                    timed_out: false,
                    attempts,
                };
                self.write_artifacts(request, &invocation, started)?;
                return Ok(invocation);
            }

            warn!(exit_code = ?captured.exit_code(), attempt = attempt + 1, "sub-agent failed");
            let exit_code = captured.exit_code();
            last_failure = Some(Invocation {
                token: ResultToken::Fail,
                stdout: captured.stdout,
                stderr: captured.stderr,
                exit_code,
                timed_out: false,
                attempts,
            });
        }

        // Retries exhausted: persist the final attempt, then surface the
        // failure. Most callers tolerate it and continue.
        if let Some(invocation) = &last_failure {
            self.write_artifacts(request, invocation, started)?;
        }
        Err(anyhow!(
            "sub-agent {} failed after {MAX_ATTEMPTS} attempts",
            request.role.template_name()
        ))
    }
}

impl CliAgentInvoker {
    fn write_artifacts(
        &self,
        request: &InvokeRequest,
        invocation: &Invocation,
        started: Instant,
    ) -> Result<()> {
        let dir = self
            .invocations_dir
            .join(format!("{:04}-{}", request.iteration, request.label));
        write_invocation_record(&dir, request, invocation, started.elapsed())
    }
}

#[derive(Debug, Serialize)]
struct InvocationMeta<'a> {
    role: &'a str,
    label: &'a str,
    iteration: u32,
    attempts: u32,
    exit_code: Option<i32>,
    timed_out: bool,
    token: ResultToken,
    recorded_at: String,
    duration_ms: u64,
}

/// Write the audit record for one invocation: prompt, both streams, and a
/// small metadata file. Always written, regardless of log level.
pub fn write_invocation_record(
    dir: &Path,
    request: &InvokeRequest,
    invocation: &Invocation,
    duration: Duration,
) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create invocation dir {}", dir.display()))?;
    fs::write(dir.join("prompt.md"), &request.prompt).context("write prompt.md")?;
    fs::write(dir.join("stdout.log"), &invocation.stdout).context("write stdout.log")?;
    fs::write(dir.join("stderr.log"), &invocation.stderr).context("write stderr.log")?;

    let meta = InvocationMeta {
        role: request.role.template_name(),
        label: &request.label,
        iteration: request.iteration,
        attempts: invocation.attempts,
        exit_code: invocation.exit_code,
        timed_out: invocation.timed_out,
        token: invocation.token,
        recorded_at: Utc::now().to_rfc3339(),
        duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
    };
    let mut buf = serde_json::to_string_pretty(&meta).context("serialize invocation meta")?;
    buf.push('\n');
    fs::write(dir.join("meta.json"), buf).context("write meta.json")?;
    Ok(())
}
