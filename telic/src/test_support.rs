//! Test-only scripted doubles for the orchestration seams: sub-agent
//! invoker, service probe, checkpoint prompter, end-to-end runner, and a
//! sprint fixture builder.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::core::epic::CheckpointDecision;
use crate::core::types::{AgentRole, ResultToken};
use crate::io::checkpoint::CheckpointPrompter;
use crate::io::config::ServiceSpec;
use crate::io::invoker::{AgentInvoker, InvokeRequest, Invocation};
use crate::io::services::{ProbeResult, ServiceProbe};
use crate::io::sprint::Sprint;
use crate::scheduler::{E2eResult, E2eRunner};

/// Deterministic RNG for spot-check tests.
pub fn seeded_rng() -> StdRng {
    StdRng::seed_from_u64(42)
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub role: AgentRole,
    pub label: String,
    pub prompt: String,
    /// 1-based order across all calls.
    pub sequence: u32,
}

#[derive(Debug, Clone)]
struct QueuedResult {
    token: ResultToken,
    stdout: String,
}

type Hook = Box<dyn Fn(&ScriptedCall)>;

struct HookEntry {
    role: AgentRole,
    once: bool,
    fired: bool,
    hook: Hook,
}

/// Scripted [`AgentInvoker`]: records every call, fires side-effect hooks,
/// and answers from per-role queues (falling back to a default token).
pub struct ScriptedInvoker {
    default_token: ResultToken,
    role_defaults: Mutex<HashMap<AgentRole, ResultToken>>,
    calls: Mutex<Vec<ScriptedCall>>,
    queues: Mutex<HashMap<AgentRole, VecDeque<QueuedResult>>>,
    hooks: Mutex<Vec<HookEntry>>,
}

impl ScriptedInvoker {
    /// Every unscripted call returns `PASS`.
    pub fn passing() -> Self {
        Self::with_default(ResultToken::Pass)
    }

    /// Every unscripted call returns `FAIL`.
    pub fn failing() -> Self {
        Self::with_default(ResultToken::Fail)
    }

    fn with_default(default_token: ResultToken) -> Self {
        Self {
            default_token,
            role_defaults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            queues: Mutex::new(HashMap::new()),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Fix the fallback token for one role (queues still take precedence).
    pub fn set_role_default(&self, role: AgentRole, token: ResultToken) {
        self.role_defaults.lock().unwrap().insert(role, token);
    }

    /// Queue a token for the next invocation of `role`.
    pub fn queue(&self, role: AgentRole, token: ResultToken) {
        self.queue_with_stdout(role, token, "");
    }

    /// Queue a token plus the stdout the invocation should appear to emit.
    pub fn queue_with_stdout(&self, role: AgentRole, token: ResultToken, stdout: &str) {
        self.queues
            .lock()
            .unwrap()
            .entry(role)
            .or_default()
            .push_back(QueuedResult {
                token,
                stdout: stdout.to_string(),
            });
    }

    /// Run `hook` on every invocation of `role` (builder form).
    pub fn on_role<F: Fn(&ScriptedCall) + 'static>(self, role: AgentRole, hook: F) -> Self {
        self.hooks.lock().unwrap().push(HookEntry {
            role,
            once: false,
            fired: false,
            hook: Box::new(hook),
        });
        self
    }

    /// Run `hook` on the first invocation of `role` only.
    pub fn on_role_once<F: Fn(&ScriptedCall) + 'static>(self, role: AgentRole, hook: F) -> Self {
        self.hooks.lock().unwrap().push(HookEntry {
            role,
            once: true,
            fired: false,
            hook: Box::new(hook),
        });
        self
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl AgentInvoker for ScriptedInvoker {
    fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let call = ScriptedCall {
                role: request.role,
                label: request.label.clone(),
                prompt: request.prompt.clone(),
                sequence: u32::try_from(calls.len()).unwrap_or(u32::MAX) + 1,
            };
            calls.push(call.clone());
            call
        };

        {
            let mut hooks = self.hooks.lock().unwrap();
            for entry in hooks.iter_mut() {
                if entry.role == call.role && !(entry.once && entry.fired) {
                    entry.fired = true;
                    (entry.hook)(&call);
                }
            }
        }

        let queued = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&request.role)
            .and_then(VecDeque::pop_front);
        let (token, stdout) = match queued {
            Some(q) => (q.token, q.stdout),
            None => {
                let token = self
                    .role_defaults
                    .lock()
                    .unwrap()
                    .get(&request.role)
                    .copied()
                    .unwrap_or(self.default_token);
                (token, String::new())
            }
        };

        Ok(Invocation {
            token,
            stdout,
            stderr: String::new(),
            exit_code: Some(0),
            timed_out: false,
            attempts: 1,
        })
    }
}

/// Scripted [`ServiceProbe`] with per-service overrides.
pub struct ScriptedProbe {
    default_up: bool,
    reason: String,
    overrides: HashMap<String, bool>,
}

impl ScriptedProbe {
    pub fn all_up() -> Self {
        Self {
            default_up: true,
            reason: String::new(),
            overrides: HashMap::new(),
        }
    }

    pub fn all_down(reason: &str) -> Self {
        Self {
            default_up: false,
            reason: reason.to_string(),
            overrides: HashMap::new(),
        }
    }

    pub fn with_service(mut self, name: &str, up: bool) -> Self {
        self.overrides.insert(name.to_string(), up);
        self
    }
}

impl ServiceProbe for ScriptedProbe {
    fn probe(&self, service: &ServiceSpec, _timeout: Duration) -> ProbeResult {
        let up = self
            .overrides
            .get(&service.name)
            .copied()
            .unwrap_or(self.default_up);
        if up {
            ProbeResult::Running
        } else {
            ProbeResult::NotRunning {
                reason: self.reason.clone(),
            }
        }
    }
}

/// Scripted checkpoint prompter: replies with a fixed line (or times out
/// into Proceed when `None`) and records the summaries it was shown.
pub struct ScriptedPrompter {
    reply: Option<String>,
    summaries: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn replying(reply: Option<&str>) -> Self {
        Self {
            reply: reply.map(str::to_string),
            summaries: Mutex::new(Vec::new()),
        }
    }

    pub fn last_summary(&self) -> Option<String> {
        self.summaries.lock().unwrap().last().cloned()
    }
}

impl CheckpointPrompter for ScriptedPrompter {
    fn ask(&self, summary: &str, _timeout: Duration) -> Result<CheckpointDecision> {
        self.summaries.lock().unwrap().push(summary.to_string());
        Ok(match &self.reply {
            Some(line) => CheckpointDecision::parse(line),
            None => CheckpointDecision::Proceed,
        })
    }
}

/// Recording [`crate::io::git::Vcs`] double.
pub struct RecordingVcs {
    branch: String,
    commits: Mutex<Vec<String>>,
}

impl RecordingVcs {
    pub fn on_branch(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            commits: Mutex::new(Vec::new()),
        }
    }

    pub fn commits(&self) -> Vec<String> {
        self.commits.lock().unwrap().clone()
    }
}

impl crate::io::git::Vcs for RecordingVcs {
    fn current_branch(&self) -> Result<String> {
        Ok(self.branch.clone())
    }

    fn ensure_branch(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn commit_all(&self, message: &str) -> Result<bool> {
        self.commits.lock().unwrap().push(message.to_string());
        Ok(true)
    }
}

/// End-to-end runner that must never be reached (for suites with no
/// annotated tests).
pub struct NeverE2e;

impl E2eRunner for NeverE2e {
    fn run(&self, _test_dir: &Path, grep: &str) -> Result<E2eResult> {
        panic!("unexpected direct e2e execution for '{grep}'");
    }
}

/// End-to-end runner with a fixed verdict.
pub struct FixedE2e {
    pub passed: bool,
    pub output: String,
}

impl E2eRunner for FixedE2e {
    fn run(&self, _test_dir: &Path, _grep: &str) -> Result<E2eResult> {
        Ok(E2eResult {
            passed: self.passed,
            output: self.output.clone(),
        })
    }
}

/// Sprint fixture rooted in a fresh temp directory with vision and PRD in
/// place.
pub struct TempSprint {
    _temp: tempfile::TempDir,
    pub sprint: Sprint,
}

impl TempSprint {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        std::fs::write(temp.path().join("VISION.md"), "# Vision\n\nShip value.\n")?;
        std::fs::write(temp.path().join("PRD.md"), "# PRD\n\n- it works\n")?;
        let sprint = Sprint::open(temp.path())?;
        sprint.ensure_scaffolding()?;
        Ok(Self { _temp: temp, sprint })
    }

    pub fn root(&self) -> PathBuf {
        self.sprint.paths.root.clone()
    }

    pub fn write(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.sprint.paths.root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn read(&self, relative: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.sprint.paths.root.join(relative))?)
    }
}
