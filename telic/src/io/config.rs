//! Loop configuration stored in the sprint's `loop-config.toml`.
//!
//! Missing file and missing fields default to sensible values; recognised
//! `TELIC_*` environment variables override the file. The resolved record
//! is passed by value through every component — no component reads the
//! process environment itself.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Attempt caps and loop bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_task_attempts: u32,
    pub max_test_fix_attempts: u32,
    pub max_consecutive_blocked: u32,
    /// Outer fingerprint-based no-progress bound.
    pub max_no_progress: u32,
    /// Inner per-task no-progress bound.
    pub max_impl_no_progress: u32,
    pub max_service_attempts: u32,
    pub significant_task_threshold: usize,
    pub max_iterations: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_task_attempts: 3,
            max_test_fix_attempts: 3,
            max_consecutive_blocked: 5,
            max_no_progress: 3,
            max_impl_no_progress: 3,
            max_service_attempts: 3,
            significant_task_threshold: 5,
            max_iterations: 100,
        }
    }
}

/// Per-role wall-clock budgets, explicit and non-overlapping: the
/// test-runner budget never nests inside the fix budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub agent_secs: u64,
    pub test_runner_secs: u64,
    pub fix_secs: u64,
    pub e2e_secs: u64,
    /// Seconds to wait for one service health probe.
    pub service_timeout_secs: u64,
    pub epic_feedback_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            agent_secs: 300,
            test_runner_secs: 120,
            fix_secs: 300,
            e2e_secs: 600,
            service_timeout_secs: 30,
            epic_feedback_secs: 300,
        }
    }
}

impl Timeouts {
    pub fn agent(&self) -> Duration {
        Duration::from_secs(self.agent_secs)
    }

    pub fn test_runner(&self) -> Duration {
        Duration::from_secs(self.test_runner_secs)
    }

    pub fn fix(&self) -> Duration {
        Duration::from_secs(self.fix_secs)
    }

    pub fn e2e(&self) -> Duration {
        Duration::from_secs(self.e2e_secs)
    }

    pub fn service(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }

    pub fn epic_feedback(&self) -> Duration {
        Duration::from_secs(self.epic_feedback_secs)
    }
}

/// Regression-check cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Regression {
    /// Full sweep after this many fixes.
    pub check_interval: u32,
    /// Per-iteration spot-check probability, percent.
    pub spot_check_probability: u32,
    /// Tests sampled per spot check.
    pub spot_check_count: usize,
}

impl Default for Regression {
    fn default() -> Self {
        Self {
            check_interval: 5,
            spot_check_probability: 10,
            spot_check_count: 2,
        }
    }
}

/// How to launch the LLM agent child process and where prompts live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Agent {
    pub command: Vec<String>,
    /// Prompt template directory, relative to the sprint root.
    pub prompt_dir: String,
    /// Injected verbatim into test-runner prompts.
    pub test_runner_preamble: String,
    /// Tool allow-set forwarded to every sub-agent, opaque to the core.
    pub allowed_tools: Vec<String>,
    /// Truncate captured agent output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for Agent {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            prompt_dir: "prompts".to_string(),
            test_runner_preamble: String::new(),
            allowed_tools: Vec::new(),
            output_limit_bytes: 200_000,
        }
    }
}

/// External end-to-end runner invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct E2e {
    /// Directory the runner is launched in, relative to the sprint root.
    pub test_dir: String,
    pub command: Vec<String>,
}

impl Default for E2e {
    fn default() -> Self {
        Self {
            test_dir: "e2e".to_string(),
            command: vec![
                "npx".to_string(),
                "playwright".to_string(),
                "test".to_string(),
            ],
        }
    }
}

/// One declared service the vision requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub port: u16,
    /// HTTP health path; when absent the probe falls back to a TCP connect.
    #[serde(default)]
    pub health_path: Option<String>,
    /// Custom probe command; overrides HTTP/TCP when present.
    #[serde(default)]
    pub probe_command: Option<Vec<String>>,
    /// Directory that would hold the service's code; used to classify a
    /// down service as greenfield vs brownfield.
    #[serde(default)]
    pub code_dir: Option<String>,
}

fn default_services() -> Vec<ServiceSpec> {
    vec![
        ServiceSpec {
            name: "backend".to_string(),
            port: 8000,
            health_path: Some("/health".to_string()),
            probe_command: None,
            code_dir: Some("backend".to_string()),
        },
        ServiceSpec {
            name: "frontend".to_string(),
            port: 3000,
            health_path: Some("/".to_string()),
            probe_command: None,
            code_dir: Some("frontend".to_string()),
        },
        ServiceSpec {
            name: "browser-cdp".to_string(),
            port: 9222,
            health_path: Some("/json/version".to_string()),
            probe_command: None,
            code_dir: None,
        },
    ]
}

/// The resolved per-sprint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub limits: Limits,
    pub timeouts: Timeouts,
    pub regression: Regression,
    pub agent: Agent,
    pub e2e: E2e,
    pub services: Vec<ServiceSpec>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            timeouts: Timeouts::default(),
            regression: Regression::default(),
            agent: Agent::default(),
            e2e: E2e::default(),
            services: default_services(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_iterations == 0 {
            return Err(anyhow!("limits.max_iterations must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.regression.spot_check_probability > 100 {
            return Err(anyhow!("regression.spot_check_probability is a percentage"));
        }
        if self.timeouts.agent_secs == 0 || self.timeouts.test_runner_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        Ok(())
    }

    /// Apply recognised `TELIC_*` overrides. Unknown variables are ignored;
    /// unparseable values for recognised variables are errors.
    pub fn apply_env(&mut self, vars: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in vars {
            match key.as_str() {
                "TELIC_SERVICE_TIMEOUT" => {
                    self.timeouts.service_timeout_secs = parse_var(key, value)?;
                }
                "TELIC_MAX_TASK_ATTEMPTS" => self.limits.max_task_attempts = parse_var(key, value)?,
                "TELIC_MAX_TEST_FIX_ATTEMPTS" => {
                    self.limits.max_test_fix_attempts = parse_var(key, value)?;
                }
                "TELIC_MAX_CONSECUTIVE_BLOCKED" => {
                    self.limits.max_consecutive_blocked = parse_var(key, value)?;
                }
                "TELIC_MAX_NO_PROGRESS" => self.limits.max_no_progress = parse_var(key, value)?,
                "TELIC_MAX_IMPL_NO_PROGRESS" => {
                    self.limits.max_impl_no_progress = parse_var(key, value)?;
                }
                "TELIC_REGRESSION_CHECK_INTERVAL" => {
                    self.regression.check_interval = parse_var(key, value)?;
                }
                "TELIC_SPOT_CHECK_PROBABILITY" => {
                    self.regression.spot_check_probability = parse_var(key, value)?;
                }
                "TELIC_SPOT_CHECK_COUNT" => {
                    self.regression.spot_check_count = parse_var(key, value)?;
                }
                "TELIC_SIGNIFICANT_TASK_THRESHOLD" => {
                    self.limits.significant_task_threshold = parse_var(key, value)?;
                }
                "TELIC_EPIC_FEEDBACK_TIMEOUT" => {
                    self.timeouts.epic_feedback_secs = parse_var(key, value)?;
                }
                "TELIC_TEST_RUNNER_PREAMBLE" => {
                    self.agent.test_runner_preamble = value.clone();
                }
                "TELIC_E2E_TEST_DIR" => self.e2e.test_dir = value.clone(),
                _ => {
                    if let Some(rest) = key.strip_prefix("TELIC_") {
                        apply_service_override(&mut self.services, rest, key, value)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// `TELIC_<SERVICE>_PORT` / `TELIC_<SERVICE>_HEALTH` overrides for the
/// standard services (`BACKEND`, `FRONTEND`, `BROWSER_CDP`).
fn apply_service_override(
    services: &mut [ServiceSpec],
    rest: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    let Some((service_part, field)) = rest.rsplit_once('_') else {
        return Ok(());
    };
    if field != "PORT" && field != "HEALTH" {
        return Ok(());
    }
    let wanted = service_part.to_ascii_lowercase().replace('_', "-");
    let Some(service) = services.iter_mut().find(|s| s.name == wanted) else {
        return Ok(());
    };
    if field == "PORT" {
        service.port = parse_var(key, value)?;
    } else {
        service.health_path = Some(value.to_string());
    }
    Ok(())
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid value '{value}' for {key}"))
}

/// Load config for a sprint: file (or defaults) + process environment.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    let mut cfg = read_config_file(path)?;
    let vars: BTreeMap<String, String> = std::env::vars()
        .filter(|(k, _)| k.starts_with("TELIC_"))
        .collect();
    cfg.apply_env(&vars)?;
    cfg.validate()?;
    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        return Ok(LoopConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}
