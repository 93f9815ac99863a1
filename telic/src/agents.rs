//! Shared sub-agent invocation context for the phase drivers.
//!
//! Bundles the sprint, config, invoker, and prompt store so drivers can
//! invoke a role with one call. The standard placeholders (`{SPRINT}`,
//! `{SPRINT_DIR}`) are always bound; drivers add role-specific ones.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;

use crate::core::types::AgentRole;
use crate::io::config::LoopConfig;
use crate::io::invoker::{AgentInvoker, InvokeRequest, Invocation};
use crate::io::prompt::{PromptStore, render};
use crate::io::sprint::Sprint;

/// Everything a driver needs to talk to sub-agents.
pub struct AgentCtx<'a> {
    pub sprint: &'a Sprint,
    pub config: &'a LoopConfig,
    pub invoker: &'a dyn AgentInvoker,
    pub prompts: &'a PromptStore,
}

impl AgentCtx<'_> {
    /// Render the role's template and invoke it. `extra` placeholders are
    /// merged over the standard bindings.
    pub fn invoke(
        &self,
        role: AgentRole,
        label: &str,
        iteration: u32,
        timeout: Duration,
        extra: &[(&'static str, String)],
    ) -> Result<Invocation> {
        let template = self.prompts.load(role)?;
        let mut vars: BTreeMap<&str, String> = BTreeMap::new();
        vars.insert("SPRINT", self.sprint.name.clone());
        vars.insert(
            "SPRINT_DIR",
            self.sprint.paths.root.display().to_string(),
        );
        for (key, value) in extra {
            vars.insert(key, value.clone());
        }
        let prompt = render(&template, &vars);

        self.invoker.invoke(&InvokeRequest {
            role,
            prompt,
            timeout,
            allowed_tools: self.config.agent.allowed_tools.clone(),
            label: label.to_string(),
            iteration,
        })
    }

    /// Invoke with the default per-agent timeout.
    pub fn invoke_default(
        &self,
        role: AgentRole,
        label: &str,
        iteration: u32,
        extra: &[(&'static str, String)],
    ) -> Result<Invocation> {
        self.invoke(role, label, iteration, self.config.timeouts.agent(), extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ResultToken;
    use crate::io::config::LoopConfig;
    use crate::io::prompt::PromptStore;
    use std::fs;
    use std::sync::Mutex;

    struct Recorder {
        prompts: Mutex<Vec<String>>,
    }

    impl AgentInvoker for Recorder {
        fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            Ok(Invocation {
                token: ResultToken::Pass,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
                timed_out: false,
                attempts: 1,
            })
        }
    }

    #[test]
    fn standard_placeholders_are_always_bound() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sprint_dir = temp.path().join("demo");
        fs::create_dir_all(&sprint_dir).expect("mkdir");
        let sprint = Sprint::open(&sprint_dir).expect("open");

        let prompt_dir = temp.path().join("prompts");
        fs::create_dir_all(&prompt_dir).expect("mkdir");
        fs::write(
            prompt_dir.join("preflight.md"),
            "sprint={SPRINT} dir={SPRINT_DIR} extra={TASK}",
        )
        .expect("write");

        let config = LoopConfig::default();
        let prompts = PromptStore::new(&prompt_dir);
        let recorder = Recorder {
            prompts: Mutex::new(Vec::new()),
        };
        let ctx = AgentCtx {
            sprint: &sprint,
            config: &config,
            invoker: &recorder,
            prompts: &prompts,
        };

        ctx.invoke_default(
            AgentRole::Preflight,
            "preflight",
            1,
            &[("TASK", "BUILD-1: do it".to_string())],
        )
        .expect("invoke");

        let recorded = recorder.prompts.lock().unwrap();
        assert!(recorded[0].contains("sprint=demo"));
        assert!(recorded[0].contains(&sprint_dir.display().to_string()));
        assert!(recorded[0].contains("extra=BUILD-1: do it"));
    }
}
