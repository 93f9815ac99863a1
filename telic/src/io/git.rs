//! Thin version-control adapter.
//!
//! Git itself is an external collaborator: the loop only needs the current
//! branch (to refuse protected branches), a work branch, and best-effort
//! commits after productive iterations.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

/// Branches the loop refuses to run on.
const PROTECTED: [&str; 2] = ["main", "master"];

/// Version-control operations the engine depends on.
pub trait Vcs {
    fn current_branch(&self) -> Result<String>;
    /// Create-or-switch to the sprint work branch.
    fn ensure_branch(&self, name: &str) -> Result<()>;
    /// Stage everything and commit. Returns false when there was nothing to
    /// commit.
    fn commit_all(&self, message: &str) -> Result<bool>;
}

/// Fatal-configuration check: never mutate a protected branch.
pub fn refuse_protected(branch: &str) -> Result<()> {
    if PROTECTED.contains(&branch) {
        return Err(anyhow!(
            "refusing to run on protected branch '{branch}' (create a sprint branch first)"
        ));
    }
    Ok(())
}

/// Adapter over the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
}

impl GitCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("run git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Vcs for GitCli {
    fn current_branch(&self) -> Result<String> {
        let out = self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        Ok(name)
    }

    fn ensure_branch(&self, name: &str) -> Result<()> {
        if self.current_branch()? == name {
            return Ok(());
        }
        // -B reuses an existing branch rather than failing on resume.
        self.run(&["checkout", "-B", name])?;
        debug!(branch = %name, "switched to sprint branch");
        Ok(())
    }

    fn commit_all(&self, message: &str) -> Result<bool> {
        self.run(&["add", "-A"])?;
        let staged = self.run(&["status", "--porcelain"])?;
        if staged.trim().is_empty() {
            return Ok(false);
        }
        match self.run(&["commit", "-m", message]) {
            Ok(_) => Ok(true),
            Err(err) => {
                // Commits are best-effort bookkeeping; an unconfigured
                // identity must not stall value delivery.
                warn!(%err, "commit failed");
                Ok(false)
            }
        }
    }
}

/// No-op adapter for sprints outside any repository.
#[derive(Debug, Clone, Default)]
pub struct NoVcs;

impl Vcs for NoVcs {
    fn current_branch(&self) -> Result<String> {
        Ok("(no vcs)".to_string())
    }

    fn ensure_branch(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn commit_all(&self, _message: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Pick the adapter for a sprint root.
pub fn detect(root: &Path) -> Box<dyn Vcs> {
    if root.join(".git").exists() {
        Box::new(GitCli::new(root))
    } else {
        Box::new(NoVcs)
    }
}
