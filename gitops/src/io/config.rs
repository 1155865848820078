//! Orchestrator configuration (`gitops.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Orchestrator configuration (TOML).
///
/// Missing fields take their defaults, so an absent file behaves like an
/// empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitopsConfig {
    /// Path or name of the `git` binary.
    pub git_binary: String,

    /// Per-command wall-clock limit in seconds. The child is killed on expiry.
    pub command_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    /// `max_count` used by `log` when the caller omits it.
    pub default_log_count: u32,

    pub approval: ApprovalConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Deny every gated operation.
    #[default]
    Deny,
    /// Approve every gated operation. Meant for tests and trusted sandboxes.
    Approve,
    /// Ask an external command (see [`ApprovalConfig::command`]).
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ApprovalConfig {
    pub mode: ApprovalMode,

    /// Argv of the approval command. It receives the request as JSON on
    /// stdin; exit code 0 approves, anything else denies.
    pub command: Vec<String>,
}

impl Default for GitopsConfig {
    fn default() -> Self {
        Self {
            git_binary: "git".to_string(),
            command_timeout_secs: 300,
            output_limit_bytes: 1_000_000,
            default_log_count: 10,
            approval: ApprovalConfig::default(),
        }
    }
}

impl GitopsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.git_binary.trim().is_empty() {
            return Err(anyhow!("git_binary must be non-empty"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.default_log_count == 0 {
            return Err(anyhow!("default_log_count must be > 0"));
        }
        if self.approval.mode == ApprovalMode::Command
            && self
                .approval
                .command
                .first()
                .is_none_or(|c| c.trim().is_empty())
        {
            return Err(anyhow!(
                "approval.command must be a non-empty array when approval.mode = \"command\""
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `GitopsConfig::default()`.
pub fn load_config(path: &Path) -> Result<GitopsConfig> {
    if !path.exists() {
        let cfg = GitopsConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: GitopsConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
