//! Command executor abstraction over the `git` binary.
//!
//! The [`CommandExecutor`] trait decouples orchestration from the actual
//! version-control engine. Tests use scripted executors that return
//! predetermined results without spawning processes.

use std::fmt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::types::CommandResult;
use crate::error::ExecutionFailure;
use crate::io::process::run_command_with_timeout;

/// Subcommands the orchestration layer is allowed to run. There is no variant
/// for an arbitrary program or shell string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitCommand {
    Add,
    Blame,
    Branch,
    Checkout,
    CherryPick,
    Clone,
    Commit,
    Diff,
    Fetch,
    Init,
    Log,
    Merge,
    MergeBase,
    Pull,
    Push,
    Rebase,
    Remote,
    Reset,
    RevParse,
    Show,
    Stash,
    Status,
    SymbolicRef,
    Tag,
}

impl GitCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Blame => "blame",
            Self::Branch => "branch",
            Self::Checkout => "checkout",
            Self::CherryPick => "cherry-pick",
            Self::Clone => "clone",
            Self::Commit => "commit",
            Self::Diff => "diff",
            Self::Fetch => "fetch",
            Self::Init => "init",
            Self::Log => "log",
            Self::Merge => "merge",
            Self::MergeBase => "merge-base",
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Rebase => "rebase",
            Self::Remote => "remote",
            Self::Reset => "reset",
            Self::RevParse => "rev-parse",
            Self::Show => "show",
            Self::Stash => "stash",
            Self::Status => "status",
            Self::SymbolicRef => "symbolic-ref",
            Self::Tag => "tag",
        }
    }
}

impl fmt::Display for GitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render `git <command> <args..>` for logs and error messages.
pub fn describe(command: GitCommand, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", args.join(" "))
    }
}

/// Abstraction over version-control execution backends.
pub trait CommandExecutor: Send + Sync {
    /// Run one allow-listed subcommand in `workdir`.
    ///
    /// A non-zero exit is a normal result. Only a process that cannot be
    /// started or does not finish within `timeout` is an error.
    fn execute(
        &self,
        workdir: &Path,
        command: GitCommand,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandResult, ExecutionFailure>;
}

/// Executor that spawns the `git` binary.
#[derive(Debug, Clone)]
pub struct GitExecutor {
    binary: String,
    output_limit_bytes: usize,
}

impl GitExecutor {
    pub fn new(binary: impl Into<String>, output_limit_bytes: usize) -> Self {
        Self {
            binary: binary.into(),
            output_limit_bytes,
        }
    }
}

impl CommandExecutor for GitExecutor {
    #[instrument(skip_all, fields(command = %command, workdir = %workdir.display()))]
    fn execute(
        &self,
        workdir: &Path,
        command: GitCommand,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandResult, ExecutionFailure> {
        let label = format!("git {}", describe(command, args));
        let mut cmd = Command::new(&self.binary);
        cmd.arg(command.as_str())
            .args(args)
            .current_dir(workdir)
            // Never block on credential prompts or editors; inspection must not
            // take optional index locks.
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_EDITOR", "true")
            .env("GIT_SEQUENCE_EDITOR", "true")
            .env("GIT_MERGE_AUTOEDIT", "no")
            .env("GIT_OPTIONAL_LOCKS", "0");

        let output = run_command_with_timeout(cmd, &label, timeout, self.output_limit_bytes)?;
        let result = CommandResult {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: output.elapsed,
            stdout_truncated: output.stdout_truncated,
            stderr_truncated: output.stderr_truncated,
        };
        if result.success() {
            debug!(duration_ms = result.duration.as_millis() as u64, "git finished");
        } else {
            warn!(exit_code = ?result.exit_code, "git reported failure");
        }
        Ok(result)
    }
}
