//! Test helpers: throwaway repositories and scripted seams.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::approval::{ApprovalOracle, ApprovalRequest};
use crate::core::types::{CommandResult, Decision, RepositoryHandle, RepositoryStatus};
use crate::error::{ExecutionFailure, OpError};
use crate::io::executor::{CommandExecutor, GitCommand, GitExecutor, describe};
use crate::io::inspector::Inspector;

/// A git repository in a temp dir with one commit (`README.md`) on `main`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("tempdir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.configure()?;
        repo.write_file("README.md", "# test\n")?;
        repo.commit_all("initial")?;
        Ok(repo)
    }

    /// Clone `origin` into a new temp dir.
    pub fn clone_from(origin: &Path) -> Result<Self> {
        let dir = tempfile::tempdir().context("tempdir")?;
        let origin = origin
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 path {}", origin.display()))?;
        run_git(dir.path(), &["clone", "-q", origin, "."])?;
        let repo = Self { dir };
        repo.configure()?;
        Ok(repo)
    }

    fn configure(&self) -> Result<()> {
        self.git(&["config", "user.name", "Test User"])?;
        self.git(&["config", "user.email", "test@example.com"])?;
        self.git(&["config", "commit.gpgsign", "false"])?;
        self.git(&["config", "tag.gpgsign", "false"])?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Run git in the repository; non-zero exit is an error.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        run_git(self.path(), args)
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", message])?;
        Ok(())
    }

    pub fn head(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Make `main` and `feature` change the same line of `file`, leaving
    /// `main` checked out. Merging `feature` then conflicts.
    pub fn diverge_same_line(&self, file: &str) -> Result<()> {
        self.write_file(file, "base\n")?;
        self.commit_all("base")?;
        self.git(&["checkout", "-q", "-b", "feature"])?;
        self.write_file(file, "feature\n")?;
        self.commit_all("feature change")?;
        self.git(&["checkout", "-q", "main"])?;
        self.write_file(file, "main\n")?;
        self.commit_all("main change")?;
        Ok(())
    }

    /// Create a bare repository, register it as `origin` and push `main`.
    pub fn add_bare_origin(&self) -> Result<TempDir> {
        let bare = tempfile::tempdir().context("tempdir")?;
        run_git(bare.path(), &["init", "-q", "--bare"])?;
        run_git(bare.path(), &["symbolic-ref", "HEAD", "refs/heads/main"])?;
        let url = bare
            .path()
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 path {}", bare.path().display()))?;
        self.git(&["remote", "add", "origin", url])?;
        self.git(&["push", "-q", "origin", "main"])?;
        Ok(bare)
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_EDITOR", "true")
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// A canned executor response.
#[derive(Debug, Clone)]
pub enum Scripted {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    SpawnFailure,
}

impl Scripted {
    pub fn ok(stdout: &str) -> Self {
        Self::exit(0, stdout, "")
    }

    pub fn exit(code: i32, stdout: &str, stderr: &str) -> Self {
        Self::Exit {
            code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }
}

/// Executor that replays [`Scripted`] responses in order and records calls.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<(GitCommand, Vec<String>)>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(GitCommand, Vec<String>)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let remaining = self.script.lock().unwrap_or_else(PoisonError::into_inner).len();
        if remaining > 0 {
            bail!("{remaining} scripted response(s) not consumed");
        }
        Ok(())
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn execute(
        &self,
        _workdir: &Path,
        command: GitCommand,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandResult, ExecutionFailure> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((command, args.to_vec()));
        let label = format!("git {}", describe(command, args));
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(Scripted::Exit {
                code,
                stdout,
                stderr,
            }) => Ok(CommandResult {
                exit_code: Some(code),
                stdout,
                stderr,
                duration: Duration::from_millis(1),
                stdout_truncated: 0,
                stderr_truncated: 0,
            }),
            Some(Scripted::TimedOut) => Err(ExecutionFailure::TimedOut {
                command: label,
                timeout,
            }),
            Some(Scripted::SpawnFailure) => Err(ExecutionFailure::Spawn {
                command: label,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted"),
            }),
            None => Err(ExecutionFailure::Wait {
                command: label,
                message: "script exhausted".to_string(),
            }),
        }
    }
}

/// Real [`GitExecutor`] that records each subcommand it runs.
pub struct RecordingExecutor {
    inner: GitExecutor,
    commands: Mutex<Vec<GitCommand>>,
}

impl RecordingExecutor {
    pub fn new(git_binary: &str) -> Self {
        Self {
            inner: GitExecutor::new(git_binary, 1_000_000),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self, command: GitCommand) -> usize {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| **c == command)
            .count()
    }

    pub fn total(&self) -> usize {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(
        &self,
        workdir: &Path,
        command: GitCommand,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandResult, ExecutionFailure> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
        self.inner.execute(workdir, command, args, timeout)
    }
}

/// A clean status on `main`.
pub fn clean_status() -> RepositoryStatus {
    RepositoryStatus {
        current_branch: Some("main".to_string()),
        head: Some("0".repeat(40)),
        is_dirty: false,
        conflicted_paths: Default::default(),
        in_progress_operation: Default::default(),
        stash_entries: Vec::new(),
    }
}

/// Inspector for one fixed repository. Queued statuses are returned first,
/// then the current fallback status.
pub struct StaticInspector {
    handle: RepositoryHandle,
    queued: Mutex<VecDeque<RepositoryStatus>>,
    fallback: Mutex<RepositoryStatus>,
    fast_forward: Mutex<bool>,
}

impl StaticInspector {
    pub fn new(root: &Path, status: RepositoryStatus) -> Self {
        Self {
            handle: RepositoryHandle::new(root, root.join(".git")),
            queued: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(status),
            fast_forward: Mutex::new(false),
        }
    }

    pub fn handle(&self) -> RepositoryHandle {
        self.handle.clone()
    }

    pub fn push_status(&self, status: RepositoryStatus) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(status);
    }

    pub fn set_status(&self, status: RepositoryStatus) {
        *self.fallback.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Answer for every `is_ancestor` query (default `false`).
    pub fn set_fast_forward(&self, fast_forward: bool) {
        *self
            .fast_forward
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = fast_forward;
    }
}

impl Inspector for StaticInspector {
    fn resolve(&self, path: &Path) -> Result<RepositoryHandle, OpError> {
        if path == self.handle.workdir() {
            Ok(self.handle.clone())
        } else {
            Err(OpError::inspection(format!(
                "'{}' is not a valid Git repository root",
                path.display()
            )))
        }
    }

    fn inspect(&self, _handle: &RepositoryHandle) -> Result<RepositoryStatus, OpError> {
        if let Some(next) = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return Ok(next);
        }
        Ok(self
            .fallback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn is_ancestor(
        &self,
        _handle: &RepositoryHandle,
        _ancestor: &str,
        _descendant: &str,
    ) -> Result<bool, OpError> {
        Ok(*self
            .fast_forward
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Default)]
struct Rendezvous {
    waiting: usize,
    decision: Option<Decision>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<Rendezvous>,
    changed: Condvar,
}

/// Oracle that either answers immediately or blocks until the test decides.
pub struct ScriptedOracle {
    fixed: Option<Decision>,
    shared: Arc<Shared>,
    requests: Mutex<Vec<ApprovalRequest>>,
}

/// Test-side handle of a blocking [`ScriptedOracle`].
pub struct OracleControl {
    shared: Arc<Shared>,
}

impl ScriptedOracle {
    pub fn fixed(decision: Decision) -> Self {
        Self {
            fixed: Some(decision),
            shared: Default::default(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn blocking() -> (Self, OracleControl) {
        let shared = Arc::new(Shared::default());
        let oracle = Self {
            fixed: None,
            shared: Arc::clone(&shared),
            requests: Mutex::new(Vec::new()),
        };
        (oracle, OracleControl { shared })
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ApprovalOracle for ScriptedOracle {
    fn request_decision(&self, request: &ApprovalRequest) -> Decision {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if let Some(decision) = self.fixed {
            return decision;
        }
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.waiting += 1;
        self.shared.changed.notify_all();
        loop {
            if let Some(decision) = state.decision.take() {
                state.waiting -= 1;
                return decision;
            }
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl OracleControl {
    /// Block until a request is waiting for a decision.
    pub fn wait_for_request(&self) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while state.waiting == 0 {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Answer the next waiting request.
    pub fn decide(&self, decision: Decision) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.decision = Some(decision);
        self.shared.changed.notify_all();
    }
}

