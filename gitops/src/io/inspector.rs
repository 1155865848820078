//! Repository state inspector.
//!
//! Resolves user paths to [`RepositoryHandle`]s and reports the current
//! [`RepositoryStatus`]. Inspection never mutates the repository: status is
//! read without optional locks and the in-progress operation comes from marker
//! files in the metadata directory, not from command output text.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, instrument};

use crate::core::porcelain::{OperationMarkers, parse_stash_list, parse_status_z};
use crate::core::types::{RepositoryHandle, RepositoryStatus};
use crate::error::OpError;
use crate::io::executor::{CommandExecutor, GitCommand, GitExecutor, describe};

/// Read-only view of repositories.
pub trait Inspector: Send + Sync {
    /// Resolve `path` to a repository root. Subdirectories are rejected.
    fn resolve(&self, path: &Path) -> Result<RepositoryHandle, OpError>;

    fn inspect(&self, handle: &RepositoryHandle) -> Result<RepositoryStatus, OpError>;

    /// Whether `ancestor` is reachable from `descendant`. Unknown revisions
    /// are an inspection failure.
    fn is_ancestor(
        &self,
        handle: &RepositoryHandle,
        ancestor: &str,
        descendant: &str,
    ) -> Result<bool, OpError>;
}

/// Inspector backed by the `git` binary.
///
/// It owns its own executor so inspection traffic never shows up in the
/// orchestration executor's accounting.
pub struct GitInspector {
    executor: Box<dyn CommandExecutor>,
    timeout: Duration,
}

impl GitInspector {
    pub fn new(binary: impl Into<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self::with_executor(Box::new(GitExecutor::new(binary, output_limit_bytes)), timeout)
    }

    pub fn with_executor(executor: Box<dyn CommandExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    fn capture(
        &self,
        workdir: &Path,
        command: GitCommand,
        args: &[&str],
    ) -> Result<String, OpError> {
        let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
        let result = self
            .executor
            .execute(workdir, command, &args, self.timeout)
            .map_err(|e| OpError::inspection(e.to_string()))?;
        if !result.success() {
            return Err(OpError::inspection(format!(
                "git {} failed: {}",
                describe(command, &args),
                result.failure_detail()
            )));
        }
        Ok(result.stdout)
    }

    /// Like `capture`, but a non-zero exit means "absent" rather than failure.
    fn probe(
        &self,
        workdir: &Path,
        command: GitCommand,
        args: &[&str],
    ) -> Result<Option<String>, OpError> {
        let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
        let result = self
            .executor
            .execute(workdir, command, &args, self.timeout)
            .map_err(|e| OpError::inspection(e.to_string()))?;
        if result.success() {
            Ok(Some(result.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }
}

impl Inspector for GitInspector {
    #[instrument(skip_all, fields(path = %path.display()))]
    fn resolve(&self, path: &Path) -> Result<RepositoryHandle, OpError> {
        if !path.exists() {
            return Err(OpError::inspection(format!(
                "path '{}' does not exist",
                path.display()
            )));
        }
        let canonical = path
            .canonicalize()
            .map_err(|e| OpError::inspection(format!("resolve '{}': {e}", path.display())))?;
        let Some(out) = self.probe(
            &canonical,
            GitCommand::RevParse,
            &["--show-toplevel", "--absolute-git-dir"],
        )?
        else {
            return Err(not_a_root(path));
        };
        let mut lines = out.lines();
        let (Some(toplevel), Some(git_dir)) = (lines.next(), lines.next()) else {
            return Err(not_a_root(path));
        };
        let toplevel = PathBuf::from(toplevel)
            .canonicalize()
            .map_err(|e| OpError::inspection(format!("resolve toplevel {toplevel}: {e}")))?;
        if toplevel != canonical {
            return Err(not_a_root(path));
        }
        debug!(workdir = %canonical.display(), git_dir, "resolved repository");
        Ok(RepositoryHandle::new(canonical, git_dir))
    }

    #[instrument(skip_all, fields(workdir = %handle.workdir().display()))]
    fn inspect(&self, handle: &RepositoryHandle) -> Result<RepositoryStatus, OpError> {
        let workdir = handle.workdir();
        if !handle.git_dir().is_dir() {
            return Err(OpError::inspection(format!(
                "metadata directory '{}' is missing",
                handle.git_dir().display()
            )));
        }

        let current_branch = self
            .probe(workdir, GitCommand::SymbolicRef, &["--short", "-q", "HEAD"])?
            .filter(|b| !b.is_empty());
        let head = self
            .probe(workdir, GitCommand::RevParse, &["--verify", "-q", "HEAD"])?
            .filter(|h| !h.is_empty());

        let raw_status = self.capture(
            workdir,
            GitCommand::Status,
            &["--porcelain=v1", "-z", "--untracked-files=all"],
        )?;
        let entries = parse_status_z(&raw_status).map_err(OpError::inspection)?;
        let conflicted_paths = entries
            .iter()
            .filter(|e| e.is_unmerged())
            .map(|e| e.path.clone())
            .collect();

        let markers = read_markers(handle.git_dir());

        let raw_stash = self.capture(
            workdir,
            GitCommand::Stash,
            &["list", "--format=%gd%x1f%ct%x1f%gs"],
        )?;
        let stash_entries = parse_stash_list(&raw_stash).map_err(OpError::inspection)?;

        let status = RepositoryStatus {
            current_branch,
            head,
            is_dirty: !entries.is_empty(),
            conflicted_paths,
            in_progress_operation: markers.in_progress(),
            stash_entries,
        };
        debug!(
            dirty = status.is_dirty,
            conflicts = status.conflicted_paths.len(),
            in_progress = ?status.in_progress_operation,
            "inspected repository"
        );
        Ok(status)
    }

    fn is_ancestor(
        &self,
        handle: &RepositoryHandle,
        ancestor: &str,
        descendant: &str,
    ) -> Result<bool, OpError> {
        let args = vec![
            "--is-ancestor".to_string(),
            ancestor.to_string(),
            descendant.to_string(),
        ];
        let result = self
            .executor
            .execute(handle.workdir(), GitCommand::MergeBase, &args, self.timeout)
            .map_err(|e| OpError::inspection(e.to_string()))?;
        match result.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(OpError::inspection(format!(
                "git {} failed: {}",
                describe(GitCommand::MergeBase, &args),
                result.failure_detail()
            ))),
        }
    }
}

fn read_markers(git_dir: &Path) -> OperationMarkers {
    OperationMarkers {
        rebase_merge: git_dir.join("rebase-merge").is_dir(),
        rebase_apply: git_dir.join("rebase-apply").is_dir(),
        merge_head: is_file(&git_dir.join("MERGE_HEAD")),
        cherry_pick_head: is_file(&git_dir.join("CHERRY_PICK_HEAD")),
    }
}

fn is_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

fn not_a_root(path: &Path) -> OpError {
    OpError::inspection(format!(
        "'{}' is not a valid Git repository root; pass the directory containing '.git', not a subdirectory",
        path.display()
    ))
}
