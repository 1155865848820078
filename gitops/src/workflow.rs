//! State machine for merge, rebase and cherry-pick.
//!
//! ```text
//! Idle -> Started -> (Clean | Conflicted) -> Resolving -> (Completed | Aborted)
//! ```
//!
//! `Idle` is the absence of a session. A repository has at most one session;
//! claiming it is the serialization point for multi-step operations, so a
//! second start while one is active fails with `StateConflict` instead of
//! queueing. Sessions are persisted next to the repository metadata and can be
//! rebuilt from the inspector alone after a restart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::porcelain::has_conflict_markers;
use crate::core::types::{
    CommandResult, InProgressOperation, Phase, RepositoryHandle, RepositoryStatus, WorkflowKind,
    WorkflowSession,
};
use crate::error::{ExecutionFailure, OpError};
use crate::io::executor::{CommandExecutor, GitCommand, describe};
use crate::io::inspector::Inspector;
use crate::io::session_store::{clear_session, load_session, write_session};

/// Command that starts a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStart {
    pub kind: WorkflowKind,
    pub command: GitCommand,
    pub args: Vec<String>,
    /// Branch, ref or commit recorded on the session.
    pub argument: Option<String>,
}

impl WorkflowStart {
    pub fn merge(branch: &str) -> Self {
        Self {
            kind: WorkflowKind::Merge,
            command: GitCommand::Merge,
            args: vec!["--no-edit".to_string(), branch.to_string()],
            argument: Some(branch.to_string()),
        }
    }

    /// `git pull` runs a merge and can stop in the same conflicted state.
    pub fn pull(remote: &str, branch: &str) -> Self {
        Self {
            kind: WorkflowKind::Merge,
            command: GitCommand::Pull,
            args: vec![
                "--no-rebase".to_string(),
                "--no-edit".to_string(),
                remote.to_string(),
                branch.to_string(),
            ],
            argument: Some(format!("{remote}/{branch}")),
        }
    }

    pub fn rebase(onto: &str) -> Self {
        Self {
            kind: WorkflowKind::Rebase,
            command: GitCommand::Rebase,
            args: vec![onto.to_string()],
            argument: Some(onto.to_string()),
        }
    }

    pub fn cherry_pick(commit: &str) -> Self {
        Self {
            kind: WorkflowKind::CherryPick,
            command: GitCommand::CherryPick,
            args: vec![commit.to_string()],
            argument: Some(commit.to_string()),
        }
    }
}

fn continue_command(kind: WorkflowKind) -> (GitCommand, Vec<String>) {
    match kind {
        WorkflowKind::Merge => (GitCommand::Commit, vec!["--no-edit".to_string()]),
        WorkflowKind::Rebase => (GitCommand::Rebase, vec!["--continue".to_string()]),
        WorkflowKind::CherryPick => (GitCommand::CherryPick, vec!["--continue".to_string()]),
    }
}

fn abort_command(kind: WorkflowKind) -> (GitCommand, Vec<String>) {
    let args = vec!["--abort".to_string()];
    match kind {
        WorkflowKind::Merge => (GitCommand::Merge, args),
        WorkflowKind::Rebase => (GitCommand::Rebase, args),
        WorkflowKind::CherryPick => (GitCommand::CherryPick, args),
    }
}

/// Result of a workflow step that did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowReport {
    pub operation_kind: WorkflowKind,
    pub phase: Phase,
    pub command: CommandResult,
    /// Abort only: whether the post-abort status equals the status captured
    /// before the workflow started (`None` when no snapshot exists).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_restored: Option<bool>,
}

/// Rebuild a session from what the repository itself reports.
///
/// Only the in-progress marker decides whether a workflow is unfinished; a
/// persisted record without a marker is stale.
pub fn reconcile(
    record: Option<WorkflowSession>,
    status: &RepositoryStatus,
) -> Option<WorkflowSession> {
    let kind = WorkflowKind::from_in_progress(status.in_progress_operation)?;
    let mut session = match record {
        Some(record) if record.operation_kind == kind => record,
        _ => WorkflowSession::started(kind, None),
    };
    session.phase = Phase::Conflicted;
    session.conflicted_paths = status.conflicted_paths.clone();
    Some(session)
}

pub struct WorkflowEngine {
    executor: Arc<dyn CommandExecutor>,
    inspector: Arc<dyn Inspector>,
    timeout: Duration,
    sessions: Mutex<HashMap<PathBuf, WorkflowSession>>,
}

impl WorkflowEngine {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        inspector: Arc<dyn Inspector>,
        timeout: Duration,
    ) -> Self {
        Self {
            executor,
            inspector,
            timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<PathBuf, WorkflowSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Active session for `handle`, rehydrating from disk or from repository
    /// markers when this process has none in memory.
    pub fn session(&self, handle: &RepositoryHandle) -> Result<Option<WorkflowSession>, OpError> {
        if let Some(session) = self.sessions().get(handle.key()) {
            return Ok(Some(session.clone()));
        }
        let record = load_session(handle)?;
        let had_record = record.is_some();
        let status = self.inspector.inspect(handle)?;
        let Some(session) = reconcile(record, &status) else {
            if had_record {
                debug!("discarding stale session record");
                clear_session(handle)?;
            }
            return Ok(None);
        };
        info!(kind = ?session.operation_kind, "rehydrated workflow session");
        write_session(handle, &session)?;
        let mut sessions = self.sessions();
        let active = sessions
            .entry(handle.key().to_path_buf())
            .or_insert(session);
        Ok(Some(active.clone()))
    }

    /// Fail with `StateConflict` if a workflow is active on `handle`.
    pub fn ensure_idle(&self, handle: &RepositoryHandle) -> Result<(), OpError> {
        match self.session(handle)? {
            Some(active) => Err(busy(handle, &active)),
            None => Ok(()),
        }
    }

    /// Start a workflow. Conflicts are reported as `OperationFailed` with the
    /// session left in `Conflicted`.
    #[instrument(
        skip_all,
        fields(workdir = %handle.workdir().display(), kind = start.kind.as_str())
    )]
    pub fn start(
        &self,
        handle: &RepositoryHandle,
        start: &WorkflowStart,
    ) -> Result<WorkflowReport, OpError> {
        self.claim(handle, start)?;

        let status_before = self.preflight(handle)?;
        self.update(handle, |session| session.status_before = Some(status_before));
        let persisted = self
            .current(handle)
            .map_or(Ok(()), |session| write_session(handle, &session));
        if let Err(err) = persisted {
            self.forget(handle);
            return Err(err);
        }

        debug!(args = ?start.args, "running workflow command");
        let result = match self.execute(handle, start.command, &start.args) {
            Ok(result) => result,
            Err(fault) => return Err(self.abort_on_fault(handle, fault)),
        };
        self.settle(handle, start.kind, describe(start.command, &start.args), result)
    }

    /// Stage resolved paths and run the kind's continue command.
    ///
    /// `paths` defaults to the conflicted-path snapshot. Paths whose contents
    /// still carry conflict markers are left unstaged and the continue command
    /// is not run. Whenever conflicts remain the session goes back to
    /// `Conflicted` and `OperationFailed` is returned.
    #[instrument(skip_all, fields(workdir = %handle.workdir().display()))]
    pub fn resume(
        &self,
        handle: &RepositoryHandle,
        paths: Option<Vec<String>>,
    ) -> Result<WorkflowReport, OpError> {
        self.require_session(handle)?;
        let session = self.transition(handle, &[Phase::Conflicted], Phase::Resolving)?;
        let kind = session.operation_kind;

        let paths = paths.unwrap_or_else(|| session.conflicted_paths.iter().cloned().collect());
        let (unresolved, resolved): (Vec<String>, Vec<String>) = paths
            .into_iter()
            .partition(|path| still_marked(handle.workdir(), path));
        if !resolved.is_empty() {
            let mut args = vec!["-A".to_string(), "--".to_string()];
            args.extend(resolved);
            let staged = match self.execute(handle, GitCommand::Add, &args) {
                Ok(result) => result,
                Err(fault) => return Err(self.abort_on_fault(handle, fault)),
            };
            if !staged.success() {
                return self.settle(handle, kind, describe(GitCommand::Add, &args), staged);
            }
        }

        let (command, args) = continue_command(kind);
        if !unresolved.is_empty() {
            return Err(self.hold_conflicted(handle, describe(command, &args), &unresolved));
        }
        let result = match self.execute(handle, command, &args) {
            Ok(result) => result,
            Err(fault) => return Err(self.abort_on_fault(handle, fault)),
        };
        self.settle(handle, kind, describe(command, &args), result)
    }

    /// Abort the active workflow and return the repository to `Idle`.
    ///
    /// Fails with `OperationFailed` when the abort command fails or the
    /// repository does not match the status captured before the workflow
    /// started; the session is released either way once nothing is in
    /// progress.
    #[instrument(skip_all, fields(workdir = %handle.workdir().display()))]
    pub fn abort(&self, handle: &RepositoryHandle) -> Result<WorkflowReport, OpError> {
        self.require_session(handle)?;
        let session = self.transition(handle, &[Phase::Conflicted], Phase::Aborted)?;
        let kind = session.operation_kind;

        let (command, args) = abort_command(kind);
        let result = match self.execute(handle, command, &args) {
            Ok(result) => result,
            Err(fault) => return Err(self.abort_on_fault(handle, fault)),
        };

        let status = match self.inspector.inspect(handle) {
            Ok(status) => status,
            Err(err) => {
                self.forget(handle);
                return Err(err);
            }
        };
        if status.in_progress_operation != InProgressOperation::None {
            warn!(exit_code = ?result.exit_code, "abort left the operation in progress");
            self.mark_conflicted(handle, &status)?;
            return Err(OpError::OperationFailed {
                command: describe(command, &args),
                exit_code: result.exit_code,
                detail: result.failure_detail(),
            });
        }

        self.release(handle)?;
        if !result.success() {
            warn!(exit_code = ?result.exit_code, "abort command failed");
            return Err(OpError::OperationFailed {
                command: describe(command, &args),
                exit_code: result.exit_code,
                detail: result.failure_detail(),
            });
        }
        let status_restored = session
            .status_before
            .as_ref()
            .map(|before| before == &status);
        if status_restored == Some(false) {
            warn!("status after abort differs from status before the workflow started");
            return Err(OpError::OperationFailed {
                command: describe(command, &args),
                exit_code: result.exit_code,
                detail: format!(
                    "{} aborted but the repository does not match its state before it started",
                    kind.as_str()
                ),
            });
        }
        info!(kind = kind.as_str(), "workflow aborted");
        Ok(WorkflowReport {
            operation_kind: kind,
            phase: Phase::Idle,
            command: result,
            status_restored,
        })
    }

    /// Take the repository's session slot or fail with `StateConflict`.
    fn claim(&self, handle: &RepositoryHandle, start: &WorkflowStart) -> Result<(), OpError> {
        let mut sessions = self.sessions();
        if let Some(active) = sessions.get(handle.key()) {
            warn!(
                active = active.operation_kind.as_str(),
                phase = active.phase.as_str(),
                "workflow already active"
            );
            return Err(busy(handle, active));
        }
        sessions.insert(
            handle.key().to_path_buf(),
            WorkflowSession::started(start.kind, start.argument.clone()),
        );
        Ok(())
    }

    /// With the slot claimed, make sure nothing unfinished exists on disk and
    /// capture the pre-command status. Releases the slot on failure.
    fn preflight(&self, handle: &RepositoryHandle) -> Result<RepositoryStatus, OpError> {
        let checked = load_session(handle).and_then(|record| {
            let status = self.inspector.inspect(handle)?;
            Ok((record, status))
        });
        let (record, status) = match checked {
            Ok(found) => found,
            Err(err) => {
                self.forget(handle);
                return Err(err);
            }
        };
        let had_record = record.is_some();
        if let Some(existing) = reconcile(record, &status) {
            info!(kind = ?existing.operation_kind, "found unfinished workflow on disk");
            let conflict = busy(handle, &existing);
            let persisted = write_session(handle, &existing);
            self.sessions()
                .insert(handle.key().to_path_buf(), existing);
            persisted?;
            return Err(conflict);
        }
        if had_record {
            debug!("discarding stale session record");
            if let Err(err) = clear_session(handle) {
                self.forget(handle);
                return Err(err);
            }
        }
        Ok(status)
    }

    fn execute(
        &self,
        handle: &RepositoryHandle,
        command: GitCommand,
        args: &[String],
    ) -> Result<CommandResult, ExecutionFailure> {
        self.executor.execute(handle.workdir(), command, args, self.timeout)
    }

    /// Put the session back in `Conflicted` without running `command`.
    fn hold_conflicted(
        &self,
        handle: &RepositoryHandle,
        command: String,
        unresolved: &[String],
    ) -> OpError {
        let status = match self.inspector.inspect(handle) {
            Ok(status) => status,
            Err(err) => {
                self.forget(handle);
                return err;
            }
        };
        if let Err(err) = self.mark_conflicted(handle, &status) {
            return err;
        }
        warn!(paths = ?unresolved, "conflict markers remain; not continuing");
        OpError::OperationFailed {
            command,
            exit_code: None,
            detail: format!(
                "conflict markers remain in {}; resolve them, then continue, or abort",
                unresolved.join(", ")
            ),
        }
    }

    /// Classify the outcome of a workflow command by re-inspecting.
    fn settle(
        &self,
        handle: &RepositoryHandle,
        kind: WorkflowKind,
        command: String,
        result: CommandResult,
    ) -> Result<WorkflowReport, OpError> {
        let status = match self.inspector.inspect(handle) {
            Ok(status) => status,
            Err(err) => {
                self.forget(handle);
                return Err(err);
            }
        };

        if status.has_unfinished_work() {
            let session = self.mark_conflicted(handle, &status)?;
            warn!(
                conflicts = session.conflicted_paths.len(),
                exit_code = ?result.exit_code,
                "workflow stopped; resolve then continue, or abort"
            );
            return Err(OpError::OperationFailed {
                command,
                exit_code: result.exit_code,
                detail: format!(
                    "{} conflicted path(s); resolve then continue, or abort: {}",
                    session.conflicted_paths.len(),
                    result.failure_detail()
                ),
            });
        }

        self.release(handle)?;
        if !result.success() {
            return Err(OpError::OperationFailed {
                command,
                exit_code: result.exit_code,
                detail: result.failure_detail(),
            });
        }
        info!(kind = kind.as_str(), "workflow completed");
        Ok(WorkflowReport {
            operation_kind: kind,
            phase: Phase::Completed,
            command: result,
            status_restored: None,
        })
    }

    fn mark_conflicted(
        &self,
        handle: &RepositoryHandle,
        status: &RepositoryStatus,
    ) -> Result<WorkflowSession, OpError> {
        let session = {
            let mut sessions = self.sessions();
            let entry = sessions
                .entry(handle.key().to_path_buf())
                .or_insert_with(|| {
                    let kind = WorkflowKind::from_in_progress(status.in_progress_operation)
                        .unwrap_or(WorkflowKind::Merge);
                    WorkflowSession::started(kind, None)
                });
            entry.phase = Phase::Conflicted;
            entry.conflicted_paths = status.conflicted_paths.clone();
            entry.clone()
        };
        write_session(handle, &session)?;
        Ok(session)
    }

    /// Any process-level fault in an active phase ends the session.
    fn abort_on_fault(&self, handle: &RepositoryHandle, fault: ExecutionFailure) -> OpError {
        self.update(handle, |session| session.phase = Phase::Aborted);
        warn!(err = %fault, "execution fault; workflow aborted without recovery");
        if let Err(err) = self.release(handle) {
            warn!(err = %err, "failed to clear session after fault");
        }
        OpError::Execution(fault)
    }

    fn require_session(&self, handle: &RepositoryHandle) -> Result<(), OpError> {
        if self.session(handle)?.is_none() {
            return Err(OpError::state_conflict(format!(
                "no merge, rebase or cherry-pick in progress on {}",
                handle.workdir().display()
            )));
        }
        Ok(())
    }

    /// Move the session from one of `from` to `to`, atomically.
    fn transition(
        &self,
        handle: &RepositoryHandle,
        from: &[Phase],
        to: Phase,
    ) -> Result<WorkflowSession, OpError> {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(handle.key()) else {
            return Err(OpError::state_conflict(format!(
                "no merge, rebase or cherry-pick in progress on {}",
                handle.workdir().display()
            )));
        };
        if !from.contains(&session.phase) {
            return Err(busy(handle, session));
        }
        session.phase = to;
        Ok(session.clone())
    }

    fn current(&self, handle: &RepositoryHandle) -> Option<WorkflowSession> {
        self.sessions().get(handle.key()).cloned()
    }

    fn update(&self, handle: &RepositoryHandle, apply: impl FnOnce(&mut WorkflowSession)) {
        if let Some(session) = self.sessions().get_mut(handle.key()) {
            apply(session);
        }
    }

    /// Destroy the session in memory and on disk.
    fn release(&self, handle: &RepositoryHandle) -> Result<(), OpError> {
        self.forget(handle);
        clear_session(handle)
    }

    fn forget(&self, handle: &RepositoryHandle) {
        self.sessions().remove(handle.key());
    }
}

/// Whether `path` still holds conflict hunks. Unreadable or missing paths
/// (e.g. resolved by deletion) are left to git.
fn still_marked(workdir: &Path, path: &str) -> bool {
    fs::read(workdir.join(path)).is_ok_and(|contents| has_conflict_markers(&contents))
}

fn busy(handle: &RepositoryHandle, active: &WorkflowSession) -> OpError {
    OpError::state_conflict(format!(
        "{} is {} on {}; continue or abort it first",
        active.operation_kind.as_str(),
        active.phase.as_str(),
        handle.workdir().display()
    ))
}
