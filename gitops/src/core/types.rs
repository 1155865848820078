//! Shared data model for the orchestration layer.
//!
//! These types cross every seam (executor, inspector, workflow engine,
//! dispatcher) and are serialized into response envelopes and session files,
//! so their serde shapes are part of the external contract.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// A resolved repository: canonical working-tree root plus its metadata dir.
///
/// Only the inspector produces handles from user paths; the canonical
/// `workdir` is the identity used for approval and workflow gating.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryHandle {
    workdir: PathBuf,
    git_dir: PathBuf,
}

impl RepositoryHandle {
    pub fn new(workdir: impl Into<PathBuf>, git_dir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            git_dir: git_dir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Key used by per-repository gates.
    pub fn key(&self) -> &Path {
        &self.workdir
    }
}

/// Outcome of one `git` process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "is_zero")]
    pub stdout_truncated: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub stderr_truncated: usize,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Trimmed stderr, falling back to stdout (some git errors go there).
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    serializer.serialize_u64(millis)
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

/// Multi-step operation git reports as unfinished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InProgressOperation {
    #[default]
    None,
    Merge,
    Rebase,
    CherryPick,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashEntry {
    pub index: usize,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time view of a repository. Recomputed for every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStatus {
    /// `None` on a detached HEAD (including mid-rebase).
    pub current_branch: Option<String>,
    /// `None` on an unborn branch.
    pub head: Option<String>,
    pub is_dirty: bool,
    pub conflicted_paths: BTreeSet<String>,
    pub in_progress_operation: InProgressOperation,
    pub stash_entries: Vec<StashEntry>,
}

impl RepositoryStatus {
    pub fn has_unfinished_work(&self) -> bool {
        self.in_progress_operation != InProgressOperation::None
            || !self.conflicted_paths.is_empty()
    }
}

/// How an operation is gated. Variants are ordered from least to most
/// restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalClass {
    ReadOnly,
    Local,
    RemoteMutating,
    HistoryRewriting,
}

impl ApprovalClass {
    pub fn requires_approval(self) -> bool {
        matches!(self, Self::RemoteMutating | Self::HistoryRewriting)
    }

    /// The stricter of `self` and `other`.
    pub fn escalate(self, other: Self) -> Self {
        self.max(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pending,
    Approved,
    Denied,
}

/// The single outstanding approval for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingApproval {
    pub operation_name: String,
    pub arguments: serde_json::Value,
    pub requested_at: DateTime<Utc>,
    pub decision: Decision,
}

/// Operations driven by the workflow state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Merge,
    Rebase,
    CherryPick,
}

impl WorkflowKind {
    /// Marker the inspector reports while this workflow is unfinished.
    pub fn in_progress(self) -> InProgressOperation {
        match self {
            Self::Merge => InProgressOperation::Merge,
            Self::Rebase => InProgressOperation::Rebase,
            Self::CherryPick => InProgressOperation::CherryPick,
        }
    }

    pub fn from_in_progress(op: InProgressOperation) -> Option<Self> {
        match op {
            InProgressOperation::None => None,
            InProgressOperation::Merge => Some(Self::Merge),
            InProgressOperation::Rebase => Some(Self::Rebase),
            InProgressOperation::CherryPick => Some(Self::CherryPick),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Rebase => "rebase",
            Self::CherryPick => "cherry_pick",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Started,
    Conflicted,
    Resolving,
    Completed,
    Aborted,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Conflicted => "conflicted",
            Self::Resolving => "resolving",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

/// A merge, rebase or cherry-pick that has not finished yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub operation_kind: WorkflowKind,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub conflicted_paths: BTreeSet<String>,
    /// Status captured right before the triggering command. Absent when the
    /// session was rehydrated from repository markers alone.
    pub status_before: Option<RepositoryStatus>,
    /// Branch, ref or commit the workflow was started with.
    pub argument: Option<String>,
}

impl WorkflowSession {
    pub fn started(kind: WorkflowKind, argument: Option<String>) -> Self {
        Self {
            operation_kind: kind,
            phase: Phase::Started,
            started_at: Utc::now(),
            conflicted_paths: BTreeSet::new(),
            status_before: None,
            argument,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_result_serializes_duration_as_millis() {
        let result = CommandResult {
            exit_code: Some(0),
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            duration: Duration::from_millis(1500),
            stdout_truncated: 0,
            stderr_truncated: 0,
        };
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["duration_ms"], 1500);
        assert!(value.get("stdout_truncated").is_none());
    }

    #[test]
    fn failure_detail_prefers_stderr() {
        let mut result = CommandResult {
            exit_code: Some(1),
            stdout: "CONFLICT (content): Merge conflict in a.txt\n".to_string(),
            stderr: String::new(),
            duration: Duration::ZERO,
            stdout_truncated: 0,
            stderr_truncated: 0,
        };
        assert!(result.failure_detail().starts_with("CONFLICT"));
        result.stderr = "fatal: nope\n".to_string();
        assert_eq!(result.failure_detail(), "fatal: nope");
    }

    #[test]
    fn only_gated_classes_require_approval() {
        assert!(!ApprovalClass::ReadOnly.requires_approval());
        assert!(!ApprovalClass::Local.requires_approval());
        assert!(ApprovalClass::RemoteMutating.requires_approval());
        assert!(ApprovalClass::HistoryRewriting.requires_approval());
    }

    #[test]
    fn escalation_never_relaxes_a_class() {
        use ApprovalClass::{HistoryRewriting, Local, RemoteMutating};
        assert_eq!(Local.escalate(HistoryRewriting), HistoryRewriting);
        assert_eq!(RemoteMutating.escalate(HistoryRewriting), HistoryRewriting);
        assert_eq!(HistoryRewriting.escalate(Local), HistoryRewriting);
    }

    #[test]
    fn workflow_kind_maps_to_marker_and_back() {
        for kind in [
            WorkflowKind::Merge,
            WorkflowKind::Rebase,
            WorkflowKind::CherryPick,
        ] {
            assert_eq!(WorkflowKind::from_in_progress(kind.in_progress()), Some(kind));
        }
        assert_eq!(WorkflowKind::from_in_progress(InProgressOperation::None), None);
    }

    #[test]
    fn in_progress_serializes_snake_case() {
        let json = serde_json::to_string(&InProgressOperation::CherryPick).expect("serialize");
        assert_eq!(json, "\"cherry_pick\"");
    }
}
