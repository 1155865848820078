//! Merge, rebase and cherry-pick workflows against real repositories.
//!
//! Each test builds a conflicting history with `TestRepo`, drives the tools
//! through a `Dispatcher` backed by the real `git` binary, and checks both the
//! envelope and the repository on disk.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use gitops::core::types::{Decision, InProgressOperation};
use gitops::dispatch::{Dispatcher, Envelope, Outcome};
use gitops::io::executor::{CommandExecutor, GitExecutor};
use gitops::io::inspector::{GitInspector, Inspector};
use gitops::io::session_store::session_path;
use gitops::ops::{Orchestrator, Settings};
use gitops::test_support::{RecordingExecutor, ScriptedOracle, TestRepo};
use serde_json::{Value, json};

fn dispatcher() -> Dispatcher {
    dispatcher_with(Arc::new(GitExecutor::new("git", 1_000_000)))
}

fn dispatcher_with(executor: Arc<dyn CommandExecutor>) -> Dispatcher {
    let orchestrator = Orchestrator::new(
        executor,
        Arc::new(GitInspector::new("git", Duration::from_secs(60), 1_000_000)),
        Box::new(ScriptedOracle::fixed(Decision::Approved)),
        Settings::default(),
    );
    Dispatcher::new(orchestrator, None).expect("dispatcher")
}

const CONFLICT_HUNK: &str = "<<<<<<< HEAD\nmain\n=======\nfeature\n>>>>>>> feature\n";

fn call(dispatcher: &Dispatcher, repo: &TestRepo, tool: &str, mut args: Value) -> Envelope {
    args["repo_path"] = json!(repo.path().to_string_lossy());
    dispatcher.dispatch(tool, &args)
}

fn session(dispatcher: &Dispatcher, repo: &TestRepo) -> Value {
    let envelope = call(dispatcher, repo, "workflow_status", json!({}));
    assert_eq!(envelope.status, Outcome::Success);
    envelope.result.expect("result")["session"].clone()
}

#[test]
fn merge_conflict_then_abort_restores_pre_merge_state() {
    let repo = TestRepo::new().expect("repo");
    repo.diverge_same_line("a.txt").expect("diverge");
    let inspector = GitInspector::new("git", Duration::from_secs(60), 1_000_000);
    let handle = inspector.resolve(repo.path()).expect("resolve");
    let before = inspector.inspect(&handle).expect("inspect");
    let dispatcher = dispatcher();

    let envelope = call(&dispatcher, &repo, "merge", json!({"source_branch": "feature"}));
    assert_eq!(envelope.error_kind(), Some("operation_failed"));
    let status = envelope.repository_status.expect("status attached");
    assert_eq!(status.in_progress_operation, InProgressOperation::Merge);
    assert_eq!(
        status.conflicted_paths.into_iter().collect::<Vec<_>>(),
        vec!["a.txt".to_string()]
    );

    let active = session(&dispatcher, &repo);
    assert_eq!(active["phase"], "conflicted");
    assert_eq!(active["operation_kind"], "merge");
    assert!(session_path(&handle).exists());

    let envelope = call(&dispatcher, &repo, "abort", json!({}));
    assert_eq!(envelope.status, Outcome::Success, "{envelope:?}");
    let result = envelope.result.expect("result");
    assert_eq!(result["phase"], "idle");
    assert_eq!(result["status_restored"], true);
    assert_eq!(envelope.repository_status, Some(before));
    assert_eq!(repo.read_file("a.txt").expect("read"), "main\n");
    assert_eq!(session(&dispatcher, &repo), Value::Null);
    assert!(!session_path(&handle).exists());
}

#[test]
fn workflows_cannot_overlap_while_conflicted() {
    let repo = TestRepo::new().expect("repo");
    repo.diverge_same_line("a.txt").expect("diverge");
    let head = repo.head().expect("head");
    let dispatcher = dispatcher();

    let envelope = call(&dispatcher, &repo, "merge", json!({"source_branch": "feature"}));
    assert_eq!(envelope.error_kind(), Some("operation_failed"));

    for (tool, args) in [
        ("merge", json!({"source_branch": "feature"})),
        ("rebase", json!({"onto_branch": "feature"})),
        ("cherry_pick", json!({"commit_id": "feature"})),
        ("pull", json!({"remote_name": "origin", "branch": "main"})),
    ] {
        let envelope = call(&dispatcher, &repo, tool, args);
        assert_eq!(envelope.error_kind(), Some("state_conflict"), "{tool}");
        let status = envelope.repository_status.expect("status");
        assert_eq!(status.in_progress_operation, InProgressOperation::Merge);
    }
    assert_eq!(repo.head().expect("head"), head);
}

#[test]
fn continue_after_resolving_completes_the_merge() {
    let repo = TestRepo::new().expect("repo");
    repo.diverge_same_line("a.txt").expect("diverge");
    let dispatcher = dispatcher();

    let envelope = call(&dispatcher, &repo, "merge", json!({"source_branch": "feature"}));
    assert_eq!(envelope.error_kind(), Some("operation_failed"));

    repo.write_file("a.txt", "resolved\n").expect("resolve");
    let envelope = call(&dispatcher, &repo, "continue", json!({}));
    assert_eq!(envelope.status, Outcome::Success, "{envelope:?}");
    assert_eq!(envelope.result.expect("result")["phase"], "completed");

    let status = envelope.repository_status.expect("status");
    assert_eq!(status.in_progress_operation, InProgressOperation::None);
    assert!(!status.is_dirty);
    let parents = repo
        .git(&["rev-list", "--parents", "-n", "1", "HEAD"])
        .expect("rev-list");
    assert_eq!(parents.split_whitespace().count(), 3, "merge commit");
    assert_eq!(session(&dispatcher, &repo), Value::Null);
}

#[test]
fn continue_with_conflicts_left_stays_conflicted() {
    let repo = TestRepo::new().expect("repo");
    repo.write_file("a.txt", "base\n").expect("write");
    repo.write_file("b.txt", "base\n").expect("write");
    repo.commit_all("base").expect("commit");
    repo.git(&["checkout", "-q", "-b", "feature"]).expect("branch");
    repo.write_file("a.txt", "feature\n").expect("write");
    repo.write_file("b.txt", "feature\n").expect("write");
    repo.commit_all("feature").expect("commit");
    repo.git(&["checkout", "-q", "main"]).expect("checkout");
    repo.write_file("a.txt", "main\n").expect("write");
    repo.write_file("b.txt", "main\n").expect("write");
    repo.commit_all("main").expect("commit");
    let dispatcher = dispatcher();

    let envelope = call(&dispatcher, &repo, "merge", json!({"source_branch": "feature"}));
    assert_eq!(
        envelope
            .repository_status
            .expect("status")
            .conflicted_paths
            .len(),
        2
    );

    repo.write_file("a.txt", "resolved\n").expect("resolve a");
    let envelope = call(&dispatcher, &repo, "continue", json!({"paths": ["a.txt"]}));
    assert_eq!(envelope.error_kind(), Some("operation_failed"));

    let active = session(&dispatcher, &repo);
    assert_eq!(active["phase"], "conflicted");
    assert_eq!(active["conflicted_paths"], json!(["b.txt"]));

    repo.write_file("b.txt", "resolved\n").expect("resolve b");
    let envelope = call(&dispatcher, &repo, "continue", json!({}));
    assert_eq!(envelope.status, Outcome::Success, "{envelope:?}");
}

#[test]
fn local_changes_are_refused_while_conflicted() {
    let repo = TestRepo::new().expect("repo");
    repo.diverge_same_line("a.txt").expect("diverge");
    let executor = Arc::new(RecordingExecutor::new("git"));
    let dispatcher = dispatcher_with(Arc::clone(&executor) as Arc<dyn CommandExecutor>);

    let envelope = call(&dispatcher, &repo, "merge", json!({"source_branch": "feature"}));
    assert_eq!(envelope.error_kind(), Some("operation_failed"));
    let issued = executor.total();

    for (tool, args) in [
        ("reset", json!({})),
        ("commit", json!({"message": "wip"})),
        ("checkout", json!({"branch_name": "feature"})),
        ("stash_push", json!({})),
        ("add", json!({"files": ["a.txt"]})),
        ("create_branch", json!({"branch_name": "topic"})),
    ] {
        let envelope = call(&dispatcher, &repo, tool, args);
        assert_eq!(envelope.error_kind(), Some("state_conflict"), "{tool}");
        let status = envelope.repository_status.expect("status");
        assert_eq!(status.in_progress_operation, InProgressOperation::Merge, "{tool}");
    }
    assert_eq!(executor.total(), issued, "refused tools never reach git");

    let log = call(&dispatcher, &repo, "log", json!({"max_count": 1}));
    assert_eq!(log.status, Outcome::Success, "{log:?}");

    let envelope = call(&dispatcher, &repo, "abort", json!({}));
    assert_eq!(envelope.status, Outcome::Success, "{envelope:?}");
    assert_eq!(repo.read_file("a.txt").expect("read"), "main\n");
}

#[test]
fn continue_on_an_unedited_conflict_stays_conflicted() {
    let repo = TestRepo::new().expect("repo");
    repo.diverge_same_line("a.txt").expect("diverge");
    let head = repo.head().expect("head");
    let dispatcher = dispatcher();

    let envelope = call(&dispatcher, &repo, "merge", json!({"source_branch": "feature"}));
    assert_eq!(envelope.error_kind(), Some("operation_failed"));
    assert_eq!(repo.read_file("a.txt").expect("read"), CONFLICT_HUNK);

    let envelope = call(&dispatcher, &repo, "continue", json!({}));
    assert_eq!(envelope.error_kind(), Some("operation_failed"));
    let status = envelope.repository_status.expect("status");
    assert_eq!(status.in_progress_operation, InProgressOperation::Merge);
    assert_eq!(
        status.conflicted_paths.into_iter().collect::<Vec<_>>(),
        vec!["a.txt".to_string()]
    );
    assert_eq!(session(&dispatcher, &repo)["phase"], "conflicted");
    assert_eq!(repo.head().expect("head"), head, "nothing was committed");

    repo.write_file("a.txt", "resolved\n").expect("resolve");
    let envelope = call(&dispatcher, &repo, "continue", json!({}));
    assert_eq!(envelope.status, Outcome::Success, "{envelope:?}");
    let committed = repo.git(&["show", "HEAD:a.txt"]).expect("show");
    assert_eq!(committed.trim_end(), "resolved");
}

#[test]
fn abort_fails_when_git_has_nothing_to_abort() {
    let repo = TestRepo::new().expect("repo");
    repo.diverge_same_line("a.txt").expect("diverge");
    let dispatcher = dispatcher();

    let envelope = call(&dispatcher, &repo, "merge", json!({"source_branch": "feature"}));
    assert_eq!(envelope.error_kind(), Some("operation_failed"));
    // The merge state is discarded outside the orchestrator.
    repo.git(&["reset", "-q"]).expect("external reset");

    let envelope = call(&dispatcher, &repo, "abort", json!({}));
    assert_eq!(envelope.error_kind(), Some("operation_failed"));
    let status = envelope.repository_status.expect("status");
    assert_eq!(status.in_progress_operation, InProgressOperation::None);
    assert!(status.is_dirty);
    assert_eq!(repo.read_file("a.txt").expect("read"), CONFLICT_HUNK);
    assert_eq!(session(&dispatcher, &repo), Value::Null);
}

#[test]
fn continue_and_abort_without_a_workflow_are_state_conflicts() {
    let repo = TestRepo::new().expect("repo");
    let dispatcher = dispatcher();
    for tool in ["continue", "abort"] {
        let envelope = call(&dispatcher, &repo, tool, json!({}));
        assert_eq!(envelope.error_kind(), Some("state_conflict"), "{tool}");
    }
}

#[test]
fn fresh_process_rehydrates_from_record_then_from_markers() {
    let repo = TestRepo::new().expect("repo");
    repo.diverge_same_line("a.txt").expect("diverge");
    {
        let first = dispatcher();
        let envelope = call(&first, &repo, "merge", json!({"source_branch": "feature"}));
        assert_eq!(envelope.error_kind(), Some("operation_failed"));
    }

    let second = dispatcher();
    let active = session(&second, &repo);
    assert_eq!(active["phase"], "conflicted");
    assert_eq!(active["argument"], "feature");
    assert!(active["status_before"].is_object());

    let inspector = GitInspector::new("git", Duration::from_secs(60), 1_000_000);
    let handle = inspector.resolve(repo.path()).expect("resolve");
    fs::remove_file(session_path(&handle)).expect("remove record");

    let third = dispatcher();
    let active = session(&third, &repo);
    assert_eq!(active["operation_kind"], "merge");
    assert_eq!(active["phase"], "conflicted");
    assert_eq!(active["argument"], Value::Null);
    assert_eq!(active["conflicted_paths"], json!(["a.txt"]));

    let envelope = call(&third, &repo, "abort", json!({}));
    assert_eq!(envelope.status, Outcome::Success, "{envelope:?}");
    let result = envelope.result.expect("result");
    assert!(result.get("status_restored").is_none());
    assert_eq!(repo.read_file("a.txt").expect("read"), "main\n");
}

#[test]
fn cherry_pick_conflict_and_abort() {
    let repo = TestRepo::new().expect("repo");
    repo.diverge_same_line("a.txt").expect("diverge");
    let dispatcher = dispatcher();

    let envelope = call(&dispatcher, &repo, "cherry_pick", json!({"commit_id": "feature"}));
    assert_eq!(envelope.error_kind(), Some("operation_failed"));
    assert_eq!(
        envelope.repository_status.expect("status").in_progress_operation,
        InProgressOperation::CherryPick
    );
    assert_eq!(session(&dispatcher, &repo)["operation_kind"], "cherry_pick");

    let envelope = call(&dispatcher, &repo, "abort", json!({}));
    assert_eq!(envelope.status, Outcome::Success, "{envelope:?}");
    assert_eq!(repo.read_file("a.txt").expect("read"), "main\n");
}

#[test]
fn rebase_conflict_reports_detached_head_and_aborts() {
    let repo = TestRepo::new().expect("repo");
    repo.diverge_same_line("a.txt").expect("diverge");
    let dispatcher = dispatcher();

    let envelope = call(&dispatcher, &repo, "rebase", json!({"onto_branch": "feature"}));
    assert_eq!(envelope.error_kind(), Some("operation_failed"));
    let status = envelope.repository_status.expect("status");
    assert_eq!(status.in_progress_operation, InProgressOperation::Rebase);
    assert_eq!(status.current_branch, None);

    let envelope = call(&dispatcher, &repo, "abort", json!({}));
    assert_eq!(envelope.status, Outcome::Success, "{envelope:?}");
    let status = envelope.repository_status.expect("status");
    assert_eq!(status.current_branch.as_deref(), Some("main"));
    assert_eq!(envelope.result.expect("result")["status_restored"], true);
}

#[test]
fn refused_merge_returns_to_idle() {
    let repo = TestRepo::new().expect("repo");
    let dispatcher = dispatcher();

    let envelope = call(&dispatcher, &repo, "merge", json!({"source_branch": "no-such-branch"}));
    assert_eq!(envelope.error_kind(), Some("operation_failed"));
    assert_eq!(
        envelope.repository_status.expect("status").in_progress_operation,
        InProgressOperation::None
    );
    assert_eq!(session(&dispatcher, &repo), Value::Null);
}
