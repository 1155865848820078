//! Tool handlers.
//!
//! Each handler receives arguments that already passed schema validation,
//! applies the semantic checks in [`crate::core::validate`], and then either
//! drives the workflow engine or issues one executor call. Handlers that
//! change the repository first pass [`Orchestrator::guard`]: no workflow may
//! be active, and the approval gate is consulted when the class requires it.
//! Approval tickets are held until the handler returns.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::approval::{ApprovalGateway, ApprovalOracle, ApprovalTicket};
use crate::core::porcelain::{LOG_FORMAT, parse_lines, parse_log, parse_remotes};
use crate::core::types::{ApprovalClass, CommandResult, RepositoryHandle};
use crate::core::validate;
use crate::error::OpError;
use crate::io::config::GitopsConfig;
use crate::io::executor::{CommandExecutor, GitCommand, GitExecutor, describe};
use crate::io::inspector::{GitInspector, Inspector};
use crate::io::oracle::oracle_from_config;
use crate::workflow::{WorkflowEngine, WorkflowStart};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub command_timeout: Duration,
    pub default_log_count: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(300),
            default_log_count: 10,
        }
    }
}

/// One validated call on its way to a handler.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: &'static str,
    /// Class the registry assigns to the tool; handlers may only escalate it.
    pub class: ApprovalClass,
    /// Resolved repository, for tools that operate on an existing one.
    pub handle: Option<RepositoryHandle>,
    pub arguments: Value,
}

impl Invocation {
    fn repo(&self) -> Result<&RepositoryHandle, OpError> {
        self.handle
            .as_ref()
            .ok_or_else(|| OpError::validation(format!("{} requires repo_path", self.tool)))
    }

    fn parse<T: DeserializeOwned>(&self) -> Result<T, OpError> {
        serde_json::from_value(self.arguments.clone())
            .map_err(|e| OpError::validation(format!("invalid arguments for {}: {e}", self.tool)))
    }
}

pub struct Orchestrator {
    executor: Arc<dyn CommandExecutor>,
    inspector: Arc<dyn Inspector>,
    gateway: ApprovalGateway,
    workflows: WorkflowEngine,
    settings: Settings,
}

impl Orchestrator {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        inspector: Arc<dyn Inspector>,
        oracle: Box<dyn ApprovalOracle>,
        settings: Settings,
    ) -> Self {
        let workflows = WorkflowEngine::new(
            Arc::clone(&executor),
            Arc::clone(&inspector),
            settings.command_timeout,
        );
        Self {
            executor,
            inspector,
            gateway: ApprovalGateway::new(oracle),
            workflows,
            settings,
        }
    }

    /// Process-backed orchestrator built from configuration.
    pub fn from_config(config: &GitopsConfig) -> AnyResult<Self> {
        config.validate()?;
        let executor = Arc::new(GitExecutor::new(
            config.git_binary.clone(),
            config.output_limit_bytes,
        ));
        let inspector = Arc::new(GitInspector::new(
            config.git_binary.clone(),
            config.command_timeout(),
            config.output_limit_bytes,
        ));
        let oracle = oracle_from_config(&config.approval)?;
        Ok(Self::new(
            executor,
            inspector,
            oracle,
            Settings {
                command_timeout: config.command_timeout(),
                default_log_count: config.default_log_count,
            },
        ))
    }

    pub fn inspector(&self) -> &dyn Inspector {
        self.inspector.as_ref()
    }

    pub fn gateway(&self) -> &ApprovalGateway {
        &self.gateway
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    /// Run one command; a non-zero exit becomes `OperationFailed`.
    fn run(
        &self,
        workdir: &Path,
        command: GitCommand,
        args: Vec<String>,
    ) -> Result<CommandResult, OpError> {
        let result = self
            .executor
            .execute(workdir, command, &args, self.settings.command_timeout)?;
        if !result.success() {
            return Err(OpError::OperationFailed {
                command: describe(command, &args),
                exit_code: result.exit_code,
                detail: result.failure_detail(),
            });
        }
        Ok(result)
    }

    fn run_in(
        &self,
        inv: &Invocation,
        command: GitCommand,
        args: Vec<String>,
    ) -> Result<CommandResult, OpError> {
        self.run(inv.repo()?.workdir(), command, args)
    }

    /// Pass the approval gate for `class`, keyed by `key`. Classes that need
    /// no approval return `None` without touching the gateway.
    fn approve(
        &self,
        key: &Path,
        inv: &Invocation,
        class: ApprovalClass,
    ) -> Result<Option<ApprovalTicket<'_>>, OpError> {
        if !class.requires_approval() {
            return Ok(None);
        }
        self.gateway
            .request_approval(key, inv.tool, class, &inv.arguments)
            .map(Some)
    }

    /// Admit a mutating call on an existing repository. Anything but
    /// continue or abort is refused while a workflow is active.
    fn guard(
        &self,
        inv: &Invocation,
        class: ApprovalClass,
    ) -> Result<Option<ApprovalTicket<'_>>, OpError> {
        let handle = inv.repo()?;
        self.workflows.ensure_idle(handle)?;
        self.approve(handle.key(), inv, class)
    }

    #[instrument(skip_all, fields(tool = inv.tool))]
    fn start_workflow(
        &self,
        inv: &Invocation,
        class: ApprovalClass,
        start: &WorkflowStart,
    ) -> Result<Value, OpError> {
        let _ticket = self.guard(inv, class)?;
        let report = self.workflows.start(inv.repo()?, start)?;
        Ok(json!(report))
    }
}

fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|a| (*a).to_string()).collect()
}

fn output(result: &CommandResult) -> Value {
    json!({ "output": result.stdout, "command": result })
}

fn absolute(field: &str, value: &str) -> Result<PathBuf, OpError> {
    validate::local_path(field, value)?;
    std::path::absolute(value)
        .map_err(|e| OpError::validation(format!("{field} '{value}': {e}")))
}

fn stash_ref(index: Option<usize>) -> Vec<String> {
    index
        .map(|i| vec![format!("stash@{{{i}}}")])
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct CloneArgs {
    source_url: String,
    destination_path: String,
}

pub fn clone(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: CloneArgs = inv.parse()?;
    validate::url("source_url", &args.source_url)?;
    let destination = absolute("destination_path", &args.destination_path)?;
    let parent = destination
        .parent()
        .filter(|p| p.is_dir())
        .ok_or_else(|| {
            OpError::validation(format!(
                "destination_path '{}': parent directory does not exist",
                args.destination_path
            ))
        })?;

    let _ticket = orch.approve(&destination, inv, inv.class)?;
    let result = orch.run(
        parent,
        GitCommand::Clone,
        vec![
            "--".to_string(),
            args.source_url,
            destination.to_string_lossy().into_owned(),
        ],
    )?;
    Ok(json!({ "destination": destination, "command": result }))
}

#[derive(Deserialize)]
struct InitArgs {
    repo_path: String,
}

pub fn init(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: InitArgs = inv.parse()?;
    let path = absolute("repo_path", &args.repo_path)?;
    fs::create_dir_all(&path)
        .map_err(|e| OpError::inspection(format!("create {}: {e}", path.display())))?;
    let result = orch.run(&path, GitCommand::Init, Vec::new())?;
    Ok(output(&result))
}

#[derive(Deserialize)]
struct PullArgs {
    remote_name: String,
    branch: String,
}

pub fn pull(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: PullArgs = inv.parse()?;
    validate::ref_name("remote_name", &args.remote_name)?;
    validate::ref_name("branch", &args.branch)?;
    orch.start_workflow(
        inv,
        inv.class,
        &WorkflowStart::pull(&args.remote_name, &args.branch),
    )
}

#[derive(Deserialize)]
struct PushArgs {
    remote_name: String,
    branch: String,
    #[serde(default)]
    force: bool,
}

pub fn push(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: PushArgs = inv.parse()?;
    validate::ref_name("remote_name", &args.remote_name)?;
    validate::ref_name("branch", &args.branch)?;
    let class = if args.force {
        inv.class.escalate(ApprovalClass::HistoryRewriting)
    } else {
        inv.class
    };
    let _ticket = orch.guard(inv, class)?;

    let mut git_args = Vec::new();
    if args.force {
        git_args.push("--force".to_string());
    }
    git_args.extend([args.remote_name, args.branch]);
    let result = orch.run_in(inv, GitCommand::Push, git_args)?;
    Ok(output(&result))
}

#[derive(Deserialize)]
struct FetchArgs {
    remote_name: String,
    #[serde(default)]
    prune: bool,
}

pub fn fetch(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: FetchArgs = inv.parse()?;
    validate::ref_name("remote_name", &args.remote_name)?;
    let _ticket = orch.guard(inv, inv.class)?;

    let mut git_args = Vec::new();
    if args.prune {
        git_args.push("--prune".to_string());
    }
    git_args.push(args.remote_name);
    let result = orch.run_in(inv, GitCommand::Fetch, git_args)?;
    Ok(output(&result))
}

#[derive(Deserialize)]
struct MergeArgs {
    source_branch: String,
}

pub fn merge(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: MergeArgs = inv.parse()?;
    validate::revision("source_branch", &args.source_branch)?;
    let handle = inv.repo()?;
    let fast_forward = match orch
        .inspector
        .is_ancestor(handle, "HEAD", &args.source_branch)
    {
        Ok(fast_forward) => fast_forward,
        Err(err) => {
            debug!(err = %err, "ancestry check failed; treating merge as diverged");
            false
        }
    };
    let class = if fast_forward {
        inv.class
    } else {
        inv.class.escalate(ApprovalClass::HistoryRewriting)
    };
    orch.start_workflow(inv, class, &WorkflowStart::merge(&args.source_branch))
}

#[derive(Deserialize)]
struct RebaseArgs {
    onto_branch: String,
}

pub fn rebase(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: RebaseArgs = inv.parse()?;
    validate::revision("onto_branch", &args.onto_branch)?;
    orch.start_workflow(inv, inv.class, &WorkflowStart::rebase(&args.onto_branch))
}

#[derive(Deserialize)]
struct CherryPickArgs {
    commit_id: String,
}

pub fn cherry_pick(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: CherryPickArgs = inv.parse()?;
    validate::revision("commit_id", &args.commit_id)?;
    orch.start_workflow(inv, inv.class, &WorkflowStart::cherry_pick(&args.commit_id))
}

#[derive(Deserialize)]
struct ContinueArgs {
    paths: Option<Vec<String>>,
}

pub fn resume(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: ContinueArgs = inv.parse()?;
    for path in args.paths.iter().flatten() {
        validate::repo_path("paths", path)?;
    }
    let report = orch.workflows.resume(inv.repo()?, args.paths)?;
    Ok(json!(report))
}

pub fn abort(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let report = orch.workflows.abort(inv.repo()?)?;
    Ok(json!(report))
}

pub fn workflow_status(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let handle = inv.repo()?;
    let session = orch.workflows.session(handle)?;
    let pending = orch.gateway.pending(handle.key());
    Ok(json!({ "session": session, "pending_approval": pending }))
}

#[derive(Deserialize)]
struct StashPushArgs {
    message: Option<String>,
}

pub fn stash_push(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: StashPushArgs = inv.parse()?;
    let mut git_args = strings(["push", "--include-untracked"]);
    if let Some(message) = args.message {
        validate::message("message", &message)?;
        git_args.extend(["-m".to_string(), message]);
    }
    let _ticket = orch.guard(inv, inv.class)?;
    let result = orch.run_in(inv, GitCommand::Stash, git_args)?;
    Ok(output(&result))
}

#[derive(Deserialize)]
struct StashIndexArgs {
    index: Option<usize>,
}

fn stash_with_index(
    orch: &Orchestrator,
    inv: &Invocation,
    subcommand: &str,
) -> Result<Value, OpError> {
    let args: StashIndexArgs = inv.parse()?;
    let mut git_args = vec![subcommand.to_string()];
    git_args.extend(stash_ref(args.index));
    let _ticket = orch.guard(inv, inv.class)?;
    let result = orch.run_in(inv, GitCommand::Stash, git_args)?;
    Ok(output(&result))
}

pub fn stash_pop(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    stash_with_index(orch, inv, "pop")
}

pub fn stash_apply(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    stash_with_index(orch, inv, "apply")
}

pub fn stash_drop(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    stash_with_index(orch, inv, "drop")
}

pub fn stash_list(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let status = orch.inspector.inspect(inv.repo()?)?;
    Ok(json!({ "entries": status.stash_entries }))
}

#[derive(Deserialize)]
struct TagCreateArgs {
    name: String,
    #[serde(rename = "ref")]
    target: Option<String>,
    message: Option<String>,
}

pub fn tag_create(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: TagCreateArgs = inv.parse()?;
    validate::ref_name("name", &args.name)?;
    let mut git_args = Vec::new();
    if let Some(message) = args.message {
        validate::message("message", &message)?;
        git_args.extend(["-a".to_string(), "-m".to_string(), message]);
    }
    git_args.push(args.name);
    if let Some(target) = args.target {
        validate::revision("ref", &target)?;
        git_args.push(target);
    }
    let _ticket = orch.guard(inv, inv.class)?;
    let result = orch.run_in(inv, GitCommand::Tag, git_args)?;
    Ok(output(&result))
}

pub fn tag_list(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let result = orch.run_in(inv, GitCommand::Tag, strings(["--list"]))?;
    Ok(json!({ "tags": parse_lines(&result.stdout) }))
}

#[derive(Deserialize)]
struct LineRange {
    start: u32,
    end: u32,
}

#[derive(Deserialize)]
struct BlameArgs {
    path: String,
    range: Option<LineRange>,
}

pub fn blame(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: BlameArgs = inv.parse()?;
    validate::repo_path("path", &args.path)?;
    let mut git_args = Vec::new();
    if let Some(range) = args.range {
        if range.end < range.start {
            return Err(OpError::validation(format!(
                "range: end {} is before start {}",
                range.end, range.start
            )));
        }
        git_args.push(format!("-L{},{}", range.start, range.end));
    }
    git_args.extend(["--".to_string(), args.path]);
    let result = orch.run_in(inv, GitCommand::Blame, git_args)?;
    Ok(output(&result))
}

#[derive(Deserialize)]
struct RemoteAddArgs {
    name: String,
    url: String,
}

pub fn remote_add(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: RemoteAddArgs = inv.parse()?;
    validate::ref_name("name", &args.name)?;
    validate::url("url", &args.url)?;
    let _ticket = orch.guard(inv, inv.class)?;
    let result = orch.run_in(
        inv,
        GitCommand::Remote,
        vec!["add".to_string(), args.name, args.url],
    )?;
    Ok(output(&result))
}

#[derive(Deserialize)]
struct RemoteRemoveArgs {
    name: String,
}

pub fn remote_remove(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: RemoteRemoveArgs = inv.parse()?;
    validate::ref_name("name", &args.name)?;
    let _ticket = orch.guard(inv, inv.class)?;
    let result = orch.run_in(
        inv,
        GitCommand::Remote,
        vec!["remove".to_string(), args.name],
    )?;
    Ok(output(&result))
}

pub fn remote_list(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let result = orch.run_in(inv, GitCommand::Remote, strings(["-v"]))?;
    let remotes = parse_remotes(&result.stdout).map_err(OpError::inspection)?;
    Ok(json!({ "remotes": remotes }))
}

pub fn approval_cancel(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let cancelled = orch.gateway.cancel(inv.repo()?.key());
    Ok(json!({ "cancelled": cancelled }))
}

pub fn status(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let result = orch.run_in(inv, GitCommand::Status, Vec::new())?;
    Ok(output(&result))
}

pub fn diff_unstaged(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let result = orch.run_in(inv, GitCommand::Diff, Vec::new())?;
    Ok(output(&result))
}

pub fn diff_staged(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let result = orch.run_in(inv, GitCommand::Diff, strings(["--cached"]))?;
    Ok(output(&result))
}

#[derive(Deserialize)]
struct DiffArgs {
    target: String,
}

pub fn diff(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: DiffArgs = inv.parse()?;
    validate::revision("target", &args.target)?;
    let result = orch.run_in(inv, GitCommand::Diff, vec![args.target, "--".to_string()])?;
    Ok(output(&result))
}

#[derive(Deserialize)]
struct CommitArgs {
    message: String,
}

pub fn commit(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: CommitArgs = inv.parse()?;
    validate::message("message", &args.message)?;
    let _ticket = orch.guard(inv, inv.class)?;
    let result = orch.run_in(inv, GitCommand::Commit, vec!["-m".to_string(), args.message])?;
    Ok(output(&result))
}

#[derive(Deserialize)]
struct AddArgs {
    files: Vec<String>,
}

pub fn add(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: AddArgs = inv.parse()?;
    for file in &args.files {
        validate::repo_path("files", file)?;
    }
    let mut git_args = vec!["--".to_string()];
    git_args.extend(args.files);
    let _ticket = orch.guard(inv, inv.class)?;
    let result = orch.run_in(inv, GitCommand::Add, git_args)?;
    Ok(output(&result))
}

pub fn reset(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let _ticket = orch.guard(inv, inv.class)?;
    let result = orch.run_in(inv, GitCommand::Reset, strings(["-q"]))?;
    Ok(output(&result))
}

#[derive(Deserialize)]
struct LogArgs {
    max_count: Option<u32>,
}

pub fn log(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: LogArgs = inv.parse()?;
    let max_count = args.max_count.unwrap_or(orch.settings.default_log_count);
    let result = orch.run_in(
        inv,
        GitCommand::Log,
        vec![format!("--max-count={max_count}"), LOG_FORMAT.to_string()],
    )?;
    let commits = parse_log(&result.stdout).map_err(OpError::inspection)?;
    Ok(json!({ "commits": commits }))
}

#[derive(Deserialize)]
struct CreateBranchArgs {
    branch_name: String,
    base_branch: Option<String>,
}

pub fn create_branch(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: CreateBranchArgs = inv.parse()?;
    validate::ref_name("branch_name", &args.branch_name)?;
    let mut git_args = vec![args.branch_name];
    if let Some(base) = args.base_branch {
        validate::revision("base_branch", &base)?;
        git_args.push(base);
    }
    let _ticket = orch.guard(inv, inv.class)?;
    let result = orch.run_in(inv, GitCommand::Branch, git_args)?;
    Ok(output(&result))
}

#[derive(Deserialize)]
struct CheckoutArgs {
    branch_name: String,
}

pub fn checkout(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: CheckoutArgs = inv.parse()?;
    validate::ref_name("branch_name", &args.branch_name)?;
    let _ticket = orch.guard(inv, inv.class)?;
    let result = orch.run_in(
        inv,
        GitCommand::Checkout,
        vec![args.branch_name, "--".to_string()],
    )?;
    Ok(output(&result))
}

#[derive(Deserialize)]
struct ShowArgs {
    revision: String,
}

pub fn show(orch: &Orchestrator, inv: &Invocation) -> Result<Value, OpError> {
    let args: ShowArgs = inv.parse()?;
    validate::revision("revision", &args.revision)?;
    let result = orch.run_in(inv, GitCommand::Show, vec![args.revision, "--".to_string()])?;
    Ok(output(&result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Decision, InProgressOperation, RepositoryStatus};
    use crate::registry::{Handler, Registry};
    use crate::test_support::{
        Scripted, ScriptedExecutor, ScriptedOracle, StaticInspector, clean_status,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        executor: Arc<ScriptedExecutor>,
        inspector: Arc<StaticInspector>,
        orch: Orchestrator,
    }

    fn fixture(script: Vec<Scripted>, decision: Decision) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = Arc::new(ScriptedExecutor::new(script));
        let inspector = Arc::new(StaticInspector::new(dir.path(), clean_status()));
        let orch = Orchestrator::new(
            Arc::clone(&executor) as Arc<dyn CommandExecutor>,
            Arc::clone(&inspector) as Arc<dyn Inspector>,
            Box::new(ScriptedOracle::fixed(decision)),
            Settings::default(),
        );
        Fixture {
            _dir: dir,
            executor,
            inspector,
            orch,
        }
    }

    fn call(fx: &Fixture, tool: &'static str, arguments: Value) -> Invocation {
        let registry = Registry::builtin().expect("registry");
        Invocation {
            tool,
            class: registry.get(tool).expect("registered").class,
            handle: Some(fx.inspector.handle()),
            arguments,
        }
    }

    fn merge_in_progress() -> RepositoryStatus {
        RepositoryStatus {
            in_progress_operation: InProgressOperation::Merge,
            conflicted_paths: ["a.txt".to_string()].into(),
            is_dirty: true,
            ..clean_status()
        }
    }

    #[test]
    fn denied_push_never_executes() {
        let fx = fixture(Vec::new(), Decision::Denied);
        let inv = call(&fx, "push", json!({"remote_name": "origin", "branch": "main"}));
        let err = push(&fx.orch, &inv).expect_err("denied");
        assert_eq!(err.kind(), "approval_denied");
        assert_eq!(fx.executor.call_count(), 0);
    }

    #[test]
    fn approved_force_push_passes_flag() {
        let fx = fixture(vec![Scripted::ok("")], Decision::Approved);
        let inv = call(
            &fx,
            "push",
            json!({"remote_name": "origin", "branch": "main", "force": true}),
        );
        push(&fx.orch, &inv).expect("push");
        assert_eq!(
            fx.executor.calls(),
            vec![(GitCommand::Push, strings(["--force", "origin", "main"]))]
        );
        assert!(fx.orch.gateway().pending(fx.inspector.handle().key()).is_none());
    }

    #[test]
    fn push_escalates_from_the_registered_class() {
        let fx = fixture(vec![Scripted::ok("")], Decision::Denied);
        let mut inv = call(&fx, "push", json!({"remote_name": "origin", "branch": "main"}));
        inv.class = ApprovalClass::Local;
        push(&fx.orch, &inv).expect("ungated push");

        inv.arguments["force"] = json!(true);
        let err = push(&fx.orch, &inv).expect_err("forced push is gated");
        assert_eq!(err.kind(), "approval_denied");
        assert_eq!(fx.executor.call_count(), 1);
    }

    #[test]
    fn mutating_tools_are_refused_during_a_workflow() {
        let fx = fixture(Vec::new(), Decision::Approved);
        fx.inspector.set_status(merge_in_progress());
        let cases: [(&'static str, Handler, Value); 12] = [
            ("reset", reset, json!({})),
            ("commit", commit, json!({"message": "wip"})),
            ("checkout", checkout, json!({"branch_name": "main"})),
            ("add", add, json!({"files": ["a.txt"]})),
            ("stash_push", stash_push, json!({})),
            ("stash_pop", stash_pop, json!({})),
            ("tag_create", tag_create, json!({"name": "v1"})),
            ("create_branch", create_branch, json!({"branch_name": "topic"})),
            ("push", push, json!({"remote_name": "origin", "branch": "main"})),
            ("fetch", fetch, json!({"remote_name": "origin"})),
            ("remote_add", remote_add, json!({"name": "m", "url": "https://example.com/r.git"})),
            ("remote_remove", remote_remove, json!({"name": "origin"})),
        ];
        for (tool, handler, arguments) in cases {
            let err = handler(&fx.orch, &call(&fx, tool, arguments)).expect_err(tool);
            assert_eq!(err.kind(), "state_conflict", "{tool}");
        }
        assert_eq!(fx.executor.call_count(), 0);
        assert!(fx.orch.gateway().pending(fx.inspector.handle().key()).is_none());
    }

    #[test]
    fn reads_proceed_during_a_workflow() {
        let fx = fixture(
            vec![Scripted::ok(""), Scripted::ok(""), Scripted::ok("")],
            Decision::Denied,
        );
        fx.inspector.set_status(merge_in_progress());
        status(&fx.orch, &call(&fx, "status", json!({}))).expect("status");
        diff_unstaged(&fx.orch, &call(&fx, "diff_unstaged", json!({}))).expect("diff");
        blame(&fx.orch, &call(&fx, "blame", json!({"path": "a.txt"}))).expect("blame");
        let session = workflow_status(&fx.orch, &call(&fx, "workflow_status", json!({})))
            .expect("workflow_status");
        assert_eq!(session["session"]["phase"], "conflicted");
        fx.executor.assert_drained().expect("drained");
    }

    #[test]
    fn fast_forward_merge_skips_approval() {
        let fx = fixture(vec![Scripted::ok("Fast-forward\n")], Decision::Denied);
        fx.inspector.set_fast_forward(true);
        let inv = call(&fx, "merge", json!({"source_branch": "feature"}));
        let value = merge(&fx.orch, &inv).expect("merge");
        assert_eq!(value["phase"], "completed");
        fx.executor.assert_drained().expect("drained");
    }

    #[test]
    fn diverged_merge_requires_approval() {
        let fx = fixture(Vec::new(), Decision::Denied);
        let inv = call(&fx, "merge", json!({"source_branch": "feature"}));
        let err = merge(&fx.orch, &inv).expect_err("denied");
        assert_eq!(err.kind(), "approval_denied");
        assert_eq!(fx.executor.call_count(), 0);
    }

    #[test]
    fn option_like_values_are_rejected_before_execution() {
        let fx = fixture(Vec::new(), Decision::Approved);
        let cases = [
            ("checkout", json!({"branch_name": "--orphan"})),
            ("show", json!({"revision": "-p"})),
            ("add", json!({"files": ["../outside.txt"]})),
            ("blame", json!({"path": "/etc/passwd"})),
            ("remote_add", json!({"name": "evil", "url": "ext::sh -c touch% /tmp/x"})),
        ];
        for (tool, arguments) in cases {
            let inv = call(&fx, tool, arguments);
            let handler = match tool {
                "checkout" => checkout,
                "show" => show,
                "add" => add,
                "blame" => blame,
                _ => remote_add,
            };
            let err = handler(&fx.orch, &inv).expect_err(tool);
            assert_eq!(err.kind(), "validation_error", "{tool}");
        }
        assert_eq!(fx.executor.call_count(), 0);
    }

    #[test]
    fn blame_range_is_passed_as_line_option() {
        let fx = fixture(vec![Scripted::ok("")], Decision::Denied);
        let inv = call(
            &fx,
            "blame",
            json!({"path": "src/lib.rs", "range": {"start": 3, "end": 7}}),
        );
        blame(&fx.orch, &inv).expect("blame");
        assert_eq!(
            fx.executor.calls(),
            vec![(GitCommand::Blame, strings(["-L3,7", "--", "src/lib.rs"]))]
        );
    }

    #[test]
    fn inverted_blame_range_is_rejected() {
        let fx = fixture(Vec::new(), Decision::Denied);
        let inv = call(
            &fx,
            "blame",
            json!({"path": "a.txt", "range": {"start": 7, "end": 3}}),
        );
        assert_eq!(blame(&fx.orch, &inv).expect_err("range").kind(), "validation_error");
    }

    #[test]
    fn log_uses_default_count() {
        let fx = fixture(vec![Scripted::ok("")], Decision::Denied);
        let inv = call(&fx, "log", json!({}));
        let value = log(&fx.orch, &inv).expect("log");
        assert_eq!(value["commits"], json!([]));
        assert_eq!(fx.executor.calls()[0].1[0], "--max-count=10");
    }

    #[test]
    fn stash_index_becomes_stash_ref() {
        let fx = fixture(vec![Scripted::ok("")], Decision::Denied);
        let inv = call(&fx, "stash_drop", json!({"index": 2}));
        stash_drop(&fx.orch, &inv).expect("drop");
        assert_eq!(
            fx.executor.calls(),
            vec![(GitCommand::Stash, strings(["drop", "stash@{2}"]))]
        );
    }

    #[test]
    fn failed_command_is_operation_failed() {
        let fx = fixture(
            vec![Scripted::exit(1, "", "error: pathspec 'nope' did not match")],
            Decision::Denied,
        );
        let inv = call(&fx, "checkout", json!({"branch_name": "nope"}));
        let err = checkout(&fx.orch, &inv).expect_err("fails");
        assert_eq!(err.kind(), "operation_failed");
        assert!(err.to_string().contains("did not match"));
    }
}
