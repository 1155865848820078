//! Tool registry: name → description, input schema, approval class, handler.
//!
//! Schemas are JSON Schema 2020-12, compiled once when the registry is built.
//! Every schema closes the object (`additionalProperties: false`).

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::core::types::ApprovalClass;
use crate::error::OpError;
use crate::ops::{self, Invocation, Orchestrator};

pub type Handler = fn(&Orchestrator, &Invocation) -> Result<Value, OpError>;

/// Where the repository for a call comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// An existing repository named by `repo_path` (or the default one),
    /// resolved before the handler runs.
    Repository,
    /// A path the handler creates; resolved after the handler for status.
    Creates(&'static str),
}

pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Class before any argument-dependent escalation (force push, diverged
    /// merge).
    pub class: ApprovalClass,
    pub target: Target,
    pub schema: Value,
    pub handler: Handler,
    validator: Validator,
}

impl ToolSpec {
    /// Check `arguments` against the input schema.
    pub fn validate(&self, arguments: &Value) -> Result<(), OpError> {
        let messages: Vec<String> = self
            .validator
            .iter_errors(arguments)
            .map(|err| err.to_string())
            .collect();
        if messages.is_empty() {
            Ok(())
        } else {
            Err(OpError::validation(format!(
                "invalid arguments for {}: {}",
                self.name,
                messages.join("; ")
            )))
        }
    }
}

/// Public description of one tool, as returned by `list_tools`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub approval_class: ApprovalClass,
    pub input_schema: Value,
}

pub struct Registry {
    tools: BTreeMap<&'static str, ToolSpec>,
}

impl Registry {
    /// Registry with every built-in tool.
    pub fn builtin() -> Result<Self> {
        let mut tools = BTreeMap::new();
        for def in definitions() {
            let validator = jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&def.schema)
                .with_context(|| format!("compile input schema for {}", def.name))?;
            tools.insert(
                def.name,
                ToolSpec {
                    name: def.name,
                    description: def.description,
                    class: def.class,
                    target: def.target,
                    schema: def.schema,
                    handler: def.handler,
                    validator,
                },
            );
        }
        Ok(Self { tools })
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn list(&self) -> Vec<ToolInfo> {
        self.tools
            .values()
            .map(|spec| ToolInfo {
                name: spec.name,
                description: spec.description,
                approval_class: spec.class,
                input_schema: spec.schema.clone(),
            })
            .collect()
    }
}

struct Definition {
    name: &'static str,
    description: &'static str,
    class: ApprovalClass,
    target: Target,
    schema: Value,
    handler: Handler,
}

fn string() -> Value {
    json!({"type": "string", "minLength": 1})
}

fn stash_index() -> Value {
    json!({"type": "integer", "minimum": 0})
}

/// Object schema for a repository tool; `repo_path` is always accepted and
/// optional (the dispatcher may supply a default repository).
fn repo_schema(required: &[&str], properties: Value) -> Value {
    let mut props = match properties {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    props.insert("repo_path".to_string(), string());
    json!({
        "type": "object",
        "properties": props,
        "required": required,
        "additionalProperties": false,
    })
}

fn path_schema(required: &[&str], properties: Value) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

fn repo_tool(
    name: &'static str,
    description: &'static str,
    class: ApprovalClass,
    schema: Value,
    handler: Handler,
) -> Definition {
    Definition {
        name,
        description,
        class,
        target: Target::Repository,
        schema,
        handler,
    }
}

fn definitions() -> Vec<Definition> {
    use ApprovalClass::{HistoryRewriting, Local, ReadOnly, RemoteMutating};

    vec![
        Definition {
            name: "clone",
            description: "Clone a repository into a new directory",
            class: RemoteMutating,
            target: Target::Creates("destination_path"),
            schema: path_schema(
                &["source_url", "destination_path"],
                json!({"source_url": string(), "destination_path": string()}),
            ),
            handler: ops::clone,
        },
        Definition {
            name: "init",
            description: "Initialize a new Git repository",
            class: Local,
            target: Target::Creates("repo_path"),
            schema: path_schema(&["repo_path"], json!({"repo_path": string()})),
            handler: ops::init,
        },
        repo_tool(
            "pull",
            "Fetch from a remote and merge; conflicts leave a merge workflow to continue or abort",
            RemoteMutating,
            repo_schema(
                &["remote_name", "branch"],
                json!({"remote_name": string(), "branch": string()}),
            ),
            ops::pull,
        ),
        repo_tool(
            "push",
            "Push a branch to a remote; force pushes are history-rewriting",
            RemoteMutating,
            repo_schema(
                &["remote_name", "branch"],
                json!({
                    "remote_name": string(),
                    "branch": string(),
                    "force": {"type": "boolean", "default": false},
                }),
            ),
            ops::push,
        ),
        repo_tool(
            "fetch",
            "Fetch from a remote",
            RemoteMutating,
            repo_schema(
                &["remote_name"],
                json!({
                    "remote_name": string(),
                    "prune": {"type": "boolean", "default": false},
                }),
            ),
            ops::fetch,
        ),
        repo_tool(
            "merge",
            "Merge a branch into the current branch; history-rewriting unless it fast-forwards",
            Local,
            repo_schema(&["source_branch"], json!({"source_branch": string()})),
            ops::merge,
        ),
        repo_tool(
            "rebase",
            "Rebase the current branch onto another branch",
            HistoryRewriting,
            repo_schema(&["onto_branch"], json!({"onto_branch": string()})),
            ops::rebase,
        ),
        repo_tool(
            "cherry_pick",
            "Apply the change introduced by a commit",
            HistoryRewriting,
            repo_schema(&["commit_id"], json!({"commit_id": string()})),
            ops::cherry_pick,
        ),
        repo_tool(
            "continue",
            "Stage resolved paths (default: the conflicted paths) and continue the active merge, rebase or cherry-pick",
            Local,
            repo_schema(
                &[],
                json!({"paths": {"type": "array", "items": string(), "minItems": 1}}),
            ),
            ops::resume,
        ),
        repo_tool(
            "abort",
            "Abort the active merge, rebase or cherry-pick",
            Local,
            repo_schema(&[], json!({})),
            ops::abort,
        ),
        repo_tool(
            "workflow_status",
            "Show the active workflow session and pending approval",
            ReadOnly,
            repo_schema(&[], json!({})),
            ops::workflow_status,
        ),
        repo_tool(
            "stash_push",
            "Stash working tree changes",
            Local,
            repo_schema(&[], json!({"message": string()})),
            ops::stash_push,
        ),
        repo_tool(
            "stash_pop",
            "Apply a stash entry and remove it",
            Local,
            repo_schema(&[], json!({"index": stash_index()})),
            ops::stash_pop,
        ),
        repo_tool(
            "stash_apply",
            "Apply a stash entry without removing it",
            Local,
            repo_schema(&[], json!({"index": stash_index()})),
            ops::stash_apply,
        ),
        repo_tool(
            "stash_drop",
            "Remove a stash entry",
            Local,
            repo_schema(&[], json!({"index": stash_index()})),
            ops::stash_drop,
        ),
        repo_tool(
            "stash_list",
            "List stash entries",
            ReadOnly,
            repo_schema(&[], json!({})),
            ops::stash_list,
        ),
        repo_tool(
            "tag_create",
            "Create a tag at a revision (default HEAD); annotated when a message is given",
            Local,
            repo_schema(
                &["name"],
                json!({"name": string(), "ref": string(), "message": string()}),
            ),
            ops::tag_create,
        ),
        repo_tool(
            "tag_list",
            "List tags",
            ReadOnly,
            repo_schema(&[], json!({})),
            ops::tag_list,
        ),
        repo_tool(
            "blame",
            "Show what revision and author last modified each line of a file",
            ReadOnly,
            repo_schema(
                &["path"],
                json!({
                    "path": string(),
                    "range": {
                        "type": "object",
                        "properties": {
                            "start": {"type": "integer", "minimum": 1},
                            "end": {"type": "integer", "minimum": 1},
                        },
                        "required": ["start", "end"],
                        "additionalProperties": false,
                    },
                }),
            ),
            ops::blame,
        ),
        repo_tool(
            "remote_add",
            "Add a remote",
            RemoteMutating,
            repo_schema(&["name", "url"], json!({"name": string(), "url": string()})),
            ops::remote_add,
        ),
        repo_tool(
            "remote_remove",
            "Remove a remote",
            RemoteMutating,
            repo_schema(&["name"], json!({"name": string()})),
            ops::remote_remove,
        ),
        repo_tool(
            "remote_list",
            "List remotes with their URLs",
            ReadOnly,
            repo_schema(&[], json!({})),
            ops::remote_list,
        ),
        repo_tool(
            "approval_cancel",
            "Cancel the pending approval for the repository",
            Local,
            repo_schema(&[], json!({})),
            ops::approval_cancel,
        ),
        repo_tool(
            "status",
            "Show the working tree status",
            ReadOnly,
            repo_schema(&[], json!({})),
            ops::status,
        ),
        repo_tool(
            "diff_unstaged",
            "Show changes in the working directory that are not yet staged",
            ReadOnly,
            repo_schema(&[], json!({})),
            ops::diff_unstaged,
        ),
        repo_tool(
            "diff_staged",
            "Show changes that are staged for commit",
            ReadOnly,
            repo_schema(&[], json!({})),
            ops::diff_staged,
        ),
        repo_tool(
            "diff",
            "Show differences between the working tree and a branch or commit",
            ReadOnly,
            repo_schema(&["target"], json!({"target": string()})),
            ops::diff,
        ),
        repo_tool(
            "commit",
            "Record staged changes",
            Local,
            repo_schema(&["message"], json!({"message": string()})),
            ops::commit,
        ),
        repo_tool(
            "add",
            "Stage file contents",
            Local,
            repo_schema(
                &["files"],
                json!({"files": {"type": "array", "items": string(), "minItems": 1}}),
            ),
            ops::add,
        ),
        repo_tool(
            "reset",
            "Unstage all staged changes",
            Local,
            repo_schema(&[], json!({})),
            ops::reset,
        ),
        repo_tool(
            "log",
            "Show commit logs",
            ReadOnly,
            repo_schema(
                &[],
                json!({"max_count": {"type": "integer", "minimum": 1, "maximum": 10000}}),
            ),
            ops::log,
        ),
        repo_tool(
            "create_branch",
            "Create a branch from an optional base branch",
            Local,
            repo_schema(
                &["branch_name"],
                json!({"branch_name": string(), "base_branch": string()}),
            ),
            ops::create_branch,
        ),
        repo_tool(
            "checkout",
            "Switch branches",
            Local,
            repo_schema(&["branch_name"], json!({"branch_name": string()})),
            ops::checkout,
        ),
        repo_tool(
            "show",
            "Show the contents of a commit",
            ReadOnly,
            repo_schema(&["revision"], json!({"revision": string()})),
            ops::show,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::builtin().expect("registry")
    }

    #[test]
    fn every_tool_schema_is_closed() {
        for info in registry().list() {
            assert_eq!(
                info.input_schema["additionalProperties"],
                Value::Bool(false),
                "{}",
                info.name
            );
        }
    }

    #[test]
    fn only_path_tools_lack_repo_path() {
        let registry = registry();
        for info in registry.list() {
            let has_repo = info.input_schema["properties"].get("repo_path").is_some();
            let target = registry.get(info.name).expect("spec").target;
            match target {
                Target::Repository => assert!(has_repo, "{}", info.name),
                Target::Creates(field) => {
                    assert!(info.input_schema["properties"].get(field).is_some());
                }
            }
        }
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let registry = registry();
        let err = registry
            .get("push")
            .expect("push")
            .validate(&json!({"remote_name": "origin"}))
            .expect_err("missing branch");
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("branch"));
    }

    #[test]
    fn unknown_property_is_rejected() {
        let registry = registry();
        let err = registry
            .get("status")
            .expect("status")
            .validate(&json!({"verbose": true}))
            .expect_err("unknown property");
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn wrong_type_is_rejected() {
        let registry = registry();
        let spec = registry.get("log").expect("log");
        assert!(spec.validate(&json!({"max_count": "ten"})).is_err());
        assert!(spec.validate(&json!({"max_count": 0})).is_err());
        spec.validate(&json!({"max_count": 5})).expect("valid");
    }

    #[test]
    fn blame_range_requires_both_bounds() {
        let registry = registry();
        let spec = registry.get("blame").expect("blame");
        assert!(spec.validate(&json!({"path": "a.txt", "range": {"start": 1}})).is_err());
        spec.validate(&json!({"path": "a.txt", "range": {"start": 1, "end": 3}}))
            .expect("valid");
    }

    #[test]
    fn gated_tools_declare_their_class() {
        let registry = registry();
        let class = |name: &str| registry.get(name).expect(name).class;
        assert_eq!(class("push"), ApprovalClass::RemoteMutating);
        assert_eq!(class("clone"), ApprovalClass::RemoteMutating);
        assert_eq!(class("rebase"), ApprovalClass::HistoryRewriting);
        assert_eq!(class("cherry_pick"), ApprovalClass::HistoryRewriting);
        assert_eq!(class("status"), ApprovalClass::ReadOnly);
        assert_eq!(class("commit"), ApprovalClass::Local);
    }
}
