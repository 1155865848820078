//! Request dispatch and the uniform response envelope.
//!
//! `dispatch` runs: lookup → schema validation → repository resolution →
//! handler → fresh inspection. Every outcome, including errors, becomes an
//! [`Envelope`].

use std::path::PathBuf;

use anyhow::Result as AnyResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{RepositoryHandle, RepositoryStatus};
use crate::core::validate;
use crate::error::OpError;
use crate::exit_codes;
use crate::ops::{Invocation, Orchestrator};
use crate::registry::{Registry, Target, ToolInfo, ToolSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub code: i32,
    pub message: String,
}

impl From<&OpError> for ErrorBody {
    fn from(err: &OpError) -> Self {
        Self {
            kind: err.kind(),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub status: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Fresh inspection after the call; `null` when no repository could be
    /// inspected.
    pub repository_status: Option<RepositoryStatus>,
}

impl Envelope {
    fn success(result: Value, repository_status: Option<RepositoryStatus>) -> Self {
        Self {
            status: Outcome::Success,
            result: Some(result),
            error: None,
            repository_status,
        }
    }

    fn failure(err: &OpError, repository_status: Option<RepositoryStatus>) -> Self {
        Self {
            status: Outcome::Failure,
            result: None,
            error: Some(err.into()),
            repository_status,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(exit_codes::OK, |e| e.code)
    }

    pub fn error_kind(&self) -> Option<&'static str> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// One line of the serving protocol.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Value,
    #[serde(flatten)]
    pub envelope: Envelope,
}

pub struct Dispatcher {
    registry: Registry,
    orchestrator: Orchestrator,
    default_repository: Option<PathBuf>,
}

impl Dispatcher {
    pub fn new(orchestrator: Orchestrator, default_repository: Option<PathBuf>) -> AnyResult<Self> {
        Ok(Self {
            registry: Registry::builtin()?,
            orchestrator,
            default_repository,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.registry.list()
    }

    /// Run `tool` with `arguments`. Never panics on bad input; every failure
    /// is reported in the envelope.
    #[instrument(skip_all, fields(tool = tool))]
    pub fn dispatch(&self, tool: &str, arguments: &Value) -> Envelope {
        let Some(spec) = self.registry.get(tool) else {
            warn!("unknown tool");
            return Envelope::failure(
                &OpError::UnknownOperation(tool.to_string()),
                None,
            );
        };
        let arguments = match arguments {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };

        if let Err(err) = spec.validate(&arguments) {
            debug!(err = %err, "schema validation failed");
            let handle = self.locate(spec, &arguments).ok().flatten();
            return Envelope::failure(&err, self.status_of(handle.as_ref()));
        }

        let handle = match self.locate(spec, &arguments) {
            Ok(handle) => handle,
            Err(err) => {
                debug!(err = %err, "repository resolution failed");
                return Envelope::failure(&err, None);
            }
        };

        let invocation = Invocation {
            tool: spec.name,
            class: spec.class,
            handle,
            arguments,
        };
        let outcome = (spec.handler)(&self.orchestrator, &invocation);

        let status = match spec.target {
            Target::Repository => self.status_of(invocation.handle.as_ref()),
            Target::Creates(field) => {
                let created = invocation.arguments[field]
                    .as_str()
                    .map(PathBuf::from)
                    .and_then(|path| self.orchestrator.inspector().resolve(&path).ok());
                self.status_of(created.as_ref())
            }
        };
        match outcome {
            Ok(result) => {
                info!("tool succeeded");
                Envelope::success(result, status)
            }
            Err(err) => {
                warn!(kind = err.kind(), err = %err, "tool failed");
                Envelope::failure(&err, status)
            }
        }
    }

    /// Handle one raw protocol line.
    pub fn handle_line(&self, line: &str) -> Response {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => Response {
                id: request.id,
                envelope: self.dispatch(&request.tool, &request.arguments),
            },
            Err(err) => Response {
                id: Value::Null,
                envelope: Envelope::failure(
                    &OpError::validation(format!("malformed request: {err}")),
                    None,
                ),
            },
        }
    }

    /// Resolve the repository a repository tool operates on.
    fn locate(
        &self,
        spec: &ToolSpec,
        arguments: &Value,
    ) -> Result<Option<RepositoryHandle>, OpError> {
        if spec.target != Target::Repository {
            return Ok(None);
        }
        let path = match arguments.get("repo_path").and_then(Value::as_str) {
            Some(raw) => {
                validate::local_path("repo_path", raw)?;
                PathBuf::from(raw)
            }
            None => self.default_repository.clone().ok_or_else(|| {
                OpError::validation(format!(
                    "{} requires repo_path (no default repository configured)",
                    spec.name
                ))
            })?,
        };
        self.orchestrator.inspector().resolve(&path).map(Some)
    }

    fn status_of(&self, handle: Option<&RepositoryHandle>) -> Option<RepositoryStatus> {
        let handle = handle?;
        match self.orchestrator.inspector().inspect(handle) {
            Ok(status) => Some(status),
            Err(err) => {
                warn!(err = %err, "post-call inspection failed");
                None
            }
        }
    }
}
