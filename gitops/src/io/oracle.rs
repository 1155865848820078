//! Approval oracles selected by `approval.mode`.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::approval::{ApprovalOracle, ApprovalRequest};
use crate::core::types::Decision;
use crate::io::config::{ApprovalConfig, ApprovalMode};

pub struct ApproveAll;

impl ApprovalOracle for ApproveAll {
    fn request_decision(&self, _request: &ApprovalRequest) -> Decision {
        Decision::Approved
    }
}

pub struct DenyAll;

impl ApprovalOracle for DenyAll {
    fn request_decision(&self, request: &ApprovalRequest) -> Decision {
        debug!(operation = %request.operation_name, "approval mode is deny");
        Decision::Denied
    }
}

/// Asks an external program. The request is written to its stdin as JSON;
/// exit status 0 approves. The program may take as long as it needs.
pub struct CommandOracle {
    argv: Vec<String>,
}

impl CommandOracle {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.first().is_none_or(|c| c.trim().is_empty()) {
            return Err(anyhow!("approval command must be a non-empty array"));
        }
        Ok(Self { argv })
    }

    fn ask(&self, request: &ApprovalRequest) -> Result<bool> {
        let payload = serde_json::to_vec(request).context("serialize approval request")?;
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn approval command {}", self.argv[0]))?;
        if let Some(mut stdin) = child.stdin.take() {
            // A command that decides without reading closes the pipe early.
            if let Err(err) = stdin.write_all(&payload) {
                debug!(err = %err, "approval command did not read the request");
            }
        }
        let status = child.wait().context("wait for approval command")?;
        Ok(status.success())
    }
}

impl ApprovalOracle for CommandOracle {
    fn request_decision(&self, request: &ApprovalRequest) -> Decision {
        match self.ask(request) {
            Ok(true) => Decision::Approved,
            Ok(false) => Decision::Denied,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "approval command failed; denying");
                Decision::Denied
            }
        }
    }
}

pub fn oracle_from_config(config: &ApprovalConfig) -> Result<Box<dyn ApprovalOracle>> {
    Ok(match config.mode {
        ApprovalMode::Deny => Box::new(DenyAll),
        ApprovalMode::Approve => Box::new(ApproveAll),
        ApprovalMode::Command => Box::new(CommandOracle::new(config.command.clone())?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ApprovalClass;
    use chrono::Utc;
    use serde_json::json;
    use std::path::PathBuf;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            repository: PathBuf::from("/repos/a"),
            operation_name: "push".to_string(),
            class: ApprovalClass::RemoteMutating,
            arguments: json!({"remote_name": "origin"}),
            requested_at: Utc::now(),
        }
    }

    fn sh(script: &str) -> CommandOracle {
        CommandOracle::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
            .expect("oracle")
    }

    #[test]
    fn exit_zero_approves() {
        assert_eq!(sh("cat >/dev/null; exit 0").request_decision(&request()), Decision::Approved);
    }

    #[test]
    fn nonzero_exit_denies() {
        assert_eq!(sh("exit 1").request_decision(&request()), Decision::Denied);
    }

    #[test]
    fn command_receives_request_json() {
        let oracle = sh("grep -q '\"operation_name\":\"push\"'");
        assert_eq!(oracle.request_decision(&request()), Decision::Approved);
    }

    #[test]
    fn spawn_failure_denies() {
        let oracle = CommandOracle::new(vec!["/definitely/not/here".to_string()]).expect("oracle");
        assert_eq!(oracle.request_decision(&request()), Decision::Denied);
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert!(CommandOracle::new(Vec::new()).is_err());
    }

    #[test]
    fn fixed_modes() {
        let approve = oracle_from_config(&ApprovalConfig {
            mode: ApprovalMode::Approve,
            command: Vec::new(),
        })
        .expect("approve");
        assert_eq!(approve.request_decision(&request()), Decision::Approved);
        let deny = oracle_from_config(&ApprovalConfig::default()).expect("deny");
        assert_eq!(deny.request_decision(&request()), Decision::Denied);
    }
}
