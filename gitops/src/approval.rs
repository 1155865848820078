//! Approval gateway for remote-mutating and history-rewriting operations.
//!
//! The gateway asks an injected [`ApprovalOracle`] for a decision and keeps
//! at most one [`PendingApproval`] per repository. The slot is held by the
//! returned [`ApprovalTicket`] until the gated operation finishes, so a second
//! gated request can never overtake an in-flight mutating command.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ApprovalClass, Decision, PendingApproval};
use crate::error::OpError;

/// Context handed to the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    pub repository: PathBuf,
    pub operation_name: String,
    pub class: ApprovalClass,
    pub arguments: Value,
    pub requested_at: DateTime<Utc>,
}

/// Source of human (or policy) decisions.
///
/// Implementations may block indefinitely; the gateway applies no timeout.
/// Returning [`Decision::Pending`] is treated as a denial.
pub trait ApprovalOracle: Send + Sync {
    fn request_decision(&self, request: &ApprovalRequest) -> Decision;
}

impl<T: ApprovalOracle + ?Sized> ApprovalOracle for Arc<T> {
    fn request_decision(&self, request: &ApprovalRequest) -> Decision {
        (**self).request_decision(request)
    }
}

pub struct ApprovalGateway {
    oracle: Box<dyn ApprovalOracle>,
    pending: Mutex<HashMap<PathBuf, PendingApproval>>,
}

impl ApprovalGateway {
    pub fn new(oracle: Box<dyn ApprovalOracle>) -> Self {
        Self {
            oracle,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PathBuf, PendingApproval>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the oracle decides on `operation_name` for `repository`.
    ///
    /// Fails with `StateConflict` if the repository already has a pending
    /// approval (or an approved operation still running), and with
    /// `ApprovalDenied` when the oracle denies or the request was cancelled
    /// while waiting.
    #[instrument(skip_all, fields(repository = %repository.display(), operation = operation_name))]
    pub fn request_approval(
        &self,
        repository: &Path,
        operation_name: &str,
        class: ApprovalClass,
        arguments: &Value,
    ) -> Result<ApprovalTicket<'_>, OpError> {
        let requested_at = Utc::now();
        {
            let mut slots = self.slots();
            if let Some(existing) = slots.get(repository) {
                warn!(
                    existing = %existing.operation_name,
                    "approval already pending for repository"
                );
                return Err(OpError::state_conflict(format!(
                    "`{}` is awaiting approval or still running on {}",
                    existing.operation_name,
                    repository.display()
                )));
            }
            slots.insert(
                repository.to_path_buf(),
                PendingApproval {
                    operation_name: operation_name.to_string(),
                    arguments: arguments.clone(),
                    requested_at,
                    decision: Decision::Pending,
                },
            );
        }
        // From here on the slot is ours; the ticket releases it on every path.
        let ticket = ApprovalTicket {
            gateway: self,
            repository: repository.to_path_buf(),
        };

        debug!("waiting for approval decision");
        let decision = self.oracle.request_decision(&ApprovalRequest {
            repository: repository.to_path_buf(),
            operation_name: operation_name.to_string(),
            class,
            arguments: arguments.clone(),
            requested_at,
        });

        let mut slots = self.slots();
        let cancelled = slots
            .get(repository)
            .is_some_and(|p| p.decision == Decision::Denied);
        if cancelled || decision != Decision::Approved {
            drop(slots);
            warn!(cancelled, ?decision, "approval denied");
            return Err(OpError::ApprovalDenied {
                operation: operation_name.to_string(),
            });
        }
        if let Some(pending) = slots.get_mut(repository) {
            pending.decision = Decision::Approved;
        }
        info!("approval granted");
        Ok(ticket)
    }

    /// Deny the pending approval for `repository`, if it is still waiting.
    ///
    /// Returns whether a waiting request was found. An approved operation
    /// that is already running is not affected.
    pub fn cancel(&self, repository: &Path) -> bool {
        let mut slots = self.slots();
        match slots.get_mut(repository) {
            Some(pending) if pending.decision == Decision::Pending => {
                pending.decision = Decision::Denied;
                info!(
                    repository = %repository.display(),
                    operation = %pending.operation_name,
                    "approval cancelled"
                );
                true
            }
            _ => false,
        }
    }

    pub fn pending(&self, repository: &Path) -> Option<PendingApproval> {
        self.slots().get(repository).cloned()
    }
}

/// Proof of approval. Dropping it clears the repository's pending slot.
#[must_use = "dropping the ticket releases the approval slot immediately"]
pub struct ApprovalTicket<'a> {
    gateway: &'a ApprovalGateway,
    repository: PathBuf,
}

impl Drop for ApprovalTicket<'_> {
    fn drop(&mut self) {
        self.gateway.slots().remove(&self.repository);
        debug!(repository = %self.repository.display(), "approval slot released");
    }
}
