//! Workflow session storage under the repository's metadata directory.
//!
//! One JSON file per repository (`<git_dir>/gitops/session.json`) lets a
//! restarted process pick up an unfinished merge, rebase or cherry-pick.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::types::{RepositoryHandle, WorkflowSession};
use crate::error::OpError;

pub fn session_path(handle: &RepositoryHandle) -> PathBuf {
    handle.git_dir().join("gitops").join("session.json")
}

/// Load the persisted session, if any.
pub fn load_session(handle: &RepositoryHandle) -> Result<Option<WorkflowSession>, OpError> {
    let path = session_path(handle);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(OpError::inspection(format!(
                "read session {}: {e}",
                path.display()
            )));
        }
    };
    let session: WorkflowSession = serde_json::from_str(&contents).map_err(|e| {
        OpError::inspection(format!("parse session {}: {e}", path.display()))
    })?;
    debug!(
        path = %path.display(),
        kind = ?session.operation_kind,
        phase = ?session.phase,
        "session loaded"
    );
    Ok(Some(session))
}

/// Atomically write the session (temp file + rename).
pub fn write_session(handle: &RepositoryHandle, session: &WorkflowSession) -> Result<(), OpError> {
    let path = session_path(handle);
    debug!(
        path = %path.display(),
        kind = ?session.operation_kind,
        phase = ?session.phase,
        "writing session"
    );
    let mut buf = serde_json::to_string_pretty(session)
        .map_err(|e| OpError::inspection(format!("serialize session: {e}")))?;
    buf.push('\n');
    write_atomic(&path, &buf)
}

/// Remove the persisted session. Missing files are fine.
pub fn clear_session(handle: &RepositoryHandle) -> Result<(), OpError> {
    let path = session_path(handle);
    match fs::remove_file(&path) {
        Ok(()) => {
            debug!(path = %path.display(), "session cleared");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OpError::inspection(format!(
            "remove session {}: {e}",
            path.display()
        ))),
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), OpError> {
    let parent = path.parent().ok_or_else(|| {
        OpError::inspection(format!("session path missing parent {}", path.display()))
    })?;
    fs::create_dir_all(parent).map_err(|e| {
        OpError::inspection(format!("create directory {}: {e}", parent.display()))
    })?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents).map_err(|e| {
        OpError::inspection(format!("write temp session {}: {e}", tmp_path.display()))
    })?;
    fs::rename(&tmp_path, path)
        .map_err(|e| OpError::inspection(format!("replace session {}: {e}", path.display())))?;
    Ok(())
}
