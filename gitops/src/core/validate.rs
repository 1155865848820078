//! Semantic argument checks applied after schema validation.
//!
//! Arguments reach `git` as discrete argv entries, so the remaining risks are
//! values git itself would read as options (leading `-`), control characters,
//! paths escaping the repository, and URL transports that run commands.

use std::path::{Component, Path};

use crate::error::OpError;

const MAX_ARG_LEN: usize = 4096;
const MAX_REF_LEN: usize = 256;

/// Characters `git check-ref-format` rejects in ref names.
const REF_FORBIDDEN: &[char] = &[' ', '~', '^', ':', '?', '*', '[', '\\'];

/// Transports that hand the URL to a shell or an arbitrary helper.
const FORBIDDEN_URL_PREFIXES: &[&str] = &["ext::", "fd::"];

fn reject(field: &str, value: &str, reason: &str) -> OpError {
    OpError::validation(format!("{field} '{}': {reason}", value.escape_debug()))
}

fn check_common(field: &str, value: &str, max_len: usize) -> Result<(), OpError> {
    if value.is_empty() {
        return Err(reject(field, value, "must not be empty"));
    }
    if value.len() > max_len {
        return Err(reject(field, value, "too long"));
    }
    if value.chars().any(char::is_control) {
        return Err(reject(field, value, "contains control characters"));
    }
    Ok(())
}

fn check_not_option(field: &str, value: &str) -> Result<(), OpError> {
    if value.starts_with('-') {
        return Err(reject(field, value, "must not start with '-'"));
    }
    Ok(())
}

/// Name of a ref being created or looked up by name (branch, tag, remote).
pub fn ref_name(field: &str, value: &str) -> Result<(), OpError> {
    check_common(field, value, MAX_REF_LEN)?;
    check_not_option(field, value)?;
    if value.contains(REF_FORBIDDEN) {
        return Err(reject(field, value, "contains characters not allowed in ref names"));
    }
    if value.contains("..") || value.contains("@{") || value.contains("//") {
        return Err(reject(field, value, "contains a forbidden sequence"));
    }
    if value.starts_with('/')
        || value.ends_with('/')
        || value.ends_with('.')
        || value.ends_with(".lock")
        || value == "@"
    {
        return Err(reject(field, value, "is not a valid ref name"));
    }
    Ok(())
}

/// Revision expression (commit id, `main~2`, `a..b`).
pub fn revision(field: &str, value: &str) -> Result<(), OpError> {
    check_common(field, value, MAX_REF_LEN)?;
    check_not_option(field, value)?;
    if value.chars().any(char::is_whitespace) {
        return Err(reject(field, value, "must not contain whitespace"));
    }
    Ok(())
}

/// Path inside the working tree, relative to its root.
pub fn repo_path(field: &str, value: &str) -> Result<(), OpError> {
    check_common(field, value, MAX_ARG_LEN)?;
    let path = Path::new(value);
    if path.is_absolute() {
        return Err(reject(field, value, "must be relative to the repository root"));
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir))
    {
        return Err(reject(field, value, "must not leave the repository"));
    }
    Ok(())
}

/// Remote URL or local path of another repository.
pub fn url(field: &str, value: &str) -> Result<(), OpError> {
    check_common(field, value, MAX_ARG_LEN)?;
    check_not_option(field, value)?;
    if value.chars().any(char::is_whitespace) {
        return Err(reject(field, value, "must not contain whitespace"));
    }
    let lower = value.to_ascii_lowercase();
    if FORBIDDEN_URL_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
    {
        return Err(reject(field, value, "uses a forbidden transport"));
    }
    Ok(())
}

/// Free text handed to git as the value of `-m`.
pub fn message(field: &str, value: &str) -> Result<(), OpError> {
    if value.trim().is_empty() {
        return Err(reject(field, value, "must not be empty"));
    }
    if value.len() > MAX_ARG_LEN * 16 || value.contains('\0') {
        return Err(reject(field, value, "is not a usable message"));
    }
    Ok(())
}

/// Filesystem path for `clone`/`init` targets.
pub fn local_path(field: &str, value: &str) -> Result<(), OpError> {
    check_common(field, value, MAX_ARG_LEN)?;
    check_not_option(field, value)?;
    Ok(())
}
