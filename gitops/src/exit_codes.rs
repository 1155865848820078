//! Stable exit codes for `gitops` commands.
//!
//! Each [`crate::error::OpError`] kind maps to exactly one code; the envelope
//! carries the same number in `error.code`.

/// Operation succeeded.
pub const OK: i32 = 0;
/// Binary-level failure outside the operation taxonomy (bad config, bad CLI input).
pub const INVALID: i32 = 1;
/// Arguments were missing, mistyped, or unsafe. Nothing ran.
pub const VALIDATION_ERROR: i32 = 10;
/// No tool is registered under the requested name.
pub const UNKNOWN_OPERATION: i32 = 11;
/// The approval gateway rejected (or the caller cancelled) the request.
pub const APPROVAL_DENIED: i32 = 12;
/// Another workflow or approval is active on the same repository.
pub const STATE_CONFLICT: i32 = 13;
/// `git` could not be started or timed out.
pub const EXECUTION_FAILURE: i32 = 14;
/// `git` ran and reported failure or conflicts.
pub const OPERATION_FAILED: i32 = 15;
/// The path is not a repository root or its metadata is unusable.
pub const INSPECTION_FAILURE: i32 = 16;
