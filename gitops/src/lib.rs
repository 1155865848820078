//! Git operation orchestration for automated callers.
//!
//! The crate exposes git operations as named tools with JSON arguments and
//! adds what a bare CLI wrapper lacks: an approval gate for remote-mutating
//! and history-rewriting operations, a state machine that keeps merges,
//! rebases and cherry-picks recoverable when they stop on conflicts, and a
//! fresh repository status attached to every response.
//!
//! - **[`core`]**: Pure data model, porcelain parsers and argument checks.
//! - **[`io`]**: Process execution, repository inspection, session storage,
//!   configuration and approval oracles.
//!
//! [`workflow`], [`approval`], [`ops`], [`registry`] and [`dispatch`] compose
//! them into the tool surface used by the binary.

pub mod approval;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod ops;
pub mod registry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
