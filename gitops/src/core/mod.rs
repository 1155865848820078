//! Deterministic, pure logic shared by the orchestration layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and `git` output already captured as text.

pub mod porcelain;
pub mod types;
pub mod validate;
