//! Process, filesystem and repository I/O.

pub mod config;
pub mod executor;
pub mod inspector;
pub mod oracle;
pub mod process;
pub mod session_store;
