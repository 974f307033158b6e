//! Filesystem plumbing: timestamped names and deferred file operations.

pub mod naming;
pub mod surrogate;

pub use surrogate::{Completion, FileOps, OsFileOps, PendingOp, Surrogate};
