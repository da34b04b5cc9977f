//! Audit logging for backup operations
//!
//! Records every create, restore, verify, delete and prune in an
//! append-only JSONL audit log.
//!
//! - `AuditEntry`: one audited operation with actor, outcome and details.
//! - `AuditSink`: the port the orchestrator writes to.
//! - `AuditLogger`: the file-backed sink.

mod entry;
mod logger;

pub use entry::{AuditAction, AuditEntry, AuditOutcome};
pub use logger::{AuditLogger, AuditSink};
