//! Audit entry data structures
//!
//! Defines the actions that get audited, their outcome, and the entry
//! format itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BackupError;
use crate::models::BackupId;

/// Engine operations that are audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Restore,
    Verify,
    Delete,
    Prune,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::Create => write!(f, "CREATE"),
            AuditAction::Restore => write!(f, "RESTORE"),
            AuditAction::Verify => write!(f, "VERIFY"),
            AuditAction::Delete => write!(f, "DELETE"),
            AuditAction::Prune => write!(f, "PRUNE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// When the operation finished (UTC)
    pub timestamp: DateTime<Utc>,

    pub action: AuditAction,

    /// Who requested the operation ("system" for scheduled work)
    pub actor: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,

    pub outcome: AuditOutcome,

    /// Free-form context; never contains secrets
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl AuditEntry {
    /// Entry for an operation that succeeded
    pub fn success(action: AuditAction, actor: impl Into<String>, backup_id: Option<BackupId>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            actor: actor.into(),
            backup_id: backup_id.map(|id| id.full()),
            outcome: AuditOutcome::Success,
            details: serde_json::Value::Null,
        }
    }

    /// Entry for an operation that failed with `error`
    pub fn failure(
        action: AuditAction,
        actor: impl Into<String>,
        backup_id: Option<BackupId>,
        error: &BackupError,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            actor: actor.into(),
            backup_id: backup_id.map(|id| id.full()),
            outcome: AuditOutcome::Failure,
            details: serde_json::json!({
                "errorKind": error.kind(),
                "error": error.to_string(),
            }),
        }
    }

    /// Merge `details` into the entry's details object
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        match (&mut self.details, details) {
            (serde_json::Value::Object(existing), serde_json::Value::Object(extra)) => {
                existing.extend(extra);
            }
            (slot, extra) => *slot = extra,
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AuditOutcome::Success
    }

    /// Human-readable one-line summary
    pub fn format_human_readable(&self) -> String {
        let id = self.backup_id.as_deref().unwrap_or("-");
        let outcome = match self.outcome {
            AuditOutcome::Success => "ok",
            AuditOutcome::Failure => "FAILED",
        };
        format!(
            "{} {} {} by {} [{}]",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.action,
            id,
            self.actor,
            outcome
        )
    }
}
