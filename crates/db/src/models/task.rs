//! Queued background task model.

use modhist_core::error::CoreError;
use modhist_core::status::{StatusId, TaskStatus};
use modhist_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// What a queued task does when the worker picks it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Finish an approval: promote, apply, notify.
    PostApproval,
    /// Tell moderators a change is waiting for review.
    NotifyModerators,
    /// Tell contributors a verdict landed on their change.
    NotifyVerdict,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PostApproval => "post_approval",
            Self::NotifyModerators => "notify_moderators",
            Self::NotifyVerdict => "notify_verdict",
        }
    }

    pub fn parse(kind: &str) -> Result<Self, CoreError> {
        match kind {
            "post_approval" => Ok(Self::PostApproval),
            "notify_moderators" => Ok(Self::NotifyModerators),
            "notify_verdict" => Ok(Self::NotifyVerdict),
            other => Err(CoreError::Validation(format!("Unknown task kind '{other}'"))),
        }
    }
}

/// A row from the `moderation_tasks` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ModerationTask {
    pub id: DbId,
    pub kind: String,
    pub moderation_id: Option<DbId>,
    pub change_id: Option<DbId>,
    pub status: StatusId,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl ModerationTask {
    pub fn kind(&self) -> Result<TaskKind, CoreError> {
        TaskKind::parse(&self.kind)
    }

    pub fn status(&self) -> Result<TaskStatus, CoreError> {
        TaskStatus::from_id(self.status)
    }
}
