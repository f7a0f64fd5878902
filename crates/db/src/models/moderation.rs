//! Moderation model: one moderator's verdict on one change.

use modhist_core::error::CoreError;
use modhist_core::status::{StatusId, Verdict};
use modhist_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `moderations` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Moderation {
    pub id: DbId,
    /// `None` for system verdicts (auto-approve and auto-reject hooks).
    pub moderator_id: Option<DbId>,
    pub change_id: DbId,
    pub verdict: StatusId,
    pub reason: String,
    pub date: Timestamp,
    /// Stale verdicts no longer count toward the quorum.
    pub stale: bool,
}

impl Moderation {
    pub fn verdict(&self) -> Result<Verdict, CoreError> {
        Verdict::from_id(self.verdict)
    }
}

/// Who is acting on a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Moderator {
    pub user_id: Option<DbId>,
    /// Admins may force an approval straight through.
    #[serde(default)]
    pub is_admin: bool,
}

impl Moderator {
    pub fn user(user_id: DbId) -> Self {
        Self {
            user_id: Some(user_id),
            is_admin: false,
        }
    }

    pub fn admin(user_id: DbId) -> Self {
        Self {
            user_id: Some(user_id),
            is_admin: true,
        }
    }

    /// The engine itself, acting through policy hooks.
    pub fn system() -> Self {
        Self {
            user_id: None,
            is_admin: true,
        }
    }
}
