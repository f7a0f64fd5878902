//! ChangeSet model: a bundle of changes moderated and merged together.

use modhist_core::change_set::ChangeReason;
use modhist_core::error::CoreError;
use modhist_core::status::{DraftState, ModerationStatus, StatusId};
use modhist_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `change_sets` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChangeSet {
    pub id: DbId,
    pub initiator_id: Option<DbId>,
    pub reasons: Vec<String>,
    pub description: String,
    pub draft_state: StatusId,
    pub moderation_status: StatusId,
    pub n_remaining_approvals_required: i32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ChangeSet {
    pub fn status(&self) -> Result<ModerationStatus, CoreError> {
        ModerationStatus::from_id(self.moderation_status)
    }

    pub fn draft(&self) -> Result<DraftState, CoreError> {
        DraftState::from_id(self.draft_state)
    }
}

/// DTO for creating a new change set.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateChangeSet {
    pub initiator_id: Option<DbId>,
    pub reasons: Vec<ChangeReason>,
    #[serde(default)]
    pub description: String,
}
