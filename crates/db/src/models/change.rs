//! Change model: a single proposed edit to one entity.

use modhist_core::error::CoreError;
use modhist_core::snapshot::Snapshot;
use modhist_core::status::{DraftState, ModerationStatus, StatusId};
use modhist_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `changes` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Change {
    pub id: DbId,
    pub content_type: String,
    pub object_id: Option<DbId>,
    /// The proposed state of the entity, as a snapshot document.
    pub changed_object: serde_json::Value,
    pub set_id: Option<DbId>,
    pub parent_id: Option<DbId>,
    pub moderation_status: StatusId,
    pub draft_state: StatusId,
    pub n_remaining_approvals_required: i32,
    pub requires_rebase: bool,
    pub merged_date: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Change {
    pub fn status(&self) -> Result<ModerationStatus, CoreError> {
        ModerationStatus::from_id(self.moderation_status)
    }

    pub fn draft(&self) -> Result<DraftState, CoreError> {
        DraftState::from_id(self.draft_state)
    }

    /// Decode the stored snapshot.
    pub fn snapshot(&self) -> Result<Snapshot, CoreError> {
        Snapshot::from_document(&self.changed_object)
    }

    pub fn is_merged(&self) -> bool {
        self.merged_date.is_some()
    }
}

/// DTO for creating a new change.
#[derive(Debug, Clone)]
pub struct CreateChange {
    pub content_type: String,
    pub object_id: Option<DbId>,
    pub changed_object: Snapshot,
    pub set_id: Option<DbId>,
    pub parent_id: Option<DbId>,
    pub draft_state: DraftState,
    /// Seeded from the quorum of the change's entity type.
    pub n_remaining_approvals_required: i32,
}
