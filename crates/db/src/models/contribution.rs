//! Content contribution model: one contributor's edit within a change.

use modhist_core::error::CoreError;
use modhist_core::snapshot::Snapshot;
use modhist_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `content_contributions` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ContentContribution {
    pub id: DbId,
    pub contributor_id: Option<DbId>,
    pub change_id: DbId,
    /// Unmoderated state before the edit; absent for new entities.
    pub content_before: Option<serde_json::Value>,
    pub content_after: serde_json::Value,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ContentContribution {
    pub fn before(&self) -> Result<Option<Snapshot>, CoreError> {
        self.content_before
            .as_ref()
            .map(Snapshot::from_document)
            .transpose()
    }

    pub fn after(&self) -> Result<Snapshot, CoreError> {
        Snapshot::from_document(&self.content_after)
    }
}
