use modhist_core::error::CoreError;
use modhist_core::types::DbId;

/// Error type for moderation operations that touch the database.
#[derive(Debug, thiserror::Error)]
pub enum ModerationError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("No entity handler registered for content type '{0}'")]
    UnknownContentType(String),
}

impl ModerationError {
    pub(crate) fn not_found(entity: &'static str, id: DbId) -> Self {
        CoreError::NotFound { entity, id }.into()
    }

    /// Returns `true` when the error is a pending-rebase refusal.
    pub fn is_rebase_required(&self) -> bool {
        matches!(self, Self::Core(CoreError::RebaseRequired { .. }))
    }

    /// The change a pending-rebase refusal names.
    pub fn rebase_change_id(&self) -> Option<DbId> {
        match self {
            Self::Core(CoreError::RebaseRequired { change_id }) => Some(*change_id),
            _ => None,
        }
    }

    /// Failures that abort an apply without surfacing to the caller: the
    /// write could not be persisted or the snapshot could not be rebuilt.
    pub(crate) fn is_persistence_failure(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Core(CoreError::Serialization(_))
        )
    }
}

impl From<serde_json::Error> for ModerationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Core(CoreError::from(err))
    }
}
