use modhist_core::error::CoreError;
use modhist_core::types::DbId;
use modhist_db::ModerationError;

/// Error type for task handling. A handler error fails the task attempt;
/// the queue retries it until the attempt limit.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Moderation(#[from] ModerationError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Task {task_id} is missing its {field}")]
    MalformedTask { task_id: DbId, field: &'static str },

    #[error("Change {change_id} could not be applied")]
    ApplyFailed { change_id: DbId },

    #[error("Change set {set_id} could not be applied")]
    SetApplyFailed { set_id: DbId },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
