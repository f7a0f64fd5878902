//! Task handlers, one per [`TaskKind`].

pub mod notify;
pub mod post_approval;

use modhist_db::models::task::{ModerationTask, TaskKind};
use serde::Serialize;

use crate::context::WorkerContext;
use crate::error::WorkerError;
use post_approval::PostApprovalOutcome;

/// What handling a task achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    PostApproval(PostApprovalOutcome),
    Notified,
}

/// Run the handler for a claimed task.
pub async fn dispatch(
    ctx: &WorkerContext,
    task: &ModerationTask,
) -> Result<TaskOutcome, WorkerError> {
    match task.kind()? {
        TaskKind::PostApproval => {
            let moderation_id = task.moderation_id.ok_or(WorkerError::MalformedTask {
                task_id: task.id,
                field: "moderation_id",
            })?;
            let outcome = post_approval::handle(ctx, moderation_id).await?;
            Ok(TaskOutcome::PostApproval(outcome))
        }
        TaskKind::NotifyModerators => {
            let change_id = task.change_id.ok_or(WorkerError::MalformedTask {
                task_id: task.id,
                field: "change_id",
            })?;
            notify::notify_moderators(ctx, change_id).await;
            Ok(TaskOutcome::Notified)
        }
        TaskKind::NotifyVerdict => {
            let moderation_id = task.moderation_id.ok_or(WorkerError::MalformedTask {
                task_id: task.id,
                field: "moderation_id",
            })?;
            notify::notify_verdict(ctx, moderation_id).await;
            Ok(TaskOutcome::Notified)
        }
    }
}
