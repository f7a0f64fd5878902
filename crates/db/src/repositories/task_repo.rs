//! Repository for the `moderation_tasks` queue.

use std::time::Duration;

use modhist_core::status::TaskStatus;
use modhist_core::types::DbId;
use sqlx::PgExecutor;

use crate::error::ModerationError;
use crate::models::task::{ModerationTask, TaskKind};

/// Column list for moderation_tasks queries.
const COLUMNS: &str = "id, kind, moderation_id, change_id, status, attempts, last_error, \
    created_at, claimed_at, completed_at";

/// Provides queue operations for background moderation tasks.
pub struct TaskRepo;

impl TaskRepo {
    /// Queue a task. Callers enqueue inside the transaction that produced
    /// the work, so a rolled-back verdict never leaves a task behind.
    pub async fn enqueue(
        executor: impl PgExecutor<'_>,
        kind: TaskKind,
        moderation_id: Option<DbId>,
        change_id: Option<DbId>,
    ) -> Result<ModerationTask, sqlx::Error> {
        let query = format!(
            "INSERT INTO moderation_tasks (kind, moderation_id, change_id, status) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ModerationTask>(&query)
            .bind(kind.as_str())
            .bind(moderation_id)
            .bind(change_id)
            .bind(TaskStatus::Pending.id())
            .fetch_one(executor)
            .await
    }

    /// Atomically claim the oldest claimable task.
    ///
    /// Claimable means pending, or running with a claim older than `lease`
    /// (its worker is presumed dead). Uses `SELECT FOR UPDATE SKIP LOCKED`
    /// so concurrent workers never claim the same task. Handlers must be
    /// safe to run again, since a slow worker can outlive its lease.
    pub async fn claim_next(
        executor: impl PgExecutor<'_>,
        lease: Duration,
    ) -> Result<Option<ModerationTask>, sqlx::Error> {
        let query = format!(
            "UPDATE moderation_tasks \
             SET status = $1, claimed_at = NOW(), attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT id FROM moderation_tasks \
                 WHERE status = $2 \
                    OR (status = $1 AND claimed_at < NOW() - make_interval(secs => $3)) \
                 ORDER BY created_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ModerationTask>(&query)
            .bind(TaskStatus::Running.id())
            .bind(TaskStatus::Pending.id())
            .bind(lease.as_secs_f64())
            .fetch_optional(executor)
            .await
    }

    /// Fail running tasks whose lease expired after their last allowed
    /// attempt, so a task that keeps killing its worker is not reclaimed
    /// forever. Returns rows affected.
    pub async fn fail_abandoned(
        executor: impl PgExecutor<'_>,
        lease: Duration,
        max_attempts: i32,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE moderation_tasks \
             SET status = $2, claimed_at = NULL, \
                 last_error = COALESCE(last_error, 'worker lease expired') \
             WHERE status = $1 \
               AND claimed_at < NOW() - make_interval(secs => $3) \
               AND attempts >= $4",
        )
        .bind(TaskStatus::Running.id())
        .bind(TaskStatus::Failed.id())
        .bind(lease.as_secs_f64())
        .bind(max_attempts)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn complete(executor: impl PgExecutor<'_>, id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE moderation_tasks \
             SET status = $2, completed_at = NOW(), last_error = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(TaskStatus::Completed.id())
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Record a failed attempt. The task goes back to pending until it has
    /// used `max_attempts`, then stays failed. Returns the new status.
    pub async fn fail(
        executor: impl PgExecutor<'_>,
        id: DbId,
        error: &str,
        max_attempts: i32,
    ) -> Result<TaskStatus, ModerationError> {
        let status = sqlx::query_scalar::<_, i16>(
            "UPDATE moderation_tasks \
             SET last_error = $2, claimed_at = NULL, \
                 status = CASE WHEN attempts >= $3 THEN $4 ELSE $5 END \
             WHERE id = $1 \
             RETURNING status",
        )
        .bind(id)
        .bind(error)
        .bind(max_attempts)
        .bind(TaskStatus::Failed.id())
        .bind(TaskStatus::Pending.id())
        .fetch_one(executor)
        .await?;
        Ok(TaskStatus::from_id(status)?)
    }

    pub async fn find_by_id(
        executor: impl PgExecutor<'_>,
        id: DbId,
    ) -> Result<Option<ModerationTask>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM moderation_tasks WHERE id = $1");
        sqlx::query_as::<_, ModerationTask>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Tasks queued for a change, oldest first.
    pub async fn list_for_change(
        executor: impl PgExecutor<'_>,
        change_id: DbId,
    ) -> Result<Vec<ModerationTask>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM moderation_tasks \
             WHERE change_id = $1 \
             ORDER BY created_at ASC, id ASC"
        );
        sqlx::query_as::<_, ModerationTask>(&query)
            .bind(change_id)
            .fetch_all(executor)
            .await
    }
}
