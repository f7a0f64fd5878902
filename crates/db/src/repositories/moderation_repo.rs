//! Repository for the `moderations` table.

use modhist_core::status::Verdict;
use modhist_core::types::DbId;
use sqlx::PgExecutor;

use crate::error::ModerationError;
use crate::models::moderation::Moderation;

/// Column list for moderations queries.
const COLUMNS: &str = "id, moderator_id, change_id, verdict, reason, date, stale";

/// Provides CRUD operations for moderator verdicts.
pub struct ModerationRepo;

impl ModerationRepo {
    /// Record a verdict, returning the created row.
    pub async fn create(
        executor: impl PgExecutor<'_>,
        moderator_id: Option<DbId>,
        change_id: DbId,
        verdict: Verdict,
        reason: &str,
    ) -> Result<Moderation, sqlx::Error> {
        let query = format!(
            "INSERT INTO moderations (moderator_id, change_id, verdict, reason) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Moderation>(&query)
            .bind(moderator_id)
            .bind(change_id)
            .bind(verdict.id())
            .bind(reason)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_id(
        executor: impl PgExecutor<'_>,
        id: DbId,
    ) -> Result<Option<Moderation>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM moderations WHERE id = $1");
        sqlx::query_as::<_, Moderation>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// All verdicts on a change, most recent first (stale ones included).
    pub async fn list_for_change(
        executor: impl PgExecutor<'_>,
        change_id: DbId,
    ) -> Result<Vec<Moderation>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM moderations \
             WHERE change_id = $1 \
             ORDER BY date DESC, id ASC"
        );
        sqlx::query_as::<_, Moderation>(&query)
            .bind(change_id)
            .fetch_all(executor)
            .await
    }

    /// The `limit` most recent non-stale verdicts on a change.
    ///
    /// Ordered by date descending; equal timestamps fall back to insertion
    /// order.
    pub async fn recent_verdicts(
        executor: impl PgExecutor<'_>,
        change_id: DbId,
        limit: i32,
    ) -> Result<Vec<Verdict>, ModerationError> {
        let ids = sqlx::query_scalar::<_, i16>(
            "SELECT verdict FROM moderations \
             WHERE change_id = $1 AND stale = FALSE \
             ORDER BY date DESC, id ASC \
             LIMIT $2",
        )
        .bind(change_id)
        .bind(i64::from(limit.max(0)))
        .fetch_all(executor)
        .await?;

        ids.into_iter()
            .map(|id| Verdict::from_id(id).map_err(ModerationError::from))
            .collect()
    }

    /// The moderator's counting approval on a change, if any.
    pub async fn find_active_approval(
        executor: impl PgExecutor<'_>,
        change_id: DbId,
        moderator_id: DbId,
    ) -> Result<Option<Moderation>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM moderations \
             WHERE change_id = $1 AND moderator_id = $2 \
               AND verdict = $3 AND stale = FALSE"
        );
        sqlx::query_as::<_, Moderation>(&query)
            .bind(change_id)
            .bind(moderator_id)
            .bind(Verdict::Approved.id())
            .fetch_optional(executor)
            .await
    }

    /// Stale every verdict one moderator has given on a change, whatever
    /// it was. Called before the moderator's newer verdict is recorded, so
    /// each moderator has at most one counting verdict. Returns rows affected.
    pub async fn mark_stale_for_moderator(
        executor: impl PgExecutor<'_>,
        change_id: DbId,
        moderator_id: DbId,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE moderations SET stale = TRUE \
             WHERE change_id = $1 AND moderator_id = $2 AND stale = FALSE",
        )
        .bind(change_id)
        .bind(moderator_id)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }

    /// Stale every approval on a change, e.g. after its snapshot changed.
    pub async fn mark_approvals_stale(
        executor: impl PgExecutor<'_>,
        change_id: DbId,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE moderations SET stale = TRUE \
             WHERE change_id = $1 AND verdict = $2 AND stale = FALSE",
        )
        .bind(change_id)
        .bind(Verdict::Approved.id())
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }
}
