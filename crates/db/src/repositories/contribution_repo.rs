//! Repository for the `content_contributions` table.

use modhist_core::snapshot::Snapshot;
use modhist_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::contribution::ContentContribution;

/// Column list for content_contributions queries.
const COLUMNS: &str =
    "id, contributor_id, change_id, content_before, content_after, created_at, updated_at";

/// Provides CRUD operations for content contributions.
pub struct ContributionRepo;

impl ContributionRepo {
    /// Record one contributor's edit within a change.
    pub async fn create(
        executor: impl PgExecutor<'_>,
        contributor_id: Option<DbId>,
        change_id: DbId,
        content_before: Option<&Snapshot>,
        content_after: &Snapshot,
    ) -> Result<ContentContribution, sqlx::Error> {
        let query = format!(
            "INSERT INTO content_contributions \
                (contributor_id, change_id, content_before, content_after) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ContentContribution>(&query)
            .bind(contributor_id)
            .bind(change_id)
            .bind(content_before.map(Snapshot::to_document))
            .bind(content_after.to_document())
            .fetch_one(executor)
            .await
    }

    /// Contributions to a change, oldest first.
    pub async fn list_for_change(
        executor: impl PgExecutor<'_>,
        change_id: DbId,
    ) -> Result<Vec<ContentContribution>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM content_contributions \
             WHERE change_id = $1 \
             ORDER BY created_at ASC, id ASC"
        );
        sqlx::query_as::<_, ContentContribution>(&query)
            .bind(change_id)
            .fetch_all(executor)
            .await
    }

    /// The first contribution to a change. Its `content_before` is the base
    /// the proposal was written against.
    pub async fn earliest_for_change(
        executor: impl PgExecutor<'_>,
        change_id: DbId,
    ) -> Result<Option<ContentContribution>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM content_contributions \
             WHERE change_id = $1 \
             ORDER BY created_at ASC, id ASC \
             LIMIT 1"
        );
        sqlx::query_as::<_, ContentContribution>(&query)
            .bind(change_id)
            .fetch_optional(executor)
            .await
    }

    /// A contributor's edits, most recent first.
    pub async fn list_for_contributor(
        executor: impl PgExecutor<'_>,
        contributor_id: DbId,
    ) -> Result<Vec<ContentContribution>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM content_contributions \
             WHERE contributor_id = $1 \
             ORDER BY created_at DESC, id DESC"
        );
        sqlx::query_as::<_, ContentContribution>(&query)
            .bind(contributor_id)
            .fetch_all(executor)
            .await
    }

    /// Contributions to every change in a change set.
    pub async fn list_for_set(
        executor: impl PgExecutor<'_>,
        set_id: DbId,
    ) -> Result<Vec<ContentContribution>, sqlx::Error> {
        sqlx::query_as::<_, ContentContribution>(
            "SELECT cc.id, cc.contributor_id, cc.change_id, cc.content_before, \
                    cc.content_after, cc.created_at, cc.updated_at \
             FROM content_contributions cc \
             JOIN changes c ON c.id = cc.change_id \
             WHERE c.set_id = $1 \
             ORDER BY cc.created_at ASC, cc.id ASC",
        )
        .bind(set_id)
        .fetch_all(executor)
        .await
    }

    /// Distinct known contributors to a change.
    pub async fn contributor_ids_for_change(
        executor: impl PgExecutor<'_>,
        change_id: DbId,
    ) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar::<_, DbId>(
            "SELECT DISTINCT contributor_id FROM content_contributions \
             WHERE change_id = $1 AND contributor_id IS NOT NULL \
             ORDER BY contributor_id",
        )
        .bind(change_id)
        .fetch_all(executor)
        .await
    }

    /// Distinct known contributors across a change set.
    pub async fn contributor_ids_for_set(
        executor: impl PgExecutor<'_>,
        set_id: DbId,
    ) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar::<_, DbId>(
            "SELECT DISTINCT cc.contributor_id FROM content_contributions cc \
             JOIN changes c ON c.id = cc.change_id \
             WHERE c.set_id = $1 AND cc.contributor_id IS NOT NULL \
             ORDER BY cc.contributor_id",
        )
        .bind(set_id)
        .fetch_all(executor)
        .await
    }
}
