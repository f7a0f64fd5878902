//! Repository for the `change_sets` table.
//!
//! A change set is moderated as a unit: verdicts fan out to every member
//! change, and the set is applied all-or-nothing in one transaction.

use modhist_core::change_set::validate_change_set;
use modhist_core::error::CoreError;
use modhist_core::status::{DraftState, ModerationStatus};
use modhist_core::types::DbId;
use sqlx::{PgConnection, PgExecutor, PgPool};

use crate::error::ModerationError;
use crate::models::change::Change;
use crate::models::change_set::{ChangeSet, CreateChangeSet};
use crate::models::contribution::ContentContribution;
use crate::models::moderation::{Moderation, Moderator};
use crate::models::task::TaskKind;
use crate::registry::EntityRegistry;
use crate::repositories::{ChangeRepo, ContributionRepo, TaskRepo};

/// Column list for change_sets queries.
const COLUMNS: &str = "id, initiator_id, reasons, description, draft_state, \
    moderation_status, n_remaining_approvals_required, created_at, updated_at";

/// Provides CRUD operations and set-level moderation for change sets.
pub struct ChangeSetRepo;

impl ChangeSetRepo {
    /// Create a change set. Reasons and description are validated first.
    pub async fn create(
        executor: impl PgExecutor<'_>,
        registry: &EntityRegistry,
        input: &CreateChangeSet,
    ) -> Result<ChangeSet, ModerationError> {
        validate_change_set(&input.reasons, &input.description)?;
        let reasons: Vec<String> = input.reasons.iter().map(|r| r.as_str().to_string()).collect();

        let query = format!(
            "INSERT INTO change_sets \
                (initiator_id, reasons, description, draft_state, moderation_status, \
                 n_remaining_approvals_required) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        let set = sqlx::query_as::<_, ChangeSet>(&query)
            .bind(input.initiator_id)
            .bind(reasons)
            .bind(&input.description)
            .bind(DraftState::Draft.id())
            .bind(ModerationStatus::Pending.id())
            .bind(registry.config().required_approvals)
            .fetch_one(executor)
            .await?;
        Ok(set)
    }

    pub async fn find_by_id(
        executor: impl PgExecutor<'_>,
        id: DbId,
    ) -> Result<Option<ChangeSet>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM change_sets WHERE id = $1");
        sqlx::query_as::<_, ChangeSet>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    async fn lock_existing(
        conn: &mut PgConnection,
        id: DbId,
    ) -> Result<ChangeSet, ModerationError> {
        let query = format!("SELECT {COLUMNS} FROM change_sets WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, ChangeSet>(&query)
            .bind(id)
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| ModerationError::not_found("ChangeSet", id))
    }

    /// Put a change into a set. Merged changes cannot join.
    pub async fn add_change(
        pool: &PgPool,
        set_id: DbId,
        change_id: DbId,
    ) -> Result<(), ModerationError> {
        let mut tx = pool.begin().await?;
        let set = Self::lock_existing(&mut tx, set_id).await?;
        if set.status()? == ModerationStatus::Merged {
            return Err(
                CoreError::Conflict(format!("Change set {set_id} is already merged")).into(),
            );
        }
        let change = ChangeRepo::lock(&mut tx, change_id)
            .await?
            .ok_or_else(|| ModerationError::not_found("Change", change_id))?;
        if change.is_merged() {
            return Err(CoreError::Conflict(format!(
                "Change {change_id} is merged and cannot join a change set"
            ))
            .into());
        }
        ChangeRepo::set_change_set(&mut *tx, change_id, Some(set_id)).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn changes(
        executor: impl PgExecutor<'_>,
        set_id: DbId,
    ) -> Result<Vec<Change>, sqlx::Error> {
        ChangeRepo::list_for_set(executor, set_id).await
    }

    pub async fn change_ids(
        executor: impl PgExecutor<'_>,
        set_id: DbId,
    ) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar::<_, DbId>("SELECT id FROM changes WHERE set_id = $1 ORDER BY id ASC")
            .bind(set_id)
            .fetch_all(executor)
            .await
    }

    /// Every contribution to every member change, oldest first.
    pub async fn contributions(
        executor: impl PgExecutor<'_>,
        set_id: DbId,
    ) -> Result<Vec<ContentContribution>, sqlx::Error> {
        ContributionRepo::list_for_set(executor, set_id).await
    }

    /// Distinct contributors across the set.
    pub async fn contributors(
        executor: impl PgExecutor<'_>,
        set_id: DbId,
    ) -> Result<Vec<DbId>, sqlx::Error> {
        ContributionRepo::contributor_ids_for_set(executor, set_id).await
    }

    /// Mark the set and its member drafts ready, and notify moderators.
    pub async fn submit(pool: &PgPool, set_id: DbId) -> Result<ChangeSet, ModerationError> {
        let mut tx = pool.begin().await?;
        let set = Self::lock_existing(&mut tx, set_id).await?;
        if set.draft()? == DraftState::Ready {
            return Ok(set);
        }

        sqlx::query(
            "UPDATE changes SET draft_state = $2, updated_at = NOW() \
             WHERE set_id = $1 AND draft_state = $3",
        )
        .bind(set_id)
        .bind(DraftState::Ready.id())
        .bind(DraftState::Draft.id())
        .execute(&mut *tx)
        .await?;

        let query = format!(
            "UPDATE change_sets SET draft_state = $2, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let set = sqlx::query_as::<_, ChangeSet>(&query)
            .bind(set_id)
            .bind(DraftState::Ready.id())
            .fetch_one(&mut *tx)
            .await?;

        for change in ChangeRepo::list_for_set(&mut *tx, set_id).await? {
            TaskRepo::enqueue(&mut *tx, TaskKind::NotifyModerators, None, Some(change.id))
                .await?;
        }
        tx.commit().await?;

        tracing::info!(set_id, "Change set submitted for review");
        Ok(set)
    }

    /// `true` when the set has members and every one is APPROVED or MERGED.
    pub async fn all_members_approved(
        executor: impl PgExecutor<'_>,
        set_id: DbId,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            "SELECT COUNT(*) > 0 \
                    AND COUNT(*) FILTER (WHERE moderation_status NOT IN ($2, $3)) = 0 \
             FROM changes WHERE set_id = $1",
        )
        .bind(set_id)
        .bind(ModerationStatus::Approved.id())
        .bind(ModerationStatus::Merged.id())
        .fetch_one(executor)
        .await
    }

    /// Promote a pending or rejected set to APPROVED. Returns `true` if
    /// this call made the transition.
    pub async fn mark_approved(
        executor: impl PgExecutor<'_>,
        set_id: DbId,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE change_sets \
             SET moderation_status = $2, n_remaining_approvals_required = 0, updated_at = NOW() \
             WHERE id = $1 AND moderation_status IN ($3, $4)",
        )
        .bind(set_id)
        .bind(ModerationStatus::Approved.id())
        .bind(ModerationStatus::Pending.id())
        .bind(ModerationStatus::Rejected.id())
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Approve every unmerged member change.
    pub async fn approve(
        pool: &PgPool,
        registry: &EntityRegistry,
        set_id: DbId,
        moderator: &Moderator,
        reason: &str,
        force: bool,
    ) -> Result<Vec<Moderation>, ModerationError> {
        let mut tx = pool.begin().await?;
        let members = Self::moderatable_members(&mut tx, set_id).await?;

        let mut moderations = Vec::with_capacity(members.len());
        for member in members.iter().filter(|m| !m.is_merged()) {
            moderations.push(
                ChangeRepo::approve_in(&mut tx, registry, member.id, moderator, reason, force)
                    .await?,
            );
        }
        Self::refresh_tally(&mut tx, set_id).await?;
        tx.commit().await?;

        tracing::info!(set_id, approvals = moderations.len(), "Change set approved by moderator");
        Ok(moderations)
    }

    /// Reject every unmerged member change and the set itself.
    pub async fn reject(
        pool: &PgPool,
        registry: &EntityRegistry,
        set_id: DbId,
        moderator: &Moderator,
        reason: &str,
    ) -> Result<Vec<Moderation>, ModerationError> {
        let mut tx = pool.begin().await?;
        let members = Self::moderatable_members(&mut tx, set_id).await?;

        let mut moderations = Vec::with_capacity(members.len());
        for member in members.iter().filter(|m| !m.is_merged()) {
            let moderation =
                ChangeRepo::reject_in(&mut tx, registry, member.id, moderator, reason).await?;
            moderations.push(moderation);
        }
        Self::refresh_tally(&mut tx, set_id).await?;
        sqlx::query(
            "UPDATE change_sets SET moderation_status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(set_id)
        .bind(ModerationStatus::Rejected.id())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(set_id, "Change set rejected");
        Ok(moderations)
    }

    async fn moderatable_members(
        conn: &mut PgConnection,
        set_id: DbId,
    ) -> Result<Vec<Change>, ModerationError> {
        let set = Self::lock_existing(&mut *conn, set_id).await?;
        if set.draft()? == DraftState::Draft {
            return Err(CoreError::Validation(format!(
                "Change set {set_id} is still a draft and cannot be moderated"
            ))
            .into());
        }
        if set.status()? == ModerationStatus::Merged {
            return Err(
                CoreError::Conflict(format!("Change set {set_id} is already merged")).into(),
            );
        }
        let members = ChangeRepo::list_for_set(&mut *conn, set_id).await?;
        if members.is_empty() {
            return Err(CoreError::Validation(format!("Change set {set_id} has no changes")).into());
        }
        Ok(members)
    }

    /// Roll member tallies up onto the set: it needs as many approvals as
    /// its neediest member, and is APPROVED once every member is.
    async fn refresh_tally(conn: &mut PgConnection, set_id: DbId) -> Result<(), ModerationError> {
        let members = ChangeRepo::list_for_set(&mut *conn, set_id).await?;
        let remaining = members
            .iter()
            .map(|m| m.n_remaining_approvals_required)
            .max()
            .unwrap_or(0);
        sqlx::query(
            "UPDATE change_sets SET n_remaining_approvals_required = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(set_id)
        .bind(remaining)
        .execute(&mut *conn)
        .await?;

        if Self::all_members_approved(&mut *conn, set_id).await? {
            Self::mark_approved(&mut *conn, set_id).await?;
        }
        Ok(())
    }

    /// Apply every member change in one transaction.
    ///
    /// Returns `Ok(false)`, with nothing written, when the set is not
    /// approved or any member cannot be applied. A pending rebase on any
    /// member is an error.
    pub async fn apply(
        pool: &PgPool,
        registry: &EntityRegistry,
        set_id: DbId,
    ) -> Result<bool, ModerationError> {
        let mut tx = pool.begin().await?;
        let set = Self::lock_existing(&mut tx, set_id).await?;
        let status = set.status()?;
        if status != ModerationStatus::Approved {
            tracing::info!(set_id, status = %status, "Change set not approved; nothing applied");
            return Ok(false);
        }

        let members = ChangeRepo::list_for_set(&mut *tx, set_id).await?;
        for member in members.iter().filter(|m| !m.is_merged()) {
            match ChangeRepo::apply_in(&mut tx, registry, member.id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        set_id,
                        change_id = member.id,
                        "Change set member could not be applied; set rolled back"
                    );
                    return Ok(false);
                }
                Err(e) if e.is_persistence_failure() => {
                    tracing::error!(
                        set_id,
                        change_id = member.id,
                        error = %e,
                        "Failed to apply change set; rolled back"
                    );
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        sqlx::query(
            "UPDATE change_sets SET moderation_status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(set_id)
        .bind(ModerationStatus::Merged.id())
        .execute(&mut *tx)
        .await?;

        if let Err(e) = tx.commit().await {
            tracing::error!(set_id, error = %e, "Failed to commit merged change set");
            return Ok(false);
        }
        tracing::info!(set_id, changes = members.len(), "Change set merged");
        Ok(true)
    }
}
