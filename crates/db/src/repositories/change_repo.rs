//! Repository for the `changes` table and the change approval state machine.
//!
//! Verdicts, promotion and apply all run under a `FOR UPDATE` lock on the
//! change row, so concurrent moderators serialize per change and the
//! PENDING -> APPROVED transition and the merge each happen at most once.

use indexmap::IndexMap;
use modhist_core::diff::{diff_fields, DiffOptions, FieldChange};
use modhist_core::error::CoreError;
use modhist_core::quorum::{
    check_apply, promoted_status, remaining_approvals, validate_moderatable, ApplyGate,
};
use modhist_core::snapshot::{rebase_onto, RebaseOutcome, Snapshot};
use modhist_core::status::{DraftState, ModerationStatus, Verdict};
use modhist_core::types::DbId;
use sqlx::{PgConnection, PgExecutor, PgPool};

use crate::error::ModerationError;
use crate::models::change::{Change, CreateChange};
use crate::models::moderation::{Moderation, Moderator};
use crate::models::task::TaskKind;
use crate::registry::EntityRegistry;
use crate::repositories::{ContributionRepo, ModerationRepo, TaskRepo};
use crate::resolver::relation_labels;

/// Column list for changes queries.
const COLUMNS: &str = "id, content_type, object_id, changed_object, set_id, parent_id, \
    moderation_status, draft_state, n_remaining_approvals_required, requires_rebase, \
    merged_date, created_at, updated_at";

/// Provides CRUD operations and moderation transitions for changes.
pub struct ChangeRepo;

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

impl ChangeRepo {
    /// Insert a new pending change, returning the created row.
    pub async fn create(
        executor: impl PgExecutor<'_>,
        input: &CreateChange,
    ) -> Result<Change, sqlx::Error> {
        let query = format!(
            "INSERT INTO changes \
                (content_type, object_id, changed_object, set_id, parent_id, \
                 moderation_status, draft_state, n_remaining_approvals_required) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Change>(&query)
            .bind(&input.content_type)
            .bind(input.object_id)
            .bind(input.changed_object.to_document())
            .bind(input.set_id)
            .bind(input.parent_id)
            .bind(ModerationStatus::Pending.id())
            .bind(input.draft_state.id())
            .bind(input.n_remaining_approvals_required)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_id(
        executor: impl PgExecutor<'_>,
        id: DbId,
    ) -> Result<Option<Change>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM changes WHERE id = $1");
        sqlx::query_as::<_, Change>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Load a change and hold its row lock until the transaction ends.
    pub async fn lock(conn: &mut PgConnection, id: DbId) -> Result<Option<Change>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM changes WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, Change>(&query)
            .bind(id)
            .fetch_optional(conn)
            .await
    }

    async fn lock_existing(conn: &mut PgConnection, id: DbId) -> Result<Change, ModerationError> {
        Self::lock(conn, id)
            .await?
            .ok_or_else(|| ModerationError::not_found("Change", id))
    }

    /// Every change ever proposed for one object, newest first.
    pub async fn list_for_object(
        executor: impl PgExecutor<'_>,
        content_type: &str,
        object_id: DbId,
    ) -> Result<Vec<Change>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM changes \
             WHERE content_type = $1 AND object_id = $2 \
             ORDER BY created_at DESC, id DESC"
        );
        sqlx::query_as::<_, Change>(&query)
            .bind(content_type)
            .bind(object_id)
            .fetch_all(executor)
            .await
    }

    /// The newest unmerged PENDING or APPROVED change for an object.
    pub async fn find_in_progress(
        executor: impl PgExecutor<'_>,
        content_type: &str,
        object_id: DbId,
    ) -> Result<Option<Change>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM changes \
             WHERE content_type = $1 AND object_id = $2 \
               AND merged_date IS NULL AND moderation_status = ANY($3) \
             ORDER BY created_at DESC, id DESC \
             LIMIT 1"
        );
        let in_progress: Vec<i16> = ModerationStatus::IN_PROGRESS.iter().map(|s| s.id()).collect();
        sqlx::query_as::<_, Change>(&query)
            .bind(content_type)
            .bind(object_id)
            .bind(in_progress)
            .fetch_optional(executor)
            .await
    }

    /// The most recent change for an object, whatever its status.
    pub async fn latest_for_object(
        executor: impl PgExecutor<'_>,
        content_type: &str,
        object_id: DbId,
    ) -> Result<Option<Change>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM changes \
             WHERE content_type = $1 AND object_id = $2 \
             ORDER BY created_at DESC, id DESC \
             LIMIT 1"
        );
        sqlx::query_as::<_, Change>(&query)
            .bind(content_type)
            .bind(object_id)
            .fetch_optional(executor)
            .await
    }

    /// Status of the most recent change for an object, if it has any.
    pub async fn latest_status(
        executor: impl PgExecutor<'_>,
        content_type: &str,
        object_id: DbId,
    ) -> Result<Option<ModerationStatus>, ModerationError> {
        let status = sqlx::query_scalar::<_, i16>(
            "SELECT moderation_status FROM changes \
             WHERE content_type = $1 AND object_id = $2 \
             ORDER BY created_at DESC, id DESC \
             LIMIT 1",
        )
        .bind(content_type)
        .bind(object_id)
        .fetch_optional(executor)
        .await?;
        Ok(status.map(ModerationStatus::from_id).transpose()?)
    }

    /// Changes awaiting review, oldest first. Drafts are excluded.
    pub async fn list_pending(
        executor: impl PgExecutor<'_>,
        limit: i64,
    ) -> Result<Vec<Change>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM changes \
             WHERE moderation_status = $1 AND draft_state = $2 \
             ORDER BY created_at ASC, id ASC \
             LIMIT $3"
        );
        sqlx::query_as::<_, Change>(&query)
            .bind(ModerationStatus::Pending.id())
            .bind(DraftState::Ready.id())
            .bind(limit)
            .fetch_all(executor)
            .await
    }

    /// Members of a change set in application order.
    pub async fn list_for_set(
        executor: impl PgExecutor<'_>,
        set_id: DbId,
    ) -> Result<Vec<Change>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM changes \
             WHERE set_id = $1 \
             ORDER BY id ASC"
        );
        sqlx::query_as::<_, Change>(&query)
            .bind(set_id)
            .fetch_all(executor)
            .await
    }

    /// Direct constituents of a composite change.
    pub async fn constituent_ids(
        executor: impl PgExecutor<'_>,
        parent_id: DbId,
    ) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar::<_, DbId>("SELECT id FROM changes WHERE parent_id = $1 ORDER BY id")
            .bind(parent_id)
            .fetch_all(executor)
            .await
    }

    /// The change merged for the same object immediately before `change`.
    ///
    /// For an unmerged change this is simply the latest merged one.
    pub async fn previously_merged(
        executor: impl PgExecutor<'_>,
        change: &Change,
    ) -> Result<Option<Change>, sqlx::Error> {
        let Some(object_id) = change.object_id else {
            return Ok(None);
        };
        let query = format!(
            "SELECT {COLUMNS} FROM changes \
             WHERE content_type = $1 AND object_id = $2 AND id <> $3 \
               AND merged_date IS NOT NULL \
               AND ($4::timestamptz IS NULL OR merged_date < $4) \
             ORDER BY merged_date DESC, id DESC \
             LIMIT 1"
        );
        sqlx::query_as::<_, Change>(&query)
            .bind(&change.content_type)
            .bind(object_id)
            .bind(change.id)
            .bind(change.merged_date)
            .fetch_optional(executor)
            .await
    }

    /// Overwrite the stored snapshot without touching the tally.
    pub async fn refresh_snapshot(
        executor: impl PgExecutor<'_>,
        change_id: DbId,
        snapshot: &Snapshot,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE changes SET changed_object = $2, updated_at = NOW() WHERE id = $1")
            .bind(change_id)
            .bind(snapshot.to_document())
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn set_change_set(
        executor: impl PgExecutor<'_>,
        change_id: DbId,
        set_id: Option<DbId>,
    ) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("UPDATE changes SET set_id = $2, updated_at = NOW() WHERE id = $1")
                .bind(change_id)
                .bind(set_id)
                .execute(executor)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_tally(
        executor: impl PgExecutor<'_>,
        change_id: DbId,
        remaining: i32,
        status: ModerationStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE changes \
             SET n_remaining_approvals_required = $2, moderation_status = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(change_id)
        .bind(remaining)
        .bind(status.id())
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Flag every other unmerged, in-progress change for the same object
    /// as needing a rebase. Returns rows affected.
    async fn flag_siblings_for_rebase(
        executor: impl PgExecutor<'_>,
        content_type: &str,
        object_id: DbId,
        merged_id: DbId,
    ) -> Result<u64, sqlx::Error> {
        let in_progress: Vec<i16> = ModerationStatus::IN_PROGRESS.iter().map(|s| s.id()).collect();
        let result = sqlx::query(
            "UPDATE changes SET requires_rebase = TRUE, updated_at = NOW() \
             WHERE content_type = $1 AND object_id = $2 AND id <> $3 \
               AND merged_date IS NULL AND moderation_status = ANY($4)",
        )
        .bind(content_type)
        .bind(object_id)
        .bind(merged_id)
        .bind(in_progress)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }

    /// Recompute how many approvals a change still needs from its verdicts.
    pub async fn remaining_approvals(
        executor: impl PgExecutor<'_>,
        registry: &EntityRegistry,
        change: &Change,
    ) -> Result<i32, ModerationError> {
        let quorum = registry.quorum_for(&change.content_type);
        let verdicts = ModerationRepo::recent_verdicts(executor, change.id, quorum).await?;
        Ok(remaining_approvals(&verdicts, quorum, change.status()?))
    }
}

// ---------------------------------------------------------------------------
// Drafts and proposal updates
// ---------------------------------------------------------------------------

impl ChangeRepo {
    /// Mark a draft ready for review and notify moderators.
    ///
    /// Submitting an already-ready change is a no-op.
    pub async fn submit(pool: &PgPool, change_id: DbId) -> Result<Change, ModerationError> {
        let mut tx = pool.begin().await?;
        let change = Self::lock_existing(&mut tx, change_id).await?;
        if change.draft()? == DraftState::Ready {
            return Ok(change);
        }

        let query = format!(
            "UPDATE changes SET draft_state = $2, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let change = sqlx::query_as::<_, Change>(&query)
            .bind(change_id)
            .bind(DraftState::Ready.id())
            .fetch_one(&mut *tx)
            .await?;
        TaskRepo::enqueue(&mut *tx, TaskKind::NotifyModerators, None, Some(change_id)).await?;
        tx.commit().await?;

        tracing::info!(change_id, "Change submitted for review");
        Ok(change)
    }

    /// Replace a change's proposed snapshot.
    ///
    /// Returns `false` when the new snapshot is identical. Otherwise the
    /// tally restarts: existing approvals go stale, the remaining count is
    /// reset to the quorum and the change returns to PENDING.
    pub async fn update(
        pool: &PgPool,
        registry: &EntityRegistry,
        change_id: DbId,
        snapshot: &Snapshot,
    ) -> Result<bool, ModerationError> {
        let mut tx = pool.begin().await?;
        let updated = Self::update_in(&mut tx, registry, change_id, snapshot).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// [`update`](Self::update) within an open transaction.
    pub async fn update_in(
        conn: &mut PgConnection,
        registry: &EntityRegistry,
        change_id: DbId,
        snapshot: &Snapshot,
    ) -> Result<bool, ModerationError> {
        let change = Self::lock_existing(&mut *conn, change_id).await?;
        if change.is_merged() {
            return Err(CoreError::Conflict(format!(
                "Change {change_id} is merged and can no longer be edited"
            ))
            .into());
        }
        if change.snapshot()?.fingerprint() == snapshot.fingerprint() {
            tracing::debug!(change_id, "Proposed snapshot unchanged");
            return Ok(false);
        }

        let quorum = registry.quorum_for(&change.content_type);
        sqlx::query(
            "UPDATE changes \
             SET changed_object = $2, n_remaining_approvals_required = $3, \
                 moderation_status = $4, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(change_id)
        .bind(snapshot.to_document())
        .bind(quorum)
        .bind(ModerationStatus::Pending.id())
        .execute(&mut *conn)
        .await?;
        let staled = ModerationRepo::mark_approvals_stale(&mut *conn, change_id).await?;

        tracing::info!(change_id, staled, "Change proposal updated");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

impl ChangeRepo {
    /// Record a verdict given by label (`approved`, `rejected` or `pending`).
    ///
    /// An unrecognized label is a validation error.
    pub async fn moderate(
        pool: &PgPool,
        registry: &EntityRegistry,
        change_id: DbId,
        moderator: &Moderator,
        verdict: &str,
        reason: &str,
        force: bool,
    ) -> Result<Moderation, ModerationError> {
        match Verdict::parse(verdict)? {
            Verdict::Approved => {
                Self::approve(pool, registry, change_id, moderator, reason, force).await
            }
            Verdict::Rejected => Self::reject(pool, registry, change_id, moderator, reason).await,
            Verdict::Pending => Self::hold(pool, registry, change_id, moderator, reason).await,
        }
    }

    /// Approve a change and, transitively, its constituent changes.
    ///
    /// A moderator's second approval is ignored (the existing one is
    /// returned) unless `force` is set, in which case the earlier one goes
    /// stale. An admin approving with `force` promotes the change
    /// immediately. Once the change is APPROVED a post-approval task is
    /// queued in the same transaction.
    pub async fn approve(
        pool: &PgPool,
        registry: &EntityRegistry,
        change_id: DbId,
        moderator: &Moderator,
        reason: &str,
        force: bool,
    ) -> Result<Moderation, ModerationError> {
        let mut tx = pool.begin().await?;
        let moderation =
            Self::approve_in(&mut tx, registry, change_id, moderator, reason, force).await?;
        tx.commit().await?;
        Ok(moderation)
    }

    /// [`approve`](Self::approve) within an open transaction.
    pub async fn approve_in(
        conn: &mut PgConnection,
        registry: &EntityRegistry,
        change_id: DbId,
        moderator: &Moderator,
        reason: &str,
        force: bool,
    ) -> Result<Moderation, ModerationError> {
        let primary =
            Self::approve_one(&mut *conn, registry, change_id, moderator, reason, force).await?;

        // Walk the constituent tree; merged and draft constituents are skipped.
        let mut queue = Self::constituent_ids(&mut *conn, change_id).await?;
        let mut visited = vec![change_id];
        while let Some(id) = queue.pop() {
            if visited.contains(&id) {
                continue;
            }
            visited.push(id);
            queue.extend(Self::constituent_ids(&mut *conn, id).await?);

            let Some(child) = Self::lock(&mut *conn, id).await? else {
                continue;
            };
            if child.is_merged() || child.draft()? == DraftState::Draft {
                continue;
            }
            Self::approve_one(&mut *conn, registry, id, moderator, reason, force).await?;
        }
        Ok(primary)
    }

    async fn approve_one(
        conn: &mut PgConnection,
        registry: &EntityRegistry,
        change_id: DbId,
        moderator: &Moderator,
        reason: &str,
        force: bool,
    ) -> Result<Moderation, ModerationError> {
        let change = Self::lock_existing(&mut *conn, change_id).await?;
        validate_moderatable(change_id, change.draft()?)?;
        let status = change.status()?;
        if status == ModerationStatus::Merged {
            return Err(CoreError::Conflict(format!("Change {change_id} is already merged")).into());
        }

        if let Some(user_id) = moderator.user_id {
            if let Some(existing) =
                ModerationRepo::find_active_approval(&mut *conn, change_id, user_id).await?
            {
                if !force {
                    tracing::warn!(
                        change_id,
                        moderator_id = user_id,
                        "Duplicate approval ignored"
                    );
                    return Ok(existing);
                }
            }
        }
        Self::supersede_verdicts(&mut *conn, change_id, moderator).await?;

        let moderation = ModerationRepo::create(
            &mut *conn,
            moderator.user_id,
            change_id,
            Verdict::Approved,
            reason,
        )
        .await?;

        let quorum = registry.quorum_for(&change.content_type);
        let (remaining, next_status) = if moderator.is_admin && force {
            (0, ModerationStatus::Approved)
        } else {
            let verdicts = ModerationRepo::recent_verdicts(&mut *conn, change_id, quorum).await?;
            let remaining = remaining_approvals(&verdicts, quorum, status);
            (remaining, promoted_status(status, remaining).unwrap_or(status))
        };
        Self::set_tally(&mut *conn, change_id, remaining, next_status).await?;

        if next_status == ModerationStatus::Approved && status != ModerationStatus::Approved {
            TaskRepo::enqueue(
                &mut *conn,
                TaskKind::PostApproval,
                Some(moderation.id),
                Some(change_id),
            )
            .await?;
        }

        tracing::info!(
            change_id,
            moderation_id = moderation.id,
            remaining,
            status = %next_status,
            "Change approved by moderator"
        );
        Ok(moderation)
    }

    /// Reject a change. The remaining count resets to the quorum.
    pub async fn reject(
        pool: &PgPool,
        registry: &EntityRegistry,
        change_id: DbId,
        moderator: &Moderator,
        reason: &str,
    ) -> Result<Moderation, ModerationError> {
        let mut tx = pool.begin().await?;
        let moderation = Self::reject_in(&mut tx, registry, change_id, moderator, reason).await?;
        tx.commit().await?;
        Ok(moderation)
    }

    /// [`reject`](Self::reject) within an open transaction.
    pub async fn reject_in(
        conn: &mut PgConnection,
        registry: &EntityRegistry,
        change_id: DbId,
        moderator: &Moderator,
        reason: &str,
    ) -> Result<Moderation, ModerationError> {
        let change = Self::lock_existing(&mut *conn, change_id).await?;
        validate_moderatable(change_id, change.draft()?)?;
        if change.is_merged() {
            return Err(CoreError::Conflict(format!("Change {change_id} is already merged")).into());
        }

        Self::supersede_verdicts(&mut *conn, change_id, moderator).await?;
        let moderation = ModerationRepo::create(
            &mut *conn,
            moderator.user_id,
            change_id,
            Verdict::Rejected,
            reason,
        )
        .await?;
        let quorum = registry.quorum_for(&change.content_type);
        Self::set_tally(&mut *conn, change_id, quorum, ModerationStatus::Rejected).await?;
        TaskRepo::enqueue(
            &mut *conn,
            TaskKind::NotifyVerdict,
            Some(moderation.id),
            Some(change_id),
        )
        .await?;

        tracing::info!(change_id, moderation_id = moderation.id, "Change rejected");
        Ok(moderation)
    }

    /// Record a PENDING verdict. It counts as a break in the approval run.
    async fn hold(
        pool: &PgPool,
        registry: &EntityRegistry,
        change_id: DbId,
        moderator: &Moderator,
        reason: &str,
    ) -> Result<Moderation, ModerationError> {
        let mut tx = pool.begin().await?;
        let change = Self::lock_existing(&mut tx, change_id).await?;
        validate_moderatable(change_id, change.draft()?)?;
        if change.is_merged() {
            return Err(CoreError::Conflict(format!("Change {change_id} is already merged")).into());
        }

        Self::supersede_verdicts(&mut *tx, change_id, moderator).await?;
        let moderation = ModerationRepo::create(
            &mut *tx,
            moderator.user_id,
            change_id,
            Verdict::Pending,
            reason,
        )
        .await?;
        let remaining = Self::remaining_approvals(&mut *tx, registry, &change).await?;
        Self::set_tally(&mut *tx, change_id, remaining, change.status()?).await?;
        tx.commit().await?;

        tracing::info!(change_id, moderation_id = moderation.id, remaining, "Change held");
        Ok(moderation)
    }

    /// A moderator's new verdict replaces their earlier ones. Verdicts
    /// without a moderator (system hooks) never supersede anything.
    async fn supersede_verdicts(
        conn: &mut PgConnection,
        change_id: DbId,
        moderator: &Moderator,
    ) -> Result<(), sqlx::Error> {
        if let Some(user_id) = moderator.user_id {
            let staled =
                ModerationRepo::mark_stale_for_moderator(&mut *conn, change_id, user_id).await?;
            if staled > 0 {
                tracing::debug!(
                    change_id,
                    moderator_id = user_id,
                    staled,
                    "Earlier verdicts superseded"
                );
            }
        }
        Ok(())
    }

    /// Re-check the quorum under the row lock. When it is met the change is
    /// marked APPROVED and its live record verified. Returns the change as
    /// it stands afterwards; merged changes are returned untouched.
    pub async fn confirm_approval(
        pool: &PgPool,
        registry: &EntityRegistry,
        change_id: DbId,
    ) -> Result<Change, ModerationError> {
        let mut tx = pool.begin().await?;
        let change = Self::lock_existing(&mut tx, change_id).await?;
        if change.is_merged() {
            return Ok(change);
        }

        let remaining = Self::remaining_approvals(&mut *tx, registry, &change).await?;
        if remaining > 0 {
            Self::set_tally(&mut *tx, change_id, remaining, change.status()?).await?;
        } else {
            Self::set_tally(&mut *tx, change_id, 0, ModerationStatus::Approved).await?;
            if let Some(object_id) = change.object_id {
                let handler = registry.handler(&change.content_type)?;
                if !handler.set_verified(&mut tx, object_id, true).await? {
                    tracing::warn!(change_id, object_id, "Approved change has no live record");
                }
            }
        }

        let change = Self::lock_existing(&mut tx, change_id).await?;
        tx.commit().await?;
        tracing::debug!(change_id, remaining, "Approval confirmed");
        Ok(change)
    }
}

// ---------------------------------------------------------------------------
// Apply and rebase
// ---------------------------------------------------------------------------

impl ChangeRepo {
    /// Write an approved change to its live record.
    ///
    /// Returns `Ok(false)` without side effects when the change is not
    /// approved (including when it is already merged), and after rolling
    /// back when the write cannot be persisted. A pending rebase on the
    /// change or its parent is an error.
    pub async fn apply(
        pool: &PgPool,
        registry: &EntityRegistry,
        change_id: DbId,
    ) -> Result<bool, ModerationError> {
        let mut tx = pool.begin().await?;
        match Self::apply_in(&mut tx, registry, change_id).await {
            Ok(true) => match tx.commit().await {
                Ok(()) => Ok(true),
                Err(e) => {
                    tracing::error!(change_id, error = %e, "Failed to commit merged change");
                    Ok(false)
                }
            },
            Ok(false) => Ok(false),
            Err(e) if e.is_persistence_failure() => {
                tracing::error!(change_id, error = %e, "Failed to apply change; rolled back");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// [`apply`](Self::apply) within an open transaction. Persistence
    /// failures are returned as errors so the caller can roll back.
    pub async fn apply_in(
        conn: &mut PgConnection,
        registry: &EntityRegistry,
        change_id: DbId,
    ) -> Result<bool, ModerationError> {
        let change = Self::lock_existing(&mut *conn, change_id).await?;
        let parent = match change.parent_id {
            Some(parent_id) => Self::find_by_id(&mut *conn, parent_id)
                .await?
                .map(|p| (p.id, p.requires_rebase)),
            None => None,
        };

        let status = change.status()?;
        if let ApplyGate::NotApproved(status) =
            check_apply(change_id, status, change.requires_rebase, parent)?
        {
            tracing::info!(change_id, status = %status, "Change not approved; nothing applied");
            return Ok(false);
        }

        let handler = registry.handler(&change.content_type)?;
        let snapshot = change.snapshot()?;

        sqlx::query("UPDATE changes SET draft_state = $2 WHERE id = $1")
            .bind(change_id)
            .bind(DraftState::Ready.id())
            .execute(&mut *conn)
            .await?;
        let object_id = handler.write_snapshot(&mut *conn, &snapshot).await?;
        handler.set_verified(&mut *conn, object_id, true).await?;

        sqlx::query(
            "UPDATE changes \
             SET moderation_status = $2, merged_date = NOW(), object_id = $3, \
                 n_remaining_approvals_required = 0, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(change_id)
        .bind(ModerationStatus::Merged.id())
        .bind(object_id)
        .execute(&mut *conn)
        .await?;

        let flagged =
            Self::flag_siblings_for_rebase(&mut *conn, &change.content_type, object_id, change_id)
                .await?;

        tracing::info!(
            change_id,
            content_type = %change.content_type,
            object_id,
            flagged_for_rebase = flagged,
            "Change merged"
        );
        Ok(true)
    }

    /// Replay a change onto the current live record after a sibling merged.
    ///
    /// The base is the unmoderated state the first contribution was written
    /// against. Fields the proposal did not touch take their live values.
    /// The rebased proposal needs a fresh round of approvals.
    pub async fn rebase(
        pool: &PgPool,
        registry: &EntityRegistry,
        change_id: DbId,
    ) -> Result<RebaseOutcome, ModerationError> {
        let mut tx = pool.begin().await?;
        let change = Self::lock_existing(&mut tx, change_id).await?;
        if change.is_merged() {
            return Err(CoreError::Conflict(format!("Change {change_id} is already merged")).into());
        }

        let handler = registry.handler(&change.content_type)?;
        let current = match change.object_id {
            Some(object_id) => handler.load_snapshot(&mut tx, object_id).await?,
            None => None,
        };
        let current = current.ok_or_else(|| {
            CoreError::Conflict(format!(
                "Change {change_id} has no live record to rebase onto"
            ))
        })?;

        let proposed = change.snapshot()?;
        let base = match ContributionRepo::earliest_for_change(&mut *tx, change_id).await? {
            Some(contribution) => contribution.before()?,
            None => None,
        };
        let base = base.unwrap_or_else(|| current.clone());
        let outcome = rebase_onto(&base, &proposed, &current);
        if !outcome.conflicts.is_empty() {
            tracing::warn!(
                change_id,
                conflicts = ?outcome.conflicts,
                "Rebase kept proposed values over concurrent edits"
            );
        }

        let quorum = registry.quorum_for(&change.content_type);
        sqlx::query(
            "UPDATE changes \
             SET changed_object = $2, requires_rebase = FALSE, \
                 n_remaining_approvals_required = $3, moderation_status = $4, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(change_id)
        .bind(outcome.snapshot.to_document())
        .bind(quorum)
        .bind(ModerationStatus::Pending.id())
        .execute(&mut *tx)
        .await?;
        ModerationRepo::mark_approvals_stale(&mut *tx, change_id).await?;
        tx.commit().await?;

        tracing::info!(change_id, "Change rebased");
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

impl ChangeRepo {
    /// The state a change is compared against.
    ///
    /// A merged change is compared with the change merged just before it.
    /// An unmerged change is compared with the live record, except when it
    /// created that record, in which case there is no prior state.
    pub async fn unchanged_object(
        conn: &mut PgConnection,
        registry: &EntityRegistry,
        change: &Change,
    ) -> Result<Option<Snapshot>, ModerationError> {
        if change.is_merged() {
            return match Self::previously_merged(&mut *conn, change).await? {
                Some(previous) => Ok(Some(previous.snapshot()?)),
                None => Ok(None),
            };
        }

        let Some(object_id) = change.object_id else {
            return Ok(None);
        };
        let creates_object = ContributionRepo::earliest_for_change(&mut *conn, change.id)
            .await?
            .is_some_and(|first| first.content_before.is_none());
        if creates_object && Self::previously_merged(&mut *conn, change).await?.is_none() {
            return Ok(None);
        }

        let handler = registry.handler(&change.content_type)?;
        handler.load_snapshot(conn, object_id).await
    }

    /// Field-by-field diff of a change against its unchanged object.
    ///
    /// The entity type's excluded fields are always left out, on top of
    /// any in `options`.
    pub async fn diff(
        pool: &PgPool,
        registry: &EntityRegistry,
        change_id: DbId,
        options: &DiffOptions<'_>,
    ) -> Result<IndexMap<String, FieldChange>, ModerationError> {
        let mut conn = pool.acquire().await?;
        let change = Self::find_by_id(&mut *conn, change_id)
            .await?
            .ok_or_else(|| ModerationError::not_found("Change", change_id))?;
        let handler = registry.handler(&change.content_type)?;

        let before = Self::unchanged_object(&mut conn, registry, &change).await?;
        let after = change.snapshot()?;

        let labels = if options.resolve_foreign_keys {
            let mut sides = vec![&after];
            sides.extend(before.as_ref());
            relation_labels(&mut conn, handler.fields(), &sides).await?
        } else {
            Default::default()
        };

        let excluded: Vec<&str> = options
            .excluded_fields
            .iter()
            .chain(handler.policy().fields_excluded)
            .copied()
            .collect();
        let options = DiffOptions {
            excluded_fields: &excluded,
            ..*options
        };

        Ok(diff_fields(
            handler.fields(),
            before.as_ref(),
            Some(&after),
            &options,
            &labels,
        ))
    }
}
