//! Moderated access to a domain entity's storage.
//!
//! [`ModeratingRepository`] wraps an [`EntityRepository`]. Saving through
//! it never changes an existing live row (unless the policy's trusted fast
//! path applies); the edit is staged as a [`Change`] instead, with a
//! [`ContentContribution`] recording who proposed what. Reads through
//! [`find_visible`](ModeratingRepository::find_visible) hide unverified
//! rows according to the entity's policy.
//!
//! [`Change`]: crate::models::change::Change
//! [`ContentContribution`]: crate::models::contribution::ContentContribution

use std::marker::PhantomData;
use std::sync::Arc;

use modhist_core::entity::{is_visible, ModeratedEntity};
use modhist_core::error::CoreError;
use modhist_core::snapshot::{self, Snapshot};
use modhist_core::status::{DraftState, ModerationStatus};
use modhist_core::types::DbId;
use serde::Serialize;
use sqlx::{PgConnection, PgPool};

use crate::error::ModerationError;
use crate::models::change::{Change, CreateChange};
use crate::models::moderation::Moderator;
use crate::models::task::TaskKind;
use crate::registry::{EntityRegistry, EntityRepository};
use crate::repositories::{ChangeRepo, ContributionRepo, TaskRepo};
use crate::resolver::PgReferenceResolver;

/// What a moderated save did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SaveOutcome {
    /// A new, unverified row was inserted with a draft change describing it.
    Created { object_id: DbId, change_id: DbId },
    /// The edit was staged on a change; the live row is untouched.
    Proposed { change_id: DbId, new_change: bool },
    /// The edit matched what is already stored or proposed.
    Unchanged,
    /// The policy's trusted fast path wrote the live row directly.
    Bypassed { change_id: DbId },
}

/// Routes writes of `E` through moderation.
pub struct ModeratingRepository<E, R> {
    pool: PgPool,
    repo: Arc<R>,
    registry: Arc<EntityRegistry>,
    _entity: PhantomData<fn() -> E>,
}

impl<E, R> std::fmt::Debug for ModeratingRepository<E, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeratingRepository").finish_non_exhaustive()
    }
}

impl<E, R> ModeratingRepository<E, R>
where
    E: ModeratedEntity,
    R: EntityRepository<E>,
{
    /// `E` must already be registered with `registry`.
    pub fn new(
        pool: PgPool,
        repo: Arc<R>,
        registry: Arc<EntityRegistry>,
    ) -> Result<Self, ModerationError> {
        if !registry.contains(E::MODEL) {
            return Err(ModerationError::UnknownContentType(E::MODEL.to_string()));
        }
        Ok(Self {
            pool,
            repo,
            registry,
            _entity: PhantomData,
        })
    }

    /// Load the live row, honouring the visibility policy.
    pub async fn find_visible(&self, id: DbId) -> Result<Option<E>, ModerationError> {
        let mut conn = self.pool.acquire().await?;
        let Some(entity) = self.repo.find_unmoderated(&mut conn, id).await? else {
            return Ok(None);
        };
        let latest = ChangeRepo::latest_status(&mut *conn, E::MODEL, id).await?;
        Ok(is_visible(&E::policy(), entity.verified(), latest).then_some(entity))
    }

    /// Load the live row regardless of its visibility.
    pub async fn find_unmoderated(&self, id: DbId) -> Result<Option<E>, ModerationError> {
        let mut conn = self.pool.acquire().await?;
        Ok(self.repo.find_unmoderated(&mut conn, id).await?)
    }

    /// Save `entity` on behalf of `contributor`.
    ///
    /// New entities are inserted unverified together with a DRAFT change.
    /// Edits to existing entities are staged on the in-progress change (or
    /// a new one when the policy keeps history) and leave the live row as
    /// it was. Auto-reject and auto-approve hooks run last.
    pub async fn save(
        &self,
        entity: &E,
        contributor: Option<DbId>,
    ) -> Result<SaveOutcome, ModerationError> {
        let mut tx = self.pool.begin().await?;
        let prior = match entity.id() {
            Some(id) => self.repo.find_unmoderated(&mut tx, id).await?,
            None => None,
        };
        let outcome = match prior {
            None => self.create_in(&mut tx, entity, contributor).await?,
            Some(prior) => self.propose_in(&mut tx, &prior, entity, contributor).await?,
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn snapshot_of(conn: &mut PgConnection, entity: &E) -> Result<Snapshot, ModerationError> {
        let resolver = PgReferenceResolver::new(conn);
        Ok(snapshot::serialize(entity, &resolver).await?)
    }

    /// Insert `entity` unverified and describe it with a DRAFT change.
    ///
    /// Moderators are not notified here: a draft cannot be moderated, so
    /// the review request is queued by [`ChangeRepo::submit`] when the
    /// contributor marks it ready.
    async fn create_in(
        &self,
        conn: &mut PgConnection,
        entity: &E,
        contributor: Option<DbId>,
    ) -> Result<SaveOutcome, ModerationError> {
        let mut unverified = entity.clone();
        unverified.set_verified(false);
        let saved = self.repo.raw_save(&mut *conn, &unverified).await?;
        let object_id = saved.id().ok_or_else(|| {
            CoreError::Internal(format!("{} was inserted without an id", E::MODEL))
        })?;

        let snapshot = Self::snapshot_of(&mut *conn, &saved).await?;
        let change = ChangeRepo::create(
            &mut *conn,
            &CreateChange {
                content_type: E::MODEL.to_string(),
                object_id: Some(object_id),
                changed_object: snapshot.clone(),
                set_id: None,
                parent_id: None,
                draft_state: DraftState::Draft,
                n_remaining_approvals_required: self.registry.quorum_for(E::MODEL),
            },
        )
        .await?;
        ContributionRepo::create(&mut *conn, contributor, change.id, None, &snapshot).await?;

        tracing::info!(
            content_type = E::MODEL,
            object_id,
            change_id = change.id,
            "Created unverified entity with draft change"
        );
        Ok(SaveOutcome::Created {
            object_id,
            change_id: change.id,
        })
    }

    async fn propose_in(
        &self,
        conn: &mut PgConnection,
        prior: &E,
        incoming: &E,
        contributor: Option<DbId>,
    ) -> Result<SaveOutcome, ModerationError> {
        let policy = E::policy();
        let object_id = prior.id().ok_or_else(|| {
            CoreError::Internal(format!("stored {} has no id", E::MODEL))
        })?;

        // Visibility is owned by moderation, never by the contributor.
        let mut incoming = incoming.clone();
        incoming.set_verified(prior.verified());

        let prior_snapshot = Self::snapshot_of(&mut *conn, prior).await?;
        let incoming_snapshot = Self::snapshot_of(&mut *conn, &incoming).await?;
        if prior_snapshot == incoming_snapshot {
            tracing::debug!(content_type = E::MODEL, object_id, "Save matches live state");
            return Ok(SaveOutcome::Unchanged);
        }

        let in_progress = ChangeRepo::find_in_progress(&mut *conn, E::MODEL, object_id).await?;

        // Trusted path: the latest change was approved, possibly merged since.
        let trusted = if policy.bypass_after_approval {
            match &in_progress {
                Some(change) => Some(change.clone()),
                None => ChangeRepo::latest_for_object(&mut *conn, E::MODEL, object_id).await?,
            }
        } else {
            None
        };
        if let Some(change) = trusted {
            if matches!(
                change.status()?,
                ModerationStatus::Approved | ModerationStatus::Merged
            ) {
                self.repo.raw_save(&mut *conn, &incoming).await?;
                ChangeRepo::refresh_snapshot(&mut *conn, change.id, &incoming_snapshot).await?;
                ContributionRepo::create(
                    &mut *conn,
                    contributor,
                    change.id,
                    Some(&prior_snapshot),
                    &incoming_snapshot,
                )
                .await?;
                tracing::info!(
                    content_type = E::MODEL,
                    object_id,
                    change_id = change.id,
                    "Approved entity updated directly"
                );
                return Ok(SaveOutcome::Bypassed {
                    change_id: change.id,
                });
            }
        }

        let (change, new_change) = match in_progress {
            Some(change) if !policy.keep_history => {
                if !ChangeRepo::update_in(&mut *conn, &self.registry, change.id, &incoming_snapshot)
                    .await?
                {
                    return Ok(SaveOutcome::Unchanged);
                }
                (change, false)
            }
            _ => {
                let change = ChangeRepo::create(
                    &mut *conn,
                    &CreateChange {
                        content_type: E::MODEL.to_string(),
                        object_id: Some(object_id),
                        changed_object: incoming_snapshot.clone(),
                        set_id: None,
                        parent_id: None,
                        draft_state: DraftState::Ready,
                        n_remaining_approvals_required: self.registry.quorum_for(E::MODEL),
                    },
                )
                .await?;
                (change, true)
            }
        };

        ContributionRepo::create(
            &mut *conn,
            contributor,
            change.id,
            Some(&prior_snapshot),
            &incoming_snapshot,
        )
        .await?;
        self.run_hooks(conn, &change, &incoming_snapshot).await?;

        tracing::info!(
            content_type = E::MODEL,
            object_id,
            change_id = change.id,
            new_change,
            "Edit staged for moderation"
        );
        Ok(SaveOutcome::Proposed {
            change_id: change.id,
            new_change,
        })
    }

    /// Auto-reject wins over auto-approve. Changes no hook settles are
    /// announced to moderators. Drafts are left alone.
    async fn run_hooks(
        &self,
        conn: &mut PgConnection,
        change: &Change,
        proposed: &Snapshot,
    ) -> Result<(), ModerationError> {
        if change.draft()? == DraftState::Draft {
            return Ok(());
        }
        let policy = E::policy();
        let system = Moderator::system();

        if (policy.is_auto_reject)(proposed) {
            ChangeRepo::reject_in(conn, &self.registry, change.id, &system, "Auto-rejected")
                .await?;
        } else if (policy.is_auto_approve)(proposed) {
            ChangeRepo::approve_in(conn, &self.registry, change.id, &system, "Auto-approved", true)
                .await?;
        } else {
            TaskRepo::enqueue(conn, TaskKind::NotifyModerators, None, Some(change.id)).await?;
        }
        Ok(())
    }
}
