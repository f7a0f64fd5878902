//! Finishing an approval out of band.
//!
//! Queued by the approval that met the quorum. Re-checks the tally, marks
//! the change APPROVED and its record verified, then applies the change
//! (or its whole change set once every member is approved). Safe to run
//! more than once: a merged change is left alone. A failed apply is
//! announced and returned as an error so the task is retried.

use modhist_core::status::ModerationStatus;
use modhist_core::types::DbId;
use modhist_db::models::change::Change;
use modhist_db::repositories::{ChangeRepo, ChangeSetRepo, ModerationRepo};
use modhist_events::bus::{
    ModerationEvent, CHANGE_APPLY_FAILED, CHANGE_APPROVED, CHANGE_MERGED, CHANGE_REBASE_REQUIRED,
    CHANGE_SET_MERGED,
};
use serde::Serialize;
use serde_json::json;

use crate::context::WorkerContext;
use crate::error::WorkerError;
use crate::handlers::notify;

/// What the post-approval step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PostApprovalOutcome {
    /// Already merged, by an earlier run or another worker.
    AlreadyMerged,
    /// The quorum no longer holds, e.g. the proposal was edited since.
    AwaitingApprovals { remaining: i32 },
    /// Approved, but other members of its change set are not yet.
    AwaitingSet { set_id: DbId },
    Merged { change_id: DbId },
    SetMerged { set_id: DbId },
    /// A sibling merged first; the change must be rebased and re-approved.
    RebaseRequired { change_id: DbId },
}

pub async fn handle(
    ctx: &WorkerContext,
    moderation_id: DbId,
) -> Result<PostApprovalOutcome, WorkerError> {
    let moderation = ModerationRepo::find_by_id(&ctx.pool, moderation_id)
        .await?
        .ok_or(WorkerError::NotFound {
            entity: "Moderation",
            id: moderation_id,
        })?;

    let change = ChangeRepo::confirm_approval(&ctx.pool, &ctx.registry, moderation.change_id)
        .await?;
    if change.is_merged() {
        tracing::debug!(change_id = change.id, "Change already merged");
        return Ok(PostApprovalOutcome::AlreadyMerged);
    }
    if change.status()? != ModerationStatus::Approved {
        tracing::info!(
            change_id = change.id,
            remaining = change.n_remaining_approvals_required,
            "Quorum no longer met; nothing to apply"
        );
        return Ok(PostApprovalOutcome::AwaitingApprovals {
            remaining: change.n_remaining_approvals_required,
        });
    }

    ctx.bus.publish(
        event(CHANGE_APPROVED, &change).with_actor(moderation.moderator_id),
    );

    let applied = match change.set_id {
        Some(set_id) => apply_set(ctx, set_id).await,
        None => apply_change(ctx, &change).await,
    };
    let outcome = match applied {
        Ok(outcome) => outcome,
        Err(e) => {
            if matches!(
                e,
                WorkerError::ApplyFailed { .. } | WorkerError::SetApplyFailed { .. }
            ) {
                let mut failed = event(CHANGE_APPLY_FAILED, &change)
                    .with_payload(json!({ "error": e.to_string() }));
                if let Some(set_id) = change.set_id {
                    failed = failed.with_set(set_id);
                }
                ctx.bus.publish(failed);
            }
            return Err(e);
        }
    };

    match outcome {
        PostApprovalOutcome::Merged { .. } => {
            ctx.bus.publish(event(CHANGE_MERGED, &change));
        }
        PostApprovalOutcome::SetMerged { set_id } => {
            ctx.bus.publish(event(CHANGE_SET_MERGED, &change).with_set(set_id));
        }
        PostApprovalOutcome::RebaseRequired { change_id } => {
            ctx.bus.publish(ModerationEvent::new(CHANGE_REBASE_REQUIRED).with_change(change_id));
        }
        _ => {}
    }
    notify::notify_outcome(ctx, &change, &outcome).await;

    tracing::info!(
        change_id = change.id,
        moderation_id,
        outcome = ?outcome,
        "Post-approval handled"
    );
    Ok(outcome)
}

fn event(event_type: &str, change: &Change) -> ModerationEvent {
    ModerationEvent::new(event_type)
        .with_change(change.id)
        .with_object(change.content_type.clone(), change.object_id)
}

async fn apply_change(
    ctx: &WorkerContext,
    change: &Change,
) -> Result<PostApprovalOutcome, WorkerError> {
    match ChangeRepo::apply(&ctx.pool, &ctx.registry, change.id).await {
        Ok(true) => Ok(PostApprovalOutcome::Merged {
            change_id: change.id,
        }),
        Ok(false) => {
            let current = ChangeRepo::find_by_id(&ctx.pool, change.id).await?;
            if current.is_some_and(|c| c.is_merged()) {
                Ok(PostApprovalOutcome::AlreadyMerged)
            } else {
                Err(WorkerError::ApplyFailed {
                    change_id: change.id,
                })
            }
        }
        Err(e) if e.is_rebase_required() => {
            tracing::warn!(change_id = change.id, "Change needs a rebase before it can merge");
            Ok(PostApprovalOutcome::RebaseRequired {
                change_id: change.id,
            })
        }
        Err(e) => Err(e.into()),
    }
}

async fn apply_set(ctx: &WorkerContext, set_id: DbId) -> Result<PostApprovalOutcome, WorkerError> {
    let set = ChangeSetRepo::find_by_id(&ctx.pool, set_id)
        .await?
        .ok_or(WorkerError::NotFound {
            entity: "ChangeSet",
            id: set_id,
        })?;
    if set.status()? == ModerationStatus::Merged {
        return Ok(PostApprovalOutcome::AlreadyMerged);
    }
    if !ChangeSetRepo::all_members_approved(&ctx.pool, set_id).await? {
        tracing::info!(set_id, "Waiting for the rest of the change set");
        return Ok(PostApprovalOutcome::AwaitingSet { set_id });
    }
    if ChangeSetRepo::mark_approved(&ctx.pool, set_id).await? {
        tracing::info!(set_id, "Change set approved");
    }

    match ChangeSetRepo::apply(&ctx.pool, &ctx.registry, set_id).await {
        Ok(true) => Ok(PostApprovalOutcome::SetMerged { set_id }),
        Ok(false) => {
            let current = ChangeSetRepo::find_by_id(&ctx.pool, set_id).await?;
            match current.map(|s| s.status()).transpose()? {
                Some(ModerationStatus::Merged) => Ok(PostApprovalOutcome::AlreadyMerged),
                _ => Err(WorkerError::SetApplyFailed { set_id }),
            }
        }
        Err(e) => match e.rebase_change_id() {
            Some(change_id) => {
                tracing::warn!(set_id, change_id, "Change set member needs a rebase");
                Ok(PostApprovalOutcome::RebaseRequired { change_id })
            }
            None => Err(e.into()),
        },
    }
}
