//! Best-effort notifications. Failures are logged and never fail a task or
//! undo a state transition.

use modhist_core::diff::{DiffOptions, DiffStatus};
use modhist_core::status::Verdict;
use modhist_core::types::DbId;
use modhist_db::models::change::Change;
use modhist_db::models::moderation::Moderation;
use modhist_db::repositories::{ChangeRepo, ContributionRepo, ModerationRepo};
use modhist_events::Notification;

use crate::context::WorkerContext;
use crate::error::WorkerError;
use crate::handlers::post_approval::PostApprovalOutcome;

/// Tell moderators a change is waiting for review.
pub async fn notify_moderators(ctx: &WorkerContext, change_id: DbId) {
    if let Err(e) = try_notify_moderators(ctx, change_id).await {
        tracing::warn!(change_id, error = %e, "Failed to prepare review notification");
    }
}

async fn try_notify_moderators(ctx: &WorkerContext, change_id: DbId) -> Result<(), WorkerError> {
    let Some(change) = ChangeRepo::find_by_id(&ctx.pool, change_id).await? else {
        tracing::debug!(change_id, "Change vanished before review notification");
        return Ok(());
    };
    let diff =
        ChangeRepo::diff(&ctx.pool, &ctx.registry, change_id, &DiffOptions::default()).await?;
    let edited: Vec<String> = diff
        .iter()
        .filter(|(_, field)| field.status() != DiffStatus::Unchanged)
        .map(|(_, field)| field.label().to_string())
        .collect();

    let recipients = ctx.directory.moderators().await;
    send(ctx, review_request(&change, &edited).to(recipients)).await;
    Ok(())
}

/// Tell a change's contributors about a verdict on it.
pub async fn notify_verdict(ctx: &WorkerContext, moderation_id: DbId) {
    if let Err(e) = try_notify_verdict(ctx, moderation_id).await {
        tracing::warn!(moderation_id, error = %e, "Failed to prepare verdict notification");
    }
}

async fn try_notify_verdict(ctx: &WorkerContext, moderation_id: DbId) -> Result<(), WorkerError> {
    let Some(moderation) = ModerationRepo::find_by_id(&ctx.pool, moderation_id).await? else {
        return Ok(());
    };
    let Some(change) = ChangeRepo::find_by_id(&ctx.pool, moderation.change_id).await? else {
        return Ok(());
    };
    let recipients = contributor_addresses(ctx, change.id).await?;
    send(ctx, verdict_notice(&change, &moderation)?.to(recipients)).await;
    Ok(())
}

/// Report a post-approval result to contributors and moderators.
pub async fn notify_outcome(ctx: &WorkerContext, change: &Change, outcome: &PostApprovalOutcome) {
    let Some(notification) = outcome_notice(change, outcome) else {
        return;
    };
    let mut recipients = match contributor_addresses(ctx, change.id).await {
        Ok(addresses) => addresses,
        Err(e) => {
            tracing::warn!(change_id = change.id, error = %e, "Failed to look up contributors");
            Vec::new()
        }
    };
    recipients.extend(ctx.directory.moderators().await);
    send(ctx, notification.to(recipients)).await;
}

async fn contributor_addresses(
    ctx: &WorkerContext,
    change_id: DbId,
) -> Result<Vec<String>, WorkerError> {
    let ids = ContributionRepo::contributor_ids_for_change(&ctx.pool, change_id).await?;
    Ok(ctx.directory.users(&ids).await)
}

async fn send(ctx: &WorkerContext, notification: Notification) {
    let Some(notifier) = &ctx.notifier else {
        tracing::debug!(subject = %notification.subject, "Notifications disabled");
        return;
    };
    if notification.recipients.is_empty() {
        tracing::debug!(subject = %notification.subject, "No recipients");
        return;
    }
    if let Err(e) = notifier.send(&notification).await {
        tracing::warn!(subject = %notification.subject, error = %e, "Notification not delivered");
    }
}

// ---------------------------------------------------------------------------
// Message bodies
// ---------------------------------------------------------------------------

fn describe(change: &Change) -> String {
    match change.object_id {
        Some(object_id) => format!("{} #{object_id}", change.content_type),
        None => format!("new {}", change.content_type),
    }
}

fn review_request(change: &Change, edited: &[String]) -> Notification {
    let mut body = format!("Change {} to {} is waiting for review.\n", change.id, describe(change));
    if !edited.is_empty() {
        body.push_str(&format!("Edited fields: {}\n", edited.join(", ")));
    }
    body.push_str(&format!(
        "Approvals still needed: {}\n",
        change.n_remaining_approvals_required
    ));
    Notification::new(format!("Change {} awaits review", change.id), body)
}

fn verdict_notice(change: &Change, moderation: &Moderation) -> Result<Notification, WorkerError> {
    let verdict = moderation.verdict()?;
    let headline = match verdict {
        Verdict::Approved => "was approved by a moderator",
        Verdict::Rejected => "was rejected",
        Verdict::Pending => "was put on hold",
    };
    let mut body = format!("Your change {} to {} {headline}.\n", change.id, describe(change));
    if !moderation.reason.is_empty() {
        body.push_str(&format!("Reason: {}\n", moderation.reason));
    }
    Ok(Notification::new(
        format!("Change {} {}", change.id, verdict.as_str()),
        body,
    ))
}

fn outcome_notice(change: &Change, outcome: &PostApprovalOutcome) -> Option<Notification> {
    let (subject, body) = match outcome {
        PostApprovalOutcome::Merged { change_id } => (
            format!("Change {change_id} merged"),
            format!("Change {change_id} to {} has been applied.", describe(change)),
        ),
        PostApprovalOutcome::SetMerged { set_id } => (
            format!("Change set {set_id} merged"),
            format!("Every change in change set {set_id} has been applied."),
        ),
        PostApprovalOutcome::RebaseRequired { change_id } => (
            format!("Change {change_id} needs a rebase"),
            format!(
                "Change {change_id} was approved, but another change to the same record \
                 was applied first. It must be rebased and approved again."
            ),
        ),
        _ => return None,
    };
    Some(Notification::new(subject, body))
}
