//! Approval quorum counting and state-machine guards for changes.
//!
//! Only a contiguous run of the most recent non-stale approvals counts
//! toward the quorum. Any other verdict in between breaks the run, so an
//! old approval can never be banked toward a later proposal.

use crate::error::CoreError;
use crate::status::{DraftState, ModerationStatus, Verdict};
use crate::types::DbId;

/// Approvals still needed before a change is approved.
///
/// `recent_verdicts` must be the change's non-stale verdicts ordered most
/// recent first (ties broken by insertion order).
pub fn remaining_approvals(
    recent_verdicts: &[Verdict],
    quorum: i32,
    status: ModerationStatus,
) -> i32 {
    if matches!(status, ModerationStatus::Approved | ModerationStatus::Merged) {
        return 0;
    }
    let mut remaining = quorum;
    for verdict in recent_verdicts.iter().take(quorum.max(0) as usize) {
        if *verdict != Verdict::Approved {
            break;
        }
        remaining -= 1;
    }
    remaining.max(0)
}

/// The status a change moves to once its tally is known, if any.
///
/// Only pending or rejected changes can be promoted; the transition fires
/// exactly when the remaining count reaches zero.
pub fn promoted_status(current: ModerationStatus, remaining: i32) -> Option<ModerationStatus> {
    match current {
        ModerationStatus::Pending | ModerationStatus::Rejected if remaining == 0 => {
            Some(ModerationStatus::Approved)
        }
        _ => None,
    }
}

/// Drafts are still being composed and cannot be moderated.
pub fn validate_moderatable(change_id: DbId, draft_state: DraftState) -> Result<(), CoreError> {
    match draft_state {
        DraftState::Ready => Ok(()),
        DraftState::Draft => Err(CoreError::Validation(format!(
            "Change {change_id} is still a draft and cannot be moderated"
        ))),
    }
}

/// Outcome of the apply preconditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyGate {
    Proceed,
    /// Not approved (or already merged). Apply is a logged no-op.
    NotApproved(ModerationStatus),
}

/// Check whether a change may be written to its live record.
///
/// A pending rebase on the change or its parent is a hard error: applying a
/// stale snapshot would silently discard the sibling edit merged before it.
pub fn check_apply(
    change_id: DbId,
    status: ModerationStatus,
    requires_rebase: bool,
    parent: Option<(DbId, bool)>,
) -> Result<ApplyGate, CoreError> {
    if requires_rebase {
        return Err(CoreError::RebaseRequired { change_id });
    }
    if let Some((parent_id, true)) = parent {
        return Err(CoreError::RebaseRequired {
            change_id: parent_id,
        });
    }
    Ok(match status {
        ModerationStatus::Approved => ApplyGate::Proceed,
        other => ApplyGate::NotApproved(other),
    })
}
