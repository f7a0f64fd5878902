//! Integration tests for moderated saves and visibility.
//!
//! - New entities land unverified with a draft change
//! - Edits are staged, never written to the live row
//! - Policies: kept history, visible-until-rejected, trusted fast path
//!   (before and after the approved change is merged)
//! - Auto-reject and auto-approve hooks

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use modhist_core::config::ModerationConfig;
use modhist_core::status::{DraftState, ModerationStatus, Verdict};
use modhist_core::types::DbId;
use modhist_db::interception::{ModeratingRepository, SaveOutcome};
use modhist_db::models::moderation::Moderator;
use modhist_db::models::task::TaskKind;
use modhist_db::registry::EntityRegistry;
use modhist_db::repositories::{ChangeRepo, ContributionRepo, ModerationRepo, TaskRepo};
use modhist_db::ModerationError;
use serde_json::json;
use sqlx::PgPool;

use common::{Outlet, Quote, QuoteRepo, Source, ALICE, BOB, CAROL};

/// A source whose creating change is approved but not yet applied.
async fn approved_source(pool: &PgPool, registry: &Arc<EntityRegistry>, title: &str) -> Source {
    let outcome = common::sources(pool, registry)
        .save(&common::new_source(title), Some(ALICE))
        .await
        .unwrap();
    let SaveOutcome::Created {
        object_id,
        change_id,
    } = outcome
    else {
        panic!("expected creation, got {outcome:?}");
    };
    ChangeRepo::submit(pool, change_id).await.unwrap();
    ChangeRepo::approve(pool, registry, change_id, &Moderator::user(BOB), "", false)
        .await
        .unwrap();
    common::sources(pool, registry)
        .find_unmoderated(object_id)
        .await
        .unwrap()
        .unwrap()
}

/// A source whose creating change has been applied.
async fn published_source(pool: &PgPool, registry: &Arc<EntityRegistry>, title: &str) -> Source {
    let source = approved_source(pool, registry, title).await;
    let object_id = source.id.unwrap();
    let creating = ChangeRepo::list_for_object(pool, "sources.source", object_id)
        .await
        .unwrap()
        .remove(0);
    assert!(ChangeRepo::apply(pool, registry, creating.id).await.unwrap());
    common::sources(pool, registry)
        .find_unmoderated(object_id)
        .await
        .unwrap()
        .unwrap()
}

/// An outlet whose creating change is approved. Returns it with that change's id.
async fn approved_outlet(
    pool: &PgPool,
    registry: &Arc<EntityRegistry>,
    name: &str,
) -> (Outlet, DbId) {
    let repo = common::outlets(pool, registry);
    let outcome = repo.save(&common::new_outlet(name), Some(ALICE)).await.unwrap();
    let SaveOutcome::Created {
        object_id,
        change_id,
    } = outcome
    else {
        panic!("expected creation, got {outcome:?}");
    };
    ChangeRepo::submit(pool, change_id).await.unwrap();
    ChangeRepo::approve(pool, registry, change_id, &Moderator::user(BOB), "", false)
        .await
        .unwrap();
    let outlet = repo.find_unmoderated(object_id).await.unwrap().unwrap();
    (outlet, change_id)
}

// ---------------------------------------------------------------------------
// Test: creation
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_create_inserts_unverified_with_draft_change(pool: PgPool) {
    common::setup(&pool).await;
    let registry = common::registry();
    let mut quote = common::new_quote("We shall fight on the beaches");
    quote.verified = true;

    let outcome = common::quotes(&pool, &registry)
        .save(&quote, Some(ALICE))
        .await
        .unwrap();
    let SaveOutcome::Created {
        object_id,
        change_id,
    } = outcome
    else {
        panic!("expected creation, got {outcome:?}");
    };

    let live = common::quotes(&pool, &registry)
        .find_unmoderated(object_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!live.verified, "contributors cannot self-verify");

    let change = ChangeRepo::find_by_id(&pool, change_id).await.unwrap().unwrap();
    assert_eq!(change.draft().unwrap(), DraftState::Draft);
    assert_eq!(change.status().unwrap(), ModerationStatus::Pending);
    assert_eq!(change.object_id, Some(object_id));
    assert_eq!(change.n_remaining_approvals_required, 2);
    assert_eq!(
        change.snapshot().unwrap().field("text"),
        Some(&json!("We shall fight on the beaches"))
    );

    let contributions = ContributionRepo::list_for_change(&pool, change_id).await.unwrap();
    assert_eq!(contributions.len(), 1);
    assert_eq!(contributions[0].contributor_id, Some(ALICE));
    assert!(contributions[0].before().unwrap().is_none());

    // The review request waits until the draft is submitted.
    assert!(TaskRepo::list_for_change(&pool, change_id).await.unwrap().is_empty());
    ChangeRepo::submit(&pool, change_id).await.unwrap();
    let kinds: Vec<_> = TaskRepo::list_for_change(&pool, change_id)
        .await
        .unwrap()
        .iter()
        .map(|t| t.kind().unwrap())
        .collect();
    assert_eq!(kinds, vec![TaskKind::NotifyModerators]);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_unverified_quote_is_hidden(pool: PgPool) {
    common::setup(&pool).await;
    let registry = common::registry();
    let (object_id, _) = common::submitted_quote(&pool, &registry, "Hidden for now").await;

    let repo = common::quotes(&pool, &registry);
    assert!(repo.find_visible(object_id).await.unwrap().is_none());
    assert!(repo.find_unmoderated(object_id).await.unwrap().is_some());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_unregistered_entity_is_refused(pool: PgPool) {
    let registry = Arc::new(EntityRegistry::new(ModerationConfig::default()));
    let result = ModeratingRepository::<Quote, QuoteRepo>::new(pool, Arc::new(QuoteRepo), registry);
    assert_matches!(
        result,
        Err(ModerationError::UnknownContentType(model)) if model == "quotes.quote"
    );
}

// ---------------------------------------------------------------------------
// Test: edits are staged
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_edit_is_staged_and_live_row_untouched(pool: PgPool) {
    common::setup(&pool).await;
    let registry = common::registry();
    let quote = common::published_quote(&pool, &registry, "Original").await;
    let object_id = quote.id.unwrap();
    let repo = common::quotes(&pool, &registry);

    let first = repo
        .save(
            &Quote {
                text: "First edit".to_string(),
                ..quote.clone()
            },
            Some(ALICE),
        )
        .await
        .unwrap();
    let SaveOutcome::Proposed {
        change_id,
        new_change: true,
    } = first
    else {
        panic!("expected a new proposal, got {first:?}");
    };

    // A second contributor's edit joins the same in-progress change.
    let second = repo
        .save(
            &Quote {
                text: "Second edit".to_string(),
                ..quote.clone()
            },
            Some(BOB),
        )
        .await
        .unwrap();
    assert_eq!(
        second,
        SaveOutcome::Proposed {
            change_id,
            new_change: false
        }
    );

    let live = repo.find_visible(object_id).await.unwrap().unwrap();
    assert_eq!(live.text, "Original");

    let change = ChangeRepo::find_by_id(&pool, change_id).await.unwrap().unwrap();
    assert_eq!(change.snapshot().unwrap().field("text"), Some(&json!("Second edit")));
    assert_eq!(change.draft().unwrap(), DraftState::Ready);
    let contributors = ContributionRepo::contributor_ids_for_change(&pool, change_id)
        .await
        .unwrap();
    assert_eq!(contributors, vec![ALICE, BOB]);

    let notified = TaskRepo::list_for_change(&pool, change_id)
        .await
        .unwrap()
        .iter()
        .filter(|t| t.kind().unwrap() == TaskKind::NotifyModerators)
        .count();
    assert_eq!(notified, 2);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_save_without_edits_is_unchanged(pool: PgPool) {
    common::setup(&pool).await;
    let registry = common::registry();
    let quote = common::published_quote(&pool, &registry, "Steady").await;
    let repo = common::quotes(&pool, &registry);

    assert_eq!(repo.save(&quote, Some(ALICE)).await.unwrap(), SaveOutcome::Unchanged);

    // Clearing the verified flag is not an edit.
    let unverified = Quote {
        verified: false,
        ..quote.clone()
    };
    assert_eq!(repo.save(&unverified, Some(ALICE)).await.unwrap(), SaveOutcome::Unchanged);

    let changes = ChangeRepo::list_for_object(&pool, "quotes.quote", quote.id.unwrap())
        .await
        .unwrap();
    assert_eq!(changes.len(), 1, "only the creating change exists");
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_repeating_pending_proposal_is_unchanged(pool: PgPool) {
    common::setup(&pool).await;
    let registry = common::registry();
    let quote = common::published_quote(&pool, &registry, "Steady").await;
    let repo = common::quotes(&pool, &registry);
    let edit = Quote {
        title: "Retitled".to_string(),
        ..quote.clone()
    };

    assert_matches!(
        repo.save(&edit, Some(ALICE)).await.unwrap(),
        SaveOutcome::Proposed { new_change: true, .. }
    );
    assert_eq!(repo.save(&edit, Some(BOB)).await.unwrap(), SaveOutcome::Unchanged);
}

// ---------------------------------------------------------------------------
// Test: policy variations
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_keep_history_creates_a_change_per_edit(pool: PgPool) {
    common::setup(&pool).await;
    let registry = common::registry();
    let source = published_source(&pool, &registry, "Hansard").await;
    let repo = common::sources(&pool, &registry);

    let mut ids = Vec::new();
    for title in ["Hansard, 1940", "Hansard, vol. 361"] {
        let outcome = repo
            .save(
                &Source {
                    title: title.to_string(),
                    ..source.clone()
                },
                Some(ALICE),
            )
            .await
            .unwrap();
        let SaveOutcome::Proposed {
            change_id,
            new_change: true,
        } = outcome
        else {
            panic!("expected a new proposal, got {outcome:?}");
        };
        ids.push(change_id);
    }
    assert_ne!(ids[0], ids[1]);

    let first = ChangeRepo::find_by_id(&pool, ids[0]).await.unwrap().unwrap();
    assert_eq!(first.n_remaining_approvals_required, 1, "policy quorum applies");
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_visible_until_rejected(pool: PgPool) {
    common::setup(&pool).await;
    let registry = common::registry();
    let repo = common::sources(&pool, &registry);
    let outcome = repo
        .save(&common::new_source("The Times"), Some(ALICE))
        .await
        .unwrap();
    let SaveOutcome::Created {
        object_id,
        change_id,
    } = outcome
    else {
        panic!("expected creation, got {outcome:?}");
    };

    let visible = repo.find_visible(object_id).await.unwrap().unwrap();
    assert!(!visible.verified);

    ChangeRepo::submit(&pool, change_id).await.unwrap();
    ChangeRepo::reject(&pool, &registry, change_id, &Moderator::user(BOB), "no")
        .await
        .unwrap();
    assert!(repo.find_visible(object_id).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_approved_entity_is_updated_directly(pool: PgPool) {
    common::setup(&pool).await;
    let registry = common::registry();
    let (outlet, creating) = approved_outlet(&pool, &registry, "Daily Mail").await;
    let object_id = outlet.id.unwrap();
    let repo = common::outlets(&pool, &registry);

    let outcome = repo
        .save(
            &Outlet {
                name: "Daily Mail archive".to_string(),
                ..outlet.clone()
            },
            Some(CAROL),
        )
        .await
        .unwrap();
    assert_eq!(outcome, SaveOutcome::Bypassed { change_id: creating });

    let live = repo.find_unmoderated(object_id).await.unwrap().unwrap();
    assert_eq!(live.name, "Daily Mail archive");
    let change = ChangeRepo::find_by_id(&pool, creating).await.unwrap().unwrap();
    assert_eq!(change.status().unwrap(), ModerationStatus::Approved);
    assert_eq!(
        change.snapshot().unwrap().field("name"),
        Some(&json!("Daily Mail archive"))
    );
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_merged_entity_is_updated_directly(pool: PgPool) {
    common::setup(&pool).await;
    let registry = common::registry();
    let (outlet, creating) = approved_outlet(&pool, &registry, "The Economist").await;
    assert!(ChangeRepo::apply(&pool, &registry, creating).await.unwrap());
    let object_id = outlet.id.unwrap();
    let repo = common::outlets(&pool, &registry);
    let outlet = repo.find_unmoderated(object_id).await.unwrap().unwrap();

    for name in ["The Economist (UK)", "The Economist Group"] {
        let outcome = repo
            .save(
                &Outlet {
                    name: name.to_string(),
                    ..outlet.clone()
                },
                Some(CAROL),
            )
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Bypassed { change_id: creating });
    }

    let live = repo.find_unmoderated(object_id).await.unwrap().unwrap();
    assert_eq!(live.name, "The Economist Group");
    assert!(live.verified);
    let changes = ChangeRepo::list_for_object(&pool, "outlets.outlet", object_id)
        .await
        .unwrap();
    assert_eq!(changes.len(), 1, "no change is staged");
    assert_eq!(changes[0].status().unwrap(), ModerationStatus::Merged);
    assert_eq!(
        changes[0].snapshot().unwrap().field("name"),
        Some(&json!("The Economist Group"))
    );
    let contributions = ContributionRepo::list_for_change(&pool, creating).await.unwrap();
    assert_eq!(contributions.len(), 3);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_rejected_entity_is_not_trusted(pool: PgPool) {
    common::setup(&pool).await;
    let registry = common::registry();
    let repo = common::outlets(&pool, &registry);
    let SaveOutcome::Created {
        object_id,
        change_id,
    } = repo
        .save(&common::new_outlet("Pravda"), Some(ALICE))
        .await
        .unwrap()
    else {
        panic!("expected creation");
    };
    ChangeRepo::submit(&pool, change_id).await.unwrap();
    ChangeRepo::reject(&pool, &registry, change_id, &Moderator::user(BOB), "no")
        .await
        .unwrap();
    let outlet = repo.find_unmoderated(object_id).await.unwrap().unwrap();

    let outcome = repo
        .save(
            &Outlet {
                name: "Pravda online".to_string(),
                ..outlet
            },
            Some(ALICE),
        )
        .await
        .unwrap();
    assert_matches!(outcome, SaveOutcome::Proposed { new_change: true, .. });
}

// ---------------------------------------------------------------------------
// Test: auto hooks
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_auto_reject_hook(pool: PgPool) {
    common::setup(&pool).await;
    let registry = common::registry();
    let source = published_source(&pool, &registry, "Gazette").await;

    let outcome = common::sources(&pool, &registry)
        .save(
            &Source {
                title: "Gazette spam".to_string(),
                ..source.clone()
            },
            Some(ALICE),
        )
        .await
        .unwrap();
    let SaveOutcome::Proposed { change_id, .. } = outcome else {
        panic!("expected a proposal, got {outcome:?}");
    };

    let change = ChangeRepo::find_by_id(&pool, change_id).await.unwrap().unwrap();
    assert_eq!(change.status().unwrap(), ModerationStatus::Rejected);
    let verdicts = ModerationRepo::list_for_change(&pool, change_id).await.unwrap();
    assert_eq!(verdicts.len(), 1);
    assert_eq!(verdicts[0].verdict().unwrap(), Verdict::Rejected);
    assert_eq!(verdicts[0].moderator_id, None, "system verdict");
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_auto_approve_hook(pool: PgPool) {
    common::setup(&pool).await;
    let registry = common::registry();
    let source = published_source(&pool, &registry, "Gazette").await;

    let outcome = common::sources(&pool, &registry)
        .save(
            &Source {
                title: "[trusted] Gazette".to_string(),
                ..source.clone()
            },
            Some(ALICE),
        )
        .await
        .unwrap();
    let SaveOutcome::Proposed { change_id, .. } = outcome else {
        panic!("expected a proposal, got {outcome:?}");
    };

    let change = ChangeRepo::find_by_id(&pool, change_id).await.unwrap().unwrap();
    assert_eq!(change.status().unwrap(), ModerationStatus::Approved);
    let kinds: Vec<_> = TaskRepo::list_for_change(&pool, change_id)
        .await
        .unwrap()
        .iter()
        .map(|t| t.kind().unwrap())
        .collect();
    assert_eq!(kinds, vec![TaskKind::PostApproval]);
}
