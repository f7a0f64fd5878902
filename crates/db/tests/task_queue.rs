//! Integration tests for the moderation task queue.

use std::time::Duration;

use assert_matches::assert_matches;
use modhist_core::status::TaskStatus;
use modhist_db::models::task::TaskKind;
use modhist_db::repositories::TaskRepo;
use sqlx::PgPool;

const LEASE: Duration = Duration::from_secs(300);

/// Pretend the task was claimed `age` ago.
async fn backdate_claim(pool: &PgPool, task_id: i64, age: Duration) {
    sqlx::query(
        "UPDATE moderation_tasks \
         SET claimed_at = NOW() - make_interval(secs => $2) \
         WHERE id = $1",
    )
    .bind(task_id)
    .bind(age.as_secs_f64())
    .execute(pool)
    .await
    .unwrap();
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_claim_takes_oldest_pending(pool: PgPool) {
    let first = TaskRepo::enqueue(&pool, TaskKind::NotifyModerators, None, None)
        .await
        .unwrap();
    let second = TaskRepo::enqueue(&pool, TaskKind::PostApproval, None, None)
        .await
        .unwrap();

    let claimed = TaskRepo::claim_next(&pool, LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.status().unwrap(), TaskStatus::Running);
    assert_eq!(claimed.attempts, 1);
    assert!(claimed.claimed_at.is_some());

    let next = TaskRepo::claim_next(&pool, LEASE).await.unwrap().unwrap();
    assert_eq!(next.id, second.id);
    assert_eq!(next.kind().unwrap(), TaskKind::PostApproval);

    assert!(TaskRepo::claim_next(&pool, LEASE).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_complete_marks_done(pool: PgPool) {
    let task = TaskRepo::enqueue(&pool, TaskKind::NotifyVerdict, None, None)
        .await
        .unwrap();
    TaskRepo::claim_next(&pool, LEASE).await.unwrap().unwrap();
    TaskRepo::complete(&pool, task.id).await.unwrap();

    let done = TaskRepo::find_by_id(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(done.status().unwrap(), TaskStatus::Completed);
    assert!(done.completed_at.is_some());
    assert!(TaskRepo::claim_next(&pool, LEASE).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_failed_task_retries_until_max_attempts(pool: PgPool) {
    let task = TaskRepo::enqueue(&pool, TaskKind::PostApproval, None, None)
        .await
        .unwrap();

    TaskRepo::claim_next(&pool, LEASE).await.unwrap().unwrap();
    let status = TaskRepo::fail(&pool, task.id, "connection reset", 2).await.unwrap();
    assert_eq!(status, TaskStatus::Pending);

    let retried = TaskRepo::claim_next(&pool, LEASE).await.unwrap().unwrap();
    assert_eq!(retried.id, task.id);
    assert_eq!(retried.attempts, 2);
    assert_eq!(retried.last_error.as_deref(), Some("connection reset"));

    let status = TaskRepo::fail(&pool, task.id, "connection reset again", 2)
        .await
        .unwrap();
    assert_matches!(status, TaskStatus::Failed);
    assert!(TaskRepo::claim_next(&pool, LEASE).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_expired_claim_is_reclaimed(pool: PgPool) {
    let task = TaskRepo::enqueue(&pool, TaskKind::NotifyModerators, None, None)
        .await
        .unwrap();
    TaskRepo::claim_next(&pool, LEASE).await.unwrap().unwrap();

    // The claiming worker died without completing or failing the task.
    assert!(TaskRepo::claim_next(&pool, LEASE).await.unwrap().is_none());

    backdate_claim(&pool, task.id, LEASE * 2).await;
    let reclaimed = TaskRepo::claim_next(&pool, LEASE).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, task.id);
    assert_eq!(reclaimed.status().unwrap(), TaskStatus::Running);
    assert_eq!(reclaimed.attempts, 2);

    TaskRepo::complete(&pool, task.id).await.unwrap();
    assert!(TaskRepo::claim_next(&pool, LEASE).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_abandoned_task_fails_after_last_attempt(pool: PgPool) {
    let task = TaskRepo::enqueue(&pool, TaskKind::PostApproval, None, None)
        .await
        .unwrap();
    TaskRepo::claim_next(&pool, LEASE).await.unwrap().unwrap();

    // Within the lease nothing is touched.
    assert_eq!(TaskRepo::fail_abandoned(&pool, LEASE, 1).await.unwrap(), 0);

    backdate_claim(&pool, task.id, LEASE * 2).await;
    let spared = TaskRepo::fail_abandoned(&pool, LEASE, 2).await.unwrap();
    assert_eq!(spared, 0, "one attempt left");
    assert_eq!(TaskRepo::fail_abandoned(&pool, LEASE, 1).await.unwrap(), 1);

    let failed = TaskRepo::find_by_id(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(failed.status().unwrap(), TaskStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("worker lease expired"));
    assert!(TaskRepo::claim_next(&pool, LEASE).await.unwrap().is_none());
}
