//! Task queue poll loop.
//!
//! Claims tasks with `SELECT FOR UPDATE SKIP LOCKED` (see
//! [`TaskRepo::claim_next`]), so any number of workers can share a queue.
//! A task whose worker died is reclaimed once its lease expires.
//! Each drained cycle is followed by a sleep of `poll_interval`.

use modhist_core::status::TaskStatus;
use modhist_db::models::task::ModerationTask;
use modhist_db::repositories::TaskRepo;
use tokio_util::sync::CancellationToken;

use crate::context::WorkerContext;
use crate::error::WorkerError;
use crate::handlers::{self, TaskOutcome};

/// Processes queued moderation tasks.
pub struct Worker {
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Run until the cancellation token is triggered. A task already being
    /// handled finishes first.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval);
        tracing::info!(
            poll_interval_ms = self.ctx.config.poll_interval.as_millis() as u64,
            max_attempts = self.ctx.config.max_attempts,
            task_lease_secs = self.ctx.config.task_lease.as_secs(),
            "Moderation worker started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Moderation worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.drain(&cancel).await {
                        tracing::error!(error = %e, "Task cycle failed");
                    }
                }
            }
        }
    }

    /// Handle tasks until the queue is empty or shutdown is requested.
    async fn drain(&self, cancel: &CancellationToken) -> Result<(), sqlx::Error> {
        let abandoned = TaskRepo::fail_abandoned(
            &self.ctx.pool,
            self.ctx.config.task_lease,
            self.ctx.config.max_attempts,
        )
        .await?;
        if abandoned > 0 {
            tracing::error!(abandoned, "Tasks failed after their last lease expired");
        }

        while !cancel.is_cancelled() {
            if self.run_once().await?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Claim and handle one task. Returns `None` when the queue is empty.
    ///
    /// Handler errors are recorded on the task, not returned; only a
    /// failure to talk to the queue itself is an error.
    pub async fn run_once(&self) -> Result<Option<(ModerationTask, TaskStatus)>, sqlx::Error> {
        let Some(task) = TaskRepo::claim_next(&self.ctx.pool, self.ctx.config.task_lease).await?
        else {
            return Ok(None);
        };
        tracing::debug!(
            task_id = task.id,
            kind = %task.kind,
            attempt = task.attempts,
            "Task claimed"
        );

        let status = match handlers::dispatch(&self.ctx, &task).await {
            Ok(outcome) => {
                TaskRepo::complete(&self.ctx.pool, task.id).await?;
                log_outcome(&task, &outcome);
                TaskStatus::Completed
            }
            Err(e) => self.record_failure(&task, &e).await?,
        };
        Ok(Some((task, status)))
    }

    async fn record_failure(
        &self,
        task: &ModerationTask,
        error: &WorkerError,
    ) -> Result<TaskStatus, sqlx::Error> {
        let status = match TaskRepo::fail(
            &self.ctx.pool,
            task.id,
            &error.to_string(),
            self.ctx.config.max_attempts,
        )
        .await
        {
            Ok(status) => status,
            Err(modhist_db::ModerationError::Database(e)) => return Err(e),
            Err(e) => {
                tracing::error!(task_id = task.id, error = %e, "Failed to record task failure");
                TaskStatus::Failed
            }
        };

        if status == TaskStatus::Failed {
            tracing::error!(
                task_id = task.id,
                kind = %task.kind,
                attempts = task.attempts,
                error = %error,
                "Task failed permanently"
            );
        } else {
            tracing::warn!(
                task_id = task.id,
                kind = %task.kind,
                attempts = task.attempts,
                error = %error,
                "Task failed; will retry"
            );
        }
        Ok(status)
    }
}

fn log_outcome(task: &ModerationTask, outcome: &TaskOutcome) {
    tracing::info!(task_id = task.id, kind = %task.kind, outcome = ?outcome, "Task completed");
}
