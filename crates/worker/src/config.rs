use std::time::Duration;

use crate::error::WorkerError;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_ATTEMPTS: i32 = 5;
const DEFAULT_TASK_LEASE_SECS: u64 = 300;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    /// How long the loop sleeps once the queue is drained.
    pub poll_interval: Duration,
    /// Attempts before a failing task is left as failed.
    pub max_attempts: i32,
    /// How long a claimed task may run before another worker reclaims it.
    /// Must exceed the slowest handler.
    pub task_lease: Duration,
    /// Addresses told about changes awaiting review.
    pub moderator_emails: Vec<String>,
}

impl WorkerConfig {
    /// Load configuration, reading `.env` first if present.
    ///
    /// | Env Var                   | Default |
    /// |---------------------------|---------|
    /// | `DATABASE_URL`            | required |
    /// | `WORKER_POLL_INTERVAL_MS` | `1000`  |
    /// | `WORKER_MAX_ATTEMPTS`     | `5`     |
    /// | `WORKER_TASK_LEASE_SECS`  | `300`   |
    /// | `MODERATOR_EMAILS`        | empty (comma-separated list) |
    pub fn from_env() -> Result<Self, WorkerError> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| WorkerError::Config("DATABASE_URL must be set".to_string()))?;
        let poll_ms = parse_var("WORKER_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        let max_attempts = parse_var("WORKER_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if max_attempts < 1 {
            return Err(WorkerError::Config(
                "WORKER_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let lease_secs = parse_var("WORKER_TASK_LEASE_SECS", DEFAULT_TASK_LEASE_SECS)?;
        if lease_secs == 0 {
            return Err(WorkerError::Config(
                "WORKER_TASK_LEASE_SECS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            database_url,
            poll_interval: Duration::from_millis(poll_ms),
            max_attempts,
            task_lease: Duration::from_secs(lease_secs),
            moderator_emails: parse_emails(
                &std::env::var("MODERATOR_EMAILS").unwrap_or_default(),
            ),
        })
    }

    /// Defaults for everything but the database.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            task_lease: Duration::from_secs(DEFAULT_TASK_LEASE_SECS),
            moderator_emails: Vec::new(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, WorkerError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| WorkerError::Config(format!("{name} is not valid: '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn parse_emails(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
