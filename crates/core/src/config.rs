//! Moderation engine configuration.

use crate::error::CoreError;

/// Default number of approvals a change needs before it is approved.
pub const DEFAULT_REQUIRED_APPROVALS: i32 = 2;

/// Upper bound on the configurable quorum.
pub const MAX_REQUIRED_APPROVALS: i32 = 25;

/// Global moderation settings shared by every moderated entity type.
///
/// Individual entity types may override the quorum through
/// [`ModerationPolicy::required_approvals`](crate::entity::ModerationPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModerationConfig {
    /// Number of contiguous, non-stale approvals required (the quorum).
    pub required_approvals: i32,
}

impl ModerationConfig {
    /// Build a config with an explicit quorum, validating its range.
    pub fn new(required_approvals: i32) -> Result<Self, CoreError> {
        validate_required_approvals(required_approvals)?;
        Ok(Self { required_approvals })
    }

    /// Load configuration from environment variables.
    ///
    /// | Env Var                          | Default |
    /// |----------------------------------|---------|
    /// | `MODERATION_REQUIRED_APPROVALS`  | `2`     |
    pub fn from_env() -> Result<Self, CoreError> {
        let required_approvals = match std::env::var("MODERATION_REQUIRED_APPROVALS") {
            Ok(raw) => raw.trim().parse::<i32>().map_err(|_| {
                CoreError::Validation(format!(
                    "MODERATION_REQUIRED_APPROVALS must be an integer, got '{raw}'"
                ))
            })?,
            Err(_) => DEFAULT_REQUIRED_APPROVALS,
        };
        Self::new(required_approvals)
    }

    /// Resolve the quorum for an entity type, honouring its policy override.
    pub fn quorum_for(&self, override_approvals: Option<i32>) -> i32 {
        override_approvals.unwrap_or(self.required_approvals)
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            required_approvals: DEFAULT_REQUIRED_APPROVALS,
        }
    }
}

/// Validate that a quorum lies in `1..=MAX_REQUIRED_APPROVALS`.
pub fn validate_required_approvals(n: i32) -> Result<(), CoreError> {
    if (1..=MAX_REQUIRED_APPROVALS).contains(&n) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "Required approvals must be between 1 and {MAX_REQUIRED_APPROVALS}, got {n}"
        )))
    }
}
