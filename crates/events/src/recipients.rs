//! Resolving people to email addresses.

use std::collections::HashMap;

use async_trait::async_trait;
use modhist_core::types::DbId;

/// Looks up where notifications for moderators and contributors go.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// Addresses of everyone who reviews changes.
    async fn moderators(&self) -> Vec<String>;

    /// Addresses for the given users. Unknown users are skipped.
    async fn users(&self, user_ids: &[DbId]) -> Vec<String>;
}

/// A fixed directory, typically built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    moderators: Vec<String>,
    users: HashMap<DbId, String>,
}

impl StaticDirectory {
    pub fn new(moderators: Vec<String>) -> Self {
        Self {
            moderators,
            users: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: DbId, address: impl Into<String>) -> Self {
        self.users.insert(user_id, address.into());
        self
    }
}

#[async_trait]
impl RecipientDirectory for StaticDirectory {
    async fn moderators(&self) -> Vec<String> {
        self.moderators.clone()
    }

    async fn users(&self, user_ids: &[DbId]) -> Vec<String> {
        user_ids
            .iter()
            .filter_map(|id| self.users.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_users_are_skipped() {
        let directory = StaticDirectory::new(vec!["mods@example.org".to_string()])
            .with_user(1, "ada@example.org")
            .with_user(2, "alan@example.org");

        assert_eq!(directory.moderators().await, vec!["mods@example.org"]);
        assert_eq!(
            directory.users(&[2, 3, 1]).await,
            vec!["alan@example.org", "ada@example.org"]
        );
    }
}
