//! Repository layer.
//!
//! Each repository is a zero-sized struct. Single-statement methods accept
//! any Postgres executor (a pool or an open transaction); multi-step
//! operations take `&PgPool` and manage their own transaction, with an
//! `_in` variant that joins a caller's transaction.

pub mod change_repo;
pub mod change_set_repo;
pub mod contribution_repo;
pub mod moderation_repo;
pub mod task_repo;

pub use change_repo::ChangeRepo;
pub use change_set_repo::ChangeSetRepo;
pub use contribution_repo::ContributionRepo;
pub use moderation_repo::ModerationRepo;
pub use task_repo::TaskRepo;
