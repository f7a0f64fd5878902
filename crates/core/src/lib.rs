//! Pure domain logic for the moderation and versioning engine.
//!
//! Nothing in this crate touches the database. The `db` crate persists
//! what is modelled here, and the `worker` crate drives the asynchronous
//! post-approval step.
//!
//! - [`entity`]    -- the `ModeratedEntity` contract and per-type policy.
//! - [`snapshot`]  -- serialized object snapshots and rebasing.
//! - [`diff`]      -- the field-by-field diff engine.
//! - [`quorum`]    -- approval tallying and state-machine guards.

pub mod change_set;
pub mod config;
pub mod diff;
pub mod entity;
pub mod error;
pub mod hashing;
pub mod quorum;
pub mod sequence_matcher;
pub mod snapshot;
pub mod status;
pub mod types;
