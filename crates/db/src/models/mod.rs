//! Row structs and DTOs for the moderation tables.
//!
//! Each submodule contains:
//! - A `FromRow` + `Serialize` struct matching the database row
//! - A `Deserialize` create DTO for inserts where one is needed

pub mod change;
pub mod change_set;
pub mod contribution;
pub mod moderation;
pub mod task;
