//! Status helper enums mapping to SMALLINT columns.
//!
//! Each enum variant's discriminant is the value stored in the database.
//! Unknown ids and labels are rejected with [`CoreError::Validation`], which
//! is how an out-of-range verdict or status surfaces as a policy violation.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:expr => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Every variant, in discriminant order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Map a database status ID back to the enum.
            pub fn from_id(id: StatusId) -> Result<Self, CoreError> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.id() == id)
                    .ok_or_else(|| {
                        CoreError::Validation(format!(
                            "Unknown {} id: {id}",
                            stringify!($name)
                        ))
                    })
            }

            /// String representation for display, logging, and APIs.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $label ),+
                }
            }

            /// Parse a label produced by [`as_str`](Self::as_str).
            pub fn parse(label: &str) -> Result<Self, CoreError> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == label)
                    .ok_or_else(|| {
                        CoreError::Validation(format!(
                            "Invalid {} '{label}'. Must be one of: {}",
                            stringify!($name),
                            Self::ALL
                                .iter()
                                .map(|v| v.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        ))
                    })
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_status_enum! {
    /// Moderation lifecycle of a `Change` or `ChangeSet`.
    ModerationStatus {
        Rejected = 0 => "rejected",
        Pending = 1 => "pending",
        Approved = 2 => "approved",
        /// Set once the change has been written to the live record.
        Merged = 3 => "merged",
    }
}

define_status_enum! {
    /// A single moderator's verdict.
    Verdict {
        Rejected = 0 => "rejected",
        Pending = 1 => "pending",
        Approved = 2 => "approved",
    }
}

define_status_enum! {
    /// Whether a change is still being composed.
    DraftState {
        Draft = 0 => "draft",
        Ready = 1 => "ready",
    }
}

define_status_enum! {
    /// Lifecycle of a queued background task.
    TaskStatus {
        Pending = 1 => "pending",
        Running = 2 => "running",
        Completed = 3 => "completed",
        Failed = 4 => "failed",
    }
}

impl ModerationStatus {
    /// Statuses of a change that has neither been merged nor rejected.
    pub const IN_PROGRESS: [ModerationStatus; 2] =
        [ModerationStatus::Pending, ModerationStatus::Approved];

    /// Returns `true` once no further moderation can change the outcome.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn ids_match_storage_values() {
        assert_eq!(ModerationStatus::Rejected.id(), 0);
        assert_eq!(ModerationStatus::Pending.id(), 1);
        assert_eq!(ModerationStatus::Approved.id(), 2);
        assert_eq!(ModerationStatus::Merged.id(), 3);
        assert_eq!(DraftState::Draft.id(), 0);
        assert_eq!(DraftState::Ready.id(), 1);
    }

    #[test]
    fn from_id_round_trips_every_variant() {
        for status in ModerationStatus::ALL {
            assert_eq!(ModerationStatus::from_id(status.id()).unwrap(), *status);
        }
        for verdict in Verdict::ALL {
            assert_eq!(Verdict::from_id(verdict.id()).unwrap(), *verdict);
        }
    }

    #[test]
    fn unknown_id_is_a_validation_error() {
        assert_matches!(Verdict::from_id(3), Err(CoreError::Validation(_)));
        assert_matches!(TaskStatus::from_id(0), Err(CoreError::Validation(_)));
    }

    #[test]
    fn parse_rejects_unrecognized_verdict() {
        assert_eq!(Verdict::parse("approved").unwrap(), Verdict::Approved);
        let err = Verdict::parse("merged").unwrap_err();
        assert!(err.to_string().contains("Must be one of: rejected, pending, approved"));
    }

    #[test]
    fn display_matches_as_str() {
        assert_eq!(format!("{}", ModerationStatus::Merged), "merged");
        assert_eq!(format!("{}", DraftState::Ready), "ready");
    }

    #[test]
    fn terminal_statuses() {
        assert!(ModerationStatus::Merged.is_terminal());
        assert!(ModerationStatus::Rejected.is_terminal());
        assert!(!ModerationStatus::Pending.is_terminal());
        assert!(!ModerationStatus::Approved.is_terminal());
    }
}
