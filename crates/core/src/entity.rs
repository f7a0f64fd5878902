//! The capability contract a domain entity implements to be moderated.
//!
//! A moderated entity declares its fields (with enough metadata for
//! snapshotting and diffing), the inheritance-parent models its rows span,
//! a visibility flag, and a [`ModerationPolicy`]. Nothing here touches the
//! database; the `db` crate adapts these declarations to tables.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::snapshot::Snapshot;
use crate::status::ModerationStatus;
use crate::types::DbId;

// ---------------------------------------------------------------------------
// Field declarations
// ---------------------------------------------------------------------------

/// Where a relation field points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelationTarget {
    /// Type tag of the related model, e.g. `"entities.entity"`.
    pub model: &'static str,
    /// Table holding the related rows.
    pub table: &'static str,
    /// Column rendered as the human-readable label of a related row.
    pub label_column: &'static str,
}

impl RelationTarget {
    pub const fn new(model: &'static str, table: &'static str, label_column: &'static str) -> Self {
        Self {
            model,
            table,
            label_column,
        }
    }
}

/// Storage kind of a declared field. Drives diff dispatch and reference checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Auto-generated primary key. Stored as the snapshot record's `pk`.
    AutoId,
    Text,
    Number,
    Boolean,
    Date,
    /// Reference to a stored image (path or URL).
    Image,
    ForeignKey(RelationTarget),
    OneToOne(RelationTarget),
    /// Serialized as an array of related ids.
    ManyToMany(RelationTarget),
}

impl FieldKind {
    /// The related model, if this is a relation field.
    pub fn relation(&self) -> Option<&RelationTarget> {
        match self {
            Self::ForeignKey(t) | Self::OneToOne(t) | Self::ManyToMany(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_many(&self) -> bool {
        matches!(self, Self::ManyToMany(_))
    }
}

/// Declaration of one field of a moderated entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Human-readable label. Fields without one are never diffed.
    pub label: Option<&'static str>,
    pub kind: FieldKind,
    pub nullable: bool,
    /// Cached or computed fields are left out of snapshots.
    pub serializable: bool,
    /// Inheritance-parent model whose row stores this field; `None` for the
    /// entity's own row.
    pub owner: Option<&'static str>,
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            label: None,
            kind,
            nullable: false,
            serializable: true,
            owner: None,
        }
    }

    pub const fn label(self, label: &'static str) -> Self {
        Self {
            label: Some(label),
            ..self
        }
    }

    pub const fn nullable(self) -> Self {
        Self {
            nullable: true,
            ..self
        }
    }

    pub const fn not_serialized(self) -> Self {
        Self {
            serializable: false,
            ..self
        }
    }

    pub const fn owned_by(self, model: &'static str) -> Self {
        Self {
            owner: Some(model),
            ..self
        }
    }
}

/// Find a field declaration by name.
pub fn field_spec<'a>(fields: &'a [FieldSpec], name: &str) -> Option<&'a FieldSpec> {
    fields.iter().find(|f| f.name == name)
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Predicate evaluated against a proposed snapshot.
pub type SnapshotPredicate = fn(&Snapshot) -> bool;

fn never(_: &Snapshot) -> bool {
    false
}

/// Per-entity-type moderation behaviour, fixed at registration time.
#[derive(Clone, Copy)]
pub struct ModerationPolicy {
    /// Fields never diffed or shown to moderators.
    pub fields_excluded: &'static [&'static str],
    /// Every distinct edit opens a new `Change` instead of updating the
    /// in-progress one.
    pub keep_history: bool,
    /// Unapproved entities stay visible unless their latest change was rejected.
    pub visible_until_rejected: bool,
    /// Once a change is approved, further edits go straight to the live
    /// record and only refresh the stored snapshot.
    pub bypass_after_approval: bool,
    /// Quorum override for this entity type.
    pub required_approvals: Option<i32>,
    pub is_auto_approve: SnapshotPredicate,
    pub is_auto_reject: SnapshotPredicate,
}

impl ModerationPolicy {
    pub const DEFAULT: ModerationPolicy = ModerationPolicy {
        fields_excluded: &[],
        keep_history: false,
        visible_until_rejected: false,
        bypass_after_approval: false,
        required_approvals: None,
        is_auto_approve: never,
        is_auto_reject: never,
    };
}

impl Debug for ModerationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModerationPolicy")
            .field("fields_excluded", &self.fields_excluded)
            .field("keep_history", &self.keep_history)
            .field("visible_until_rejected", &self.visible_until_rejected)
            .field("bypass_after_approval", &self.bypass_after_approval)
            .field("required_approvals", &self.required_approvals)
            .finish_non_exhaustive()
    }
}

impl Default for ModerationPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Visibility filter applied by the moderated accessor.
///
/// Verified entities are always visible. Unverified ones are visible only
/// when the policy keeps them visible until a rejection lands.
pub fn is_visible(
    policy: &ModerationPolicy,
    verified: bool,
    latest_status: Option<ModerationStatus>,
) -> bool {
    verified
        || (policy.visible_until_rejected && latest_status != Some(ModerationStatus::Rejected))
}

// ---------------------------------------------------------------------------
// Entity contract
// ---------------------------------------------------------------------------

/// A domain entity whose writes are routed through moderation.
///
/// The serde representation must be a JSON object keyed by the declared
/// field names. Fields declared with [`FieldSpec::not_serialized`] need a
/// `#[serde(default)]` so snapshots can be reconstructed without them.
pub trait ModeratedEntity:
    Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static
{
    /// Type tag stored in `changes.content_type`.
    const MODEL: &'static str;

    fn fields() -> &'static [FieldSpec];

    /// Inheritance-parent models, nearest first.
    fn parent_models() -> &'static [&'static str] {
        &[]
    }

    fn policy() -> ModerationPolicy {
        ModerationPolicy::DEFAULT
    }

    fn id(&self) -> Option<DbId>;

    fn set_id(&mut self, id: DbId);

    fn verified(&self) -> bool;

    fn set_verified(&mut self, verified: bool);
}
