//! Field-by-field differences between two snapshots of the same entity type.
//!
//! [`diff_fields`] produces one [`FieldChange`] per selected field:
//!
//! - `Text`     -- scalar fields, with a word-level diff when the values differ.
//! - `Image`    -- before/after image references, rendered side by side.
//! - `Relation` -- foreign-key, one-to-one and many-to-many fields. Many-valued
//!   relations also carry a line-level diff over their labels.
//!
//! Unchanged fields are still reported (with an empty diff) so callers can
//! render every section consistently.

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{FieldKind, FieldSpec, RelationTarget};
use crate::sequence_matcher::{opcodes, OpTag};
use crate::snapshot::Snapshot;
use crate::types::DbId;

// ---------------------------------------------------------------------------
// DiffStatus
// ---------------------------------------------------------------------------

/// The status of an item in a diff comparison.
///
/// - `Added`     -- present only in the incoming/new side.
/// - `Removed`   -- present only in the current/old side.
/// - `Changed`   -- present in both sides but with different values.
/// - `Unchanged` -- present in both sides with identical values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    Added,
    Removed,
    Changed,
    Unchanged,
}

impl DiffStatus {
    /// String representation for display and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Changed => "changed",
            Self::Unchanged => "unchanged",
        }
    }

    fn between(before_empty: bool, after_empty: bool, equal: bool) -> Self {
        match (equal, before_empty, after_empty) {
            (true, _, _) => Self::Unchanged,
            (false, true, false) => Self::Added,
            (false, false, true) => Self::Removed,
            _ => Self::Changed,
        }
    }
}

impl std::fmt::Display for DiffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Change descriptors
// ---------------------------------------------------------------------------

/// One hunk of a word- or line-level diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffOp {
    pub operation: OpTag,
    pub deleted: String,
    pub inserted: String,
}

/// A scalar field rendered as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChange {
    pub label: String,
    pub before: String,
    pub after: String,
}

impl TextChange {
    pub fn has_changed(&self) -> bool {
        self.before != self.after
    }

    /// The shared value, when nothing changed.
    pub fn unchanged_value(&self) -> Option<&str> {
        (!self.has_changed()).then_some(self.after.as_str())
    }

    /// Word-level diff; empty when the values are equal.
    pub fn diff(&self) -> Vec<DiffOp> {
        if !self.has_changed() {
            return Vec::new();
        }
        let a = tokenize(&self.before);
        let b = tokenize(&self.after);
        opcodes(&a, &b)
            .into_iter()
            .map(|op| DiffOp {
                operation: op.tag,
                deleted: a[op.a_range].concat(),
                inserted: b[op.b_range].concat(),
            })
            .collect()
    }
}

/// Before/after image references. No diffing is performed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageChange {
    pub label: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// A relation field: related object labels (or raw ids) on each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationChange {
    pub label: String,
    pub many: bool,
    pub before: Vec<String>,
    pub after: Vec<String>,
}

impl RelationChange {
    pub fn has_changed(&self) -> bool {
        self.before != self.after
    }

    /// Line-level diff over the related labels; only computed for
    /// many-valued relations that changed.
    pub fn line_diff(&self) -> Vec<DiffOp> {
        if !self.many || !self.has_changed() {
            return Vec::new();
        }
        opcodes(&self.before, &self.after)
            .into_iter()
            .map(|op| DiffOp {
                operation: op.tag,
                deleted: self.before[op.a_range].join("\n"),
                inserted: self.after[op.b_range].join("\n"),
            })
            .collect()
    }
}

/// Typed change descriptor for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldChange {
    Text(TextChange),
    Image(ImageChange),
    Relation(RelationChange),
}

impl FieldChange {
    pub fn label(&self) -> &str {
        match self {
            Self::Text(c) => &c.label,
            Self::Image(c) => &c.label,
            Self::Relation(c) => &c.label,
        }
    }

    pub fn status(&self) -> DiffStatus {
        match self {
            Self::Text(c) => {
                DiffStatus::between(c.before.is_empty(), c.after.is_empty(), !c.has_changed())
            }
            Self::Image(c) => {
                DiffStatus::between(c.before.is_none(), c.after.is_none(), c.before == c.after)
            }
            Self::Relation(c) => {
                DiffStatus::between(c.before.is_empty(), c.after.is_empty(), !c.has_changed())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Resolves related ids to human-readable labels.
pub trait RelationLabeler {
    fn label(&self, target: &RelationTarget, id: DbId) -> Option<String>;
}

impl RelationLabeler for std::collections::HashMap<(String, DbId), String> {
    fn label(&self, target: &RelationTarget, id: DbId) -> Option<String> {
        self.get(&(target.model.to_string(), id)).cloned()
    }
}

/// Field selection and rendering options for [`diff_fields`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions<'a> {
    pub excluded_fields: &'a [&'a str],
    /// When set, only these fields are compared.
    pub included_fields: Option<&'a [&'a str]>,
    /// Render related objects by label instead of raw id.
    pub resolve_foreign_keys: bool,
}

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\W+").expect("static regex is valid"));

/// Split text into alternating word and non-word-run tokens.
///
/// Concatenating the tokens reproduces the input exactly.
pub fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut last = 0;
    for m in NON_WORD.find_iter(text) {
        if m.start() > last {
            tokens.push(&text[last..m.start()]);
        }
        tokens.push(m.as_str());
        last = m.end();
    }
    if last < text.len() {
        tokens.push(&text[last..]);
    }
    tokens
}

fn scalar_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn is_selected(spec: &FieldSpec, options: &DiffOptions<'_>) -> bool {
    if spec.kind == FieldKind::AutoId || spec.label.is_none() || !spec.serializable {
        return false;
    }
    match options.included_fields {
        Some(included) => included.contains(&spec.name),
        None => !options.excluded_fields.contains(&spec.name),
    }
}

/// Render one side of a relation. Any unreadable value or unresolvable id
/// turns the whole side into an empty list.
fn relation_side(
    target: &RelationTarget,
    value: Option<&Value>,
    options: &DiffOptions<'_>,
    labeler: &dyn RelationLabeler,
) -> Vec<String> {
    let ids: Option<Vec<DbId>> = match value {
        None | Some(Value::Null) => Some(Vec::new()),
        Some(Value::Number(n)) => n.as_i64().map(|id| vec![id]),
        Some(Value::Array(items)) => items.iter().map(Value::as_i64).collect(),
        Some(_) => None,
    };
    let Some(ids) = ids else {
        return Vec::new();
    };
    if !options.resolve_foreign_keys {
        return ids.iter().map(|id| id.to_string()).collect();
    }
    ids.iter()
        .map(|id| labeler.label(target, *id))
        .collect::<Option<Vec<_>>>()
        .unwrap_or_default()
}

/// Compare two snapshots field by field.
///
/// A missing side (for example, an entity with no prior state) is treated
/// as empty on every field.
pub fn diff_fields(
    fields: &[FieldSpec],
    before: Option<&Snapshot>,
    after: Option<&Snapshot>,
    options: &DiffOptions<'_>,
    labeler: &dyn RelationLabeler,
) -> IndexMap<String, FieldChange> {
    let mut changes = IndexMap::new();

    for spec in fields.iter().filter(|s| is_selected(s, options)) {
        let label = spec.label.unwrap_or(spec.name).to_string();
        let before_value = before.and_then(|s| s.field(spec.name));
        let after_value = after.and_then(|s| s.field(spec.name));

        let change = match &spec.kind {
            FieldKind::Image => {
                let side = |v: Option<&Value>| Some(scalar_text(v)).filter(|s| !s.is_empty());
                FieldChange::Image(ImageChange {
                    label,
                    before: side(before_value),
                    after: side(after_value),
                })
            }
            FieldKind::ForeignKey(target)
            | FieldKind::OneToOne(target)
            | FieldKind::ManyToMany(target) => FieldChange::Relation(RelationChange {
                label,
                many: spec.kind.is_many(),
                before: relation_side(target, before_value, options, labeler),
                after: relation_side(target, after_value, options, labeler),
            }),
            _ => FieldChange::Text(TextChange {
                label,
                before: scalar_text(before_value),
                after: scalar_text(after_value),
            }),
        };
        changes.insert(spec.name.to_string(), change);
    }
    changes
}
