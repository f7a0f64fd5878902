//! Serialized object snapshots.
//!
//! A [`Snapshot`] is the stored form of "the object after change": an
//! ordered list of records, the entity's own row first, followed by one
//! record per inheritance-parent (extension) row. The JSON document looks
//! like:
//!
//! ```json
//! [
//!   {"model": "quotes.quote", "pk": 42, "fields": {"text": "..."}},
//!   {"model": "modules.module", "pk": 42, "fields": {"title": "..."}}
//! ]
//! ```
//!
//! Foreign references are checked through a [`ReferenceResolver`] so the
//! codec itself stays storage-agnostic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::{FieldKind, FieldSpec, ModeratedEntity, RelationTarget};
use crate::error::CoreError;
use crate::hashing::sha256_hex;
use crate::types::DbId;

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

/// One row of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub model: String,
    pub pk: Option<DbId>,
    pub fields: Map<String, Value>,
}

impl SnapshotRecord {
    fn empty(model: &str, pk: Option<DbId>) -> Self {
        Self {
            model: model.to_string(),
            pk,
            fields: Map::new(),
        }
    }
}

/// A self-contained snapshot of an entity and its inheritance-parent rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    records: Vec<SnapshotRecord>,
}

impl Snapshot {
    /// Build a snapshot from records, primary row first.
    pub fn from_records(records: Vec<SnapshotRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[SnapshotRecord] {
        &self.records
    }

    pub fn primary(&self) -> Option<&SnapshotRecord> {
        self.records.first()
    }

    /// Type tag of the primary row.
    pub fn model(&self) -> Option<&str> {
        self.primary().map(|r| r.model.as_str())
    }

    pub fn pk(&self) -> Option<DbId> {
        self.primary().and_then(|r| r.pk)
    }

    /// Look a field up on the primary row, then on each parent row in order.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.records.iter().find_map(|r| r.fields.get(name))
    }

    /// All fields merged onto one map; the primary row wins on collisions.
    pub fn flattened(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for record in self.records.iter().rev() {
            for (name, value) in &record.fields {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }

    /// Return a copy with `name` set on whichever record already holds it
    /// (the primary row if none does).
    pub fn with_field(&self, name: &str, value: Value) -> Self {
        let mut next = self.clone();
        let idx = next
            .records
            .iter()
            .position(|r| r.fields.contains_key(name))
            .unwrap_or(0);
        if let Some(record) = next.records.get_mut(idx) {
            record.fields.insert(name.to_string(), value);
        }
        next
    }

    /// Return a copy with the primary key set on every record.
    pub fn with_pk(&self, pk: DbId) -> Self {
        let mut next = self.clone();
        for record in &mut next.records {
            record.pk = Some(pk);
        }
        next
    }

    /// Encode as the stored JSON document.
    pub fn to_document(&self) -> Value {
        Value::Array(
            self.records
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "model": r.model,
                        "pk": r.pk,
                        "fields": Value::Object(r.fields.clone()),
                    })
                })
                .collect(),
        )
    }

    /// Decode a stored JSON document.
    pub fn from_document(document: &Value) -> Result<Self, CoreError> {
        let snapshot: Snapshot = serde_json::from_value(document.clone())?;
        if snapshot.records.is_empty() {
            return Err(CoreError::Serialization(
                "snapshot document contains no records".to_string(),
            ));
        }
        Ok(snapshot)
    }

    /// Stable SHA-256 of the canonical document.
    ///
    /// `serde_json::Map` keeps keys sorted, so equal snapshots always hash
    /// identically.
    pub fn fingerprint(&self) -> String {
        sha256_hex(self.to_document().to_string().as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Reference resolution
// ---------------------------------------------------------------------------

/// Answers whether a related row still exists.
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    async fn exists(&self, target: &RelationTarget, id: DbId) -> Result<bool, CoreError>;
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

/// Reject parent chains that repeat a model; such a chain would make the
/// record list cyclic.
fn check_parent_chain(model: &str, parents: &[&str]) -> Result<(), CoreError> {
    let mut seen = vec![model];
    for parent in parents {
        if seen.contains(parent) {
            return Err(CoreError::Serialization(format!(
                "reference cycle in parent chain of {model}: {parent} appears twice"
            )));
        }
        seen.push(*parent);
    }
    Ok(())
}

fn relation_ids(spec: &FieldSpec, value: &Value) -> Result<Vec<DbId>, CoreError> {
    let bad = || {
        CoreError::Serialization(format!(
            "field '{}' does not hold a related id: {value}",
            spec.name
        ))
    };
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Number(n) => n.as_i64().map(|id| vec![id]).ok_or_else(bad),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_i64().ok_or_else(bad))
            .collect(),
        _ => Err(bad()),
    }
}

/// Serialize an entity and its inheritance-parent rows.
///
/// Fails with [`CoreError::Serialization`] when the parent chain is cyclic,
/// when a field is owned by an undeclared parent model, or when a related
/// id cannot be resolved.
pub async fn serialize<E: ModeratedEntity>(
    entity: &E,
    resolver: &dyn ReferenceResolver,
) -> Result<Snapshot, CoreError> {
    let parents = E::parent_models();
    check_parent_chain(E::MODEL, parents)?;

    let value = serde_json::to_value(entity)?;
    let Value::Object(object) = value else {
        return Err(CoreError::Serialization(format!(
            "{} does not serialize to a JSON object",
            E::MODEL
        )));
    };

    let pk = entity.id();
    let mut records = Vec::with_capacity(parents.len() + 1);
    records.push(SnapshotRecord::empty(E::MODEL, pk));
    records.extend(parents.iter().map(|p| SnapshotRecord::empty(p, pk)));

    for spec in E::fields() {
        if spec.kind == FieldKind::AutoId || !spec.serializable {
            continue;
        }
        let value = object.get(spec.name).cloned().unwrap_or(Value::Null);

        if let Some(target) = spec.kind.relation() {
            for id in relation_ids(spec, &value)? {
                if !resolver.exists(target, id).await? {
                    return Err(CoreError::Serialization(format!(
                        "{}.{} references missing {} {id}",
                        E::MODEL,
                        spec.name,
                        target.model
                    )));
                }
            }
        }

        let idx = match spec.owner {
            None => 0,
            Some(owner) => parents
                .iter()
                .position(|p| *p == owner)
                .map(|i| i + 1)
                .ok_or_else(|| {
                    CoreError::Serialization(format!(
                        "{}.{} is owned by undeclared parent {owner}",
                        E::MODEL,
                        spec.name
                    ))
                })?,
        };
        records[idx].fields.insert(spec.name.to_string(), value);
    }

    Ok(Snapshot { records })
}

/// Reconstruct an entity from a snapshot.
///
/// Parent-row fields are copied onto the primary object. A dangling
/// reference is nulled when the field is nullable (or dropped from a
/// many-to-many list); a dangling required reference makes the snapshot
/// unreconstructable and yields `Ok(None)`.
pub async fn deserialize<E: ModeratedEntity>(
    snapshot: &Snapshot,
    resolver: &dyn ReferenceResolver,
) -> Result<Option<E>, CoreError> {
    let primary = snapshot.primary().ok_or_else(|| {
        CoreError::Serialization("snapshot document contains no records".to_string())
    })?;
    if primary.model != E::MODEL {
        return Err(CoreError::Serialization(format!(
            "snapshot of {} cannot be read as {}",
            primary.model,
            E::MODEL
        )));
    }

    let mut object = primary.fields.clone();
    for parent in &snapshot.records[1..] {
        for (name, value) in &parent.fields {
            object.insert(name.clone(), value.clone());
        }
    }

    for spec in E::fields() {
        if spec.kind == FieldKind::AutoId {
            let pk = primary.pk.map(Value::from).unwrap_or(Value::Null);
            object.insert(spec.name.to_string(), pk);
            continue;
        }
        let Some(target) = spec.kind.relation() else {
            continue;
        };
        let Some(value) = object.get(spec.name).cloned() else {
            continue;
        };
        let ids = match relation_ids(spec, &value) {
            Ok(ids) => ids,
            Err(_) => return Ok(None),
        };

        if spec.kind.is_many() {
            let mut kept = Vec::with_capacity(ids.len());
            for id in ids {
                if resolver.exists(target, id).await? {
                    kept.push(Value::from(id));
                }
            }
            object.insert(spec.name.to_string(), Value::Array(kept));
        } else if let Some(id) = ids.first() {
            if !resolver.exists(target, *id).await? {
                if !spec.nullable {
                    return Ok(None);
                }
                object.insert(spec.name.to_string(), Value::Null);
            }
        }
    }

    serde_json::from_value(Value::Object(object))
        .map(Some)
        .map_err(CoreError::from)
}

// ---------------------------------------------------------------------------
// Rebase
// ---------------------------------------------------------------------------

/// Result of replaying a proposal onto a newer base.
#[derive(Debug, Clone, PartialEq)]
pub struct RebaseOutcome {
    pub snapshot: Snapshot,
    /// Fields changed both by the proposal and on the live record since
    /// the proposal's base. The proposal's value is kept for these.
    pub conflicts: Vec<String>,
}

/// Replay the fields `proposed` changed relative to `base` onto `current`.
///
/// Fields the proposal left untouched take their value from `current`, so
/// edits merged since the proposal was written are preserved.
pub fn rebase_onto(base: &Snapshot, proposed: &Snapshot, current: &Snapshot) -> RebaseOutcome {
    let mut records = current.records.clone();
    let mut conflicts = Vec::new();

    for record in &mut records {
        let names: Vec<String> = record.fields.keys().cloned().collect();
        for name in names {
            let base_value = base.field(&name).cloned().unwrap_or(Value::Null);
            let Some(proposed_value) = proposed.field(&name).cloned() else {
                continue;
            };
            if proposed_value == base_value {
                continue;
            }
            let current_value = record.fields.get(&name).cloned().unwrap_or(Value::Null);
            if current_value != base_value && current_value != proposed_value {
                conflicts.push(name.clone());
            }
            record.fields.insert(name, proposed_value);
        }
    }

    RebaseOutcome {
        snapshot: Snapshot { records },
        conflicts,
    }
}
