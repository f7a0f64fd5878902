//! Reference checks and relation labels backed by Postgres.
//!
//! Related tables come from static [`RelationTarget`] declarations, never
//! from user input, so they are interpolated into the SQL directly.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use modhist_core::entity::{FieldSpec, RelationTarget};
use modhist_core::error::CoreError;
use modhist_core::snapshot::{ReferenceResolver, Snapshot};
use modhist_core::types::DbId;
use serde_json::Value;
use sqlx::PgConnection;
use tokio::sync::Mutex;

/// Resolves references over one connection, so lookups made while
/// applying a change see the same transaction as the write.
pub struct PgReferenceResolver<'c> {
    conn: Mutex<&'c mut PgConnection>,
}

impl<'c> PgReferenceResolver<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

#[async_trait]
impl<'c> ReferenceResolver for PgReferenceResolver<'c> {
    async fn exists(&self, target: &RelationTarget, id: DbId) -> Result<bool, CoreError> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)",
            target.table
        );
        let mut conn = self.conn.lock().await;
        sqlx::query_scalar::<_, bool>(&query)
            .bind(id)
            .fetch_one(&mut **conn)
            .await
            .map_err(|e| {
                CoreError::Internal(format!(
                    "reference lookup on {} failed: {e}",
                    target.table
                ))
            })
    }
}

/// Load the display labels of every related row referenced by `snapshots`.
///
/// Keys are `(related model, id)`, matching the diff engine's labeler.
pub async fn relation_labels(
    conn: &mut PgConnection,
    fields: &[FieldSpec],
    snapshots: &[&Snapshot],
) -> Result<HashMap<(String, DbId), String>, sqlx::Error> {
    let mut wanted: HashMap<RelationTarget, BTreeSet<DbId>> = HashMap::new();
    for spec in fields {
        let Some(target) = spec.kind.relation() else {
            continue;
        };
        for snapshot in snapshots {
            let ids = wanted.entry(*target).or_default();
            match snapshot.field(spec.name) {
                Some(Value::Number(n)) => ids.extend(n.as_i64()),
                Some(Value::Array(items)) => ids.extend(items.iter().filter_map(Value::as_i64)),
                _ => {}
            }
        }
    }

    let mut labels = HashMap::new();
    for (target, ids) in wanted {
        if ids.is_empty() {
            continue;
        }
        let query = format!(
            "SELECT id, {}::text FROM {} WHERE id = ANY($1)",
            target.label_column, target.table
        );
        let rows = sqlx::query_as::<_, (DbId, String)>(&query)
            .bind(ids.into_iter().collect::<Vec<_>>())
            .fetch_all(&mut *conn)
            .await?;
        for (id, label) in rows {
            labels.insert((target.model.to_string(), id), label);
        }
    }
    Ok(labels)
}
