//! Registry of moderated entity types.
//!
//! Changes store only a content-type tag and an object id. The registry
//! maps each tag to a type-erased [`EntityHandler`] so the engine can load,
//! write and verify live records without knowing their Rust type.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use modhist_core::config::{validate_required_approvals, ModerationConfig};
use modhist_core::entity::{FieldSpec, ModeratedEntity, ModerationPolicy};
use modhist_core::error::CoreError;
use modhist_core::snapshot::{self, Snapshot};
use modhist_core::types::DbId;
use sqlx::PgConnection;

use crate::error::ModerationError;
use crate::resolver::PgReferenceResolver;

// ---------------------------------------------------------------------------
// Storage contract
// ---------------------------------------------------------------------------

/// Unmoderated storage for one entity type.
///
/// Implementations read and write the live rows directly. Every write made
/// through this trait skips moderation, so only the engine should call it.
#[async_trait]
pub trait EntityRepository<E: ModeratedEntity>: Send + Sync + 'static {
    /// Load the live row, ignoring the visibility flag.
    async fn find_unmoderated(
        &self,
        conn: &mut PgConnection,
        id: DbId,
    ) -> Result<Option<E>, sqlx::Error>;

    /// Insert (when the entity has no id or no row) or update the live row
    /// and all of its inheritance-parent rows. Returns the stored entity.
    async fn raw_save(&self, conn: &mut PgConnection, entity: &E) -> Result<E, sqlx::Error>;
}

/// Type-erased operations the engine needs on a live record.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    fn model(&self) -> &'static str;

    fn fields(&self) -> &'static [FieldSpec];

    fn policy(&self) -> ModerationPolicy;

    /// Snapshot the live row, or `None` if it no longer exists.
    async fn load_snapshot(
        &self,
        conn: &mut PgConnection,
        id: DbId,
    ) -> Result<Option<Snapshot>, ModerationError>;

    /// Reconstruct the entity from `snapshot` and persist it. Returns the
    /// live id.
    async fn write_snapshot(
        &self,
        conn: &mut PgConnection,
        snapshot: &Snapshot,
    ) -> Result<DbId, ModerationError>;

    /// Set the live row's visibility flag. Returns `false` if the row is gone.
    async fn set_verified(
        &self,
        conn: &mut PgConnection,
        id: DbId,
        verified: bool,
    ) -> Result<bool, ModerationError>;
}

struct TypedHandler<E, R> {
    repo: Arc<R>,
    _entity: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, R> EntityHandler for TypedHandler<E, R>
where
    E: ModeratedEntity,
    R: EntityRepository<E>,
{
    fn model(&self) -> &'static str {
        E::MODEL
    }

    fn fields(&self) -> &'static [FieldSpec] {
        E::fields()
    }

    fn policy(&self) -> ModerationPolicy {
        E::policy()
    }

    async fn load_snapshot(
        &self,
        conn: &mut PgConnection,
        id: DbId,
    ) -> Result<Option<Snapshot>, ModerationError> {
        let Some(entity) = self.repo.find_unmoderated(&mut *conn, id).await? else {
            return Ok(None);
        };
        let resolver = PgReferenceResolver::new(conn);
        Ok(Some(snapshot::serialize(&entity, &resolver).await?))
    }

    async fn write_snapshot(
        &self,
        conn: &mut PgConnection,
        snapshot: &Snapshot,
    ) -> Result<DbId, ModerationError> {
        let entity: Option<E> = {
            let resolver = PgReferenceResolver::new(&mut *conn);
            snapshot::deserialize(snapshot, &resolver).await?
        };
        let entity = entity.ok_or_else(|| {
            CoreError::Serialization(format!(
                "{} snapshot references rows that no longer exist",
                E::MODEL
            ))
        })?;

        let saved = self.repo.raw_save(conn, &entity).await?;
        saved.id().ok_or_else(|| {
            CoreError::Internal(format!("{} was saved without an id", E::MODEL)).into()
        })
    }

    async fn set_verified(
        &self,
        conn: &mut PgConnection,
        id: DbId,
        verified: bool,
    ) -> Result<bool, ModerationError> {
        let Some(mut entity) = self.repo.find_unmoderated(&mut *conn, id).await? else {
            return Ok(false);
        };
        if entity.verified() != verified {
            entity.set_verified(verified);
            self.repo.raw_save(conn, &entity).await?;
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Content-type tag to handler lookup, plus the global moderation config.
pub struct EntityRegistry {
    config: ModerationConfig,
    handlers: HashMap<&'static str, Arc<dyn EntityHandler>>,
}

impl EntityRegistry {
    pub fn new(config: ModerationConfig) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
        }
    }

    /// Register the storage of a moderated entity type under `E::MODEL`.
    pub fn register<E, R>(&mut self, repo: Arc<R>) -> Result<(), CoreError>
    where
        E: ModeratedEntity,
        R: EntityRepository<E>,
    {
        if let Some(n) = E::policy().required_approvals {
            validate_required_approvals(n)?;
        }
        if self.handlers.contains_key(E::MODEL) {
            return Err(CoreError::Conflict(format!(
                "{} is already registered",
                E::MODEL
            )));
        }
        let handler: Arc<dyn EntityHandler> = Arc::new(TypedHandler::<E, R> {
            repo,
            _entity: PhantomData,
        });
        self.handlers.insert(E::MODEL, handler);
        tracing::debug!(content_type = E::MODEL, "Registered moderated entity type");
        Ok(())
    }

    pub fn handler(&self, content_type: &str) -> Result<Arc<dyn EntityHandler>, ModerationError> {
        self.handlers
            .get(content_type)
            .cloned()
            .ok_or_else(|| ModerationError::UnknownContentType(content_type.to_string()))
    }

    pub fn contains(&self, content_type: &str) -> bool {
        self.handlers.contains_key(content_type)
    }

    pub fn config(&self) -> ModerationConfig {
        self.config
    }

    /// Quorum for changes to `content_type`, honouring its policy override.
    pub fn quorum_for(&self, content_type: &str) -> i32 {
        let override_approvals = self
            .handlers
            .get(content_type)
            .and_then(|h| h.policy().required_approvals);
        self.config.quorum_for(override_approvals)
    }
}
