//! Sample moderated domain shared by the integration tests.
//!
//! `Quote` spans two tables (`modules` is its inheritance parent) and has
//! foreign-key and many-to-many references. `Source` is a single-table
//! entity with a permissive policy: quorum of one, history kept, visible
//! until rejected, and auto hooks keyed on title. `Outlet` is trusted once
//! approved: later edits skip moderation.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use modhist_core::config::ModerationConfig;
use modhist_core::entity::{
    FieldKind, FieldSpec, ModeratedEntity, ModerationPolicy, RelationTarget,
};
use modhist_core::snapshot::Snapshot;
use modhist_core::types::DbId;
use modhist_db::interception::{ModeratingRepository, SaveOutcome};
use modhist_db::models::moderation::Moderator;
use modhist_db::registry::{EntityRegistry, EntityRepository};
use modhist_db::repositories::ChangeRepo;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};

pub const ATTRIBUTEE: RelationTarget = RelationTarget::new("entities.entity", "entities", "name");
pub const TOPIC: RelationTarget = RelationTarget::new("topics.topic", "topics", "name");

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Create the sample domain tables and seed related rows.
pub async fn setup(pool: &PgPool) {
    for statement in [
        "CREATE TABLE entities (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL)",
        "CREATE TABLE topics (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL)",
        "CREATE TABLE modules (
            id BIGSERIAL PRIMARY KEY,
            title TEXT NOT NULL,
            verified BOOLEAN NOT NULL DEFAULT FALSE
        )",
        "CREATE TABLE quotes (
            id BIGINT PRIMARY KEY REFERENCES modules (id),
            text TEXT NOT NULL,
            attributee_id BIGINT NOT NULL REFERENCES entities (id),
            topic_ids BIGINT[] NOT NULL DEFAULT '{}'
        )",
        "CREATE TABLE sources (
            id BIGSERIAL PRIMARY KEY,
            title TEXT NOT NULL,
            verified BOOLEAN NOT NULL DEFAULT FALSE
        )",
        "CREATE TABLE outlets (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            verified BOOLEAN NOT NULL DEFAULT FALSE
        )",
        "INSERT INTO entities (id, name) VALUES (1, 'Winston Churchill'), (2, 'Abraham Lincoln')",
        "INSERT INTO topics (id, name) VALUES (1, 'War'), (2, 'Rhetoric')",
    ] {
        sqlx::query(statement).execute(pool).await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Quote
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Quote {
    pub id: Option<DbId>,
    pub text: String,
    pub attributee_id: DbId,
    pub topic_ids: Vec<DbId>,
    pub title: String,
    pub verified: bool,
}

const QUOTE_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("id", FieldKind::AutoId),
    FieldSpec::new("text", FieldKind::Text).label("Text"),
    FieldSpec::new("attributee_id", FieldKind::ForeignKey(ATTRIBUTEE)).label("Attributee"),
    FieldSpec::new("topic_ids", FieldKind::ManyToMany(TOPIC)).label("Topics"),
    FieldSpec::new("title", FieldKind::Text)
        .label("Title")
        .owned_by("modules.module"),
    FieldSpec::new("verified", FieldKind::Boolean).owned_by("modules.module"),
];

impl ModeratedEntity for Quote {
    const MODEL: &'static str = "quotes.quote";

    fn fields() -> &'static [FieldSpec] {
        QUOTE_FIELDS
    }

    fn parent_models() -> &'static [&'static str] {
        &["modules.module"]
    }

    fn id(&self) -> Option<DbId> {
        self.id
    }

    fn set_id(&mut self, id: DbId) {
        self.id = Some(id);
    }

    fn verified(&self) -> bool {
        self.verified
    }

    fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
    }
}

pub struct QuoteRepo;

#[async_trait]
impl EntityRepository<Quote> for QuoteRepo {
    async fn find_unmoderated(
        &self,
        conn: &mut PgConnection,
        id: DbId,
    ) -> Result<Option<Quote>, sqlx::Error> {
        sqlx::query_as::<_, Quote>(
            "SELECT q.id, q.text, q.attributee_id, q.topic_ids, m.title, m.verified \
             FROM quotes q JOIN modules m ON m.id = q.id \
             WHERE q.id = $1",
        )
        .bind(id)
        .fetch_optional(conn)
        .await
    }

    async fn raw_save(&self, conn: &mut PgConnection, quote: &Quote) -> Result<Quote, sqlx::Error> {
        let id = sqlx::query_scalar::<_, DbId>(
            "INSERT INTO modules (id, title, verified) \
             VALUES (COALESCE($1, nextval('modules_id_seq')), $2, $3) \
             ON CONFLICT (id) DO UPDATE SET title = EXCLUDED.title, verified = EXCLUDED.verified \
             RETURNING id",
        )
        .bind(quote.id)
        .bind(&quote.title)
        .bind(quote.verified)
        .fetch_one(&mut *conn)
        .await?;
        sqlx::query(
            "INSERT INTO quotes (id, text, attributee_id, topic_ids) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET text = EXCLUDED.text, \
                 attributee_id = EXCLUDED.attributee_id, topic_ids = EXCLUDED.topic_ids",
        )
        .bind(id)
        .bind(&quote.text)
        .bind(quote.attributee_id)
        .bind(&quote.topic_ids)
        .execute(&mut *conn)
        .await?;
        Ok(Quote {
            id: Some(id),
            ..quote.clone()
        })
    }
}

pub fn new_quote(text: &str) -> Quote {
    Quote {
        id: None,
        text: text.to_string(),
        attributee_id: 1,
        topic_ids: vec![1],
        title: "Churchill on the beaches".to_string(),
        verified: false,
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Source {
    pub id: Option<DbId>,
    pub title: String,
    pub verified: bool,
}

const SOURCE_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("id", FieldKind::AutoId),
    FieldSpec::new("title", FieldKind::Text).label("Title"),
    FieldSpec::new("verified", FieldKind::Boolean),
];

fn title_contains(snapshot: &Snapshot, needle: &str) -> bool {
    snapshot
        .field("title")
        .and_then(|v| v.as_str())
        .is_some_and(|title| title.contains(needle))
}

fn is_spam(snapshot: &Snapshot) -> bool {
    title_contains(snapshot, "spam")
}

fn is_trusted(snapshot: &Snapshot) -> bool {
    title_contains(snapshot, "[trusted]")
}

impl ModeratedEntity for Source {
    const MODEL: &'static str = "sources.source";

    fn fields() -> &'static [FieldSpec] {
        SOURCE_FIELDS
    }

    fn policy() -> ModerationPolicy {
        ModerationPolicy {
            keep_history: true,
            visible_until_rejected: true,
            required_approvals: Some(1),
            is_auto_approve: is_trusted,
            is_auto_reject: is_spam,
            ..ModerationPolicy::DEFAULT
        }
    }

    fn id(&self) -> Option<DbId> {
        self.id
    }

    fn set_id(&mut self, id: DbId) {
        self.id = Some(id);
    }

    fn verified(&self) -> bool {
        self.verified
    }

    fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
    }
}

pub struct SourceRepo;

#[async_trait]
impl EntityRepository<Source> for SourceRepo {
    async fn find_unmoderated(
        &self,
        conn: &mut PgConnection,
        id: DbId,
    ) -> Result<Option<Source>, sqlx::Error> {
        sqlx::query_as::<_, Source>("SELECT id, title, verified FROM sources WHERE id = $1")
            .bind(id)
            .fetch_optional(conn)
            .await
    }

    async fn raw_save(
        &self,
        conn: &mut PgConnection,
        source: &Source,
    ) -> Result<Source, sqlx::Error> {
        sqlx::query_as::<_, Source>(
            "INSERT INTO sources (id, title, verified) \
             VALUES (COALESCE($1, nextval('sources_id_seq')), $2, $3) \
             ON CONFLICT (id) DO UPDATE SET title = EXCLUDED.title, verified = EXCLUDED.verified \
             RETURNING id, title, verified",
        )
        .bind(source.id)
        .bind(&source.title)
        .bind(source.verified)
        .fetch_one(conn)
        .await
    }
}

pub fn new_source(title: &str) -> Source {
    Source {
        id: None,
        title: title.to_string(),
        verified: false,
    }
}

// ---------------------------------------------------------------------------
// Outlet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Outlet {
    pub id: Option<DbId>,
    pub name: String,
    pub verified: bool,
}

const OUTLET_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("id", FieldKind::AutoId),
    FieldSpec::new("name", FieldKind::Text).label("Name"),
    FieldSpec::new("verified", FieldKind::Boolean),
];

impl ModeratedEntity for Outlet {
    const MODEL: &'static str = "outlets.outlet";

    fn fields() -> &'static [FieldSpec] {
        OUTLET_FIELDS
    }

    fn policy() -> ModerationPolicy {
        ModerationPolicy {
            bypass_after_approval: true,
            required_approvals: Some(1),
            ..ModerationPolicy::DEFAULT
        }
    }

    fn id(&self) -> Option<DbId> {
        self.id
    }

    fn set_id(&mut self, id: DbId) {
        self.id = Some(id);
    }

    fn verified(&self) -> bool {
        self.verified
    }

    fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
    }
}

pub struct OutletRepo;

#[async_trait]
impl EntityRepository<Outlet> for OutletRepo {
    async fn find_unmoderated(
        &self,
        conn: &mut PgConnection,
        id: DbId,
    ) -> Result<Option<Outlet>, sqlx::Error> {
        sqlx::query_as::<_, Outlet>("SELECT id, name, verified FROM outlets WHERE id = $1")
            .bind(id)
            .fetch_optional(conn)
            .await
    }

    async fn raw_save(
        &self,
        conn: &mut PgConnection,
        outlet: &Outlet,
    ) -> Result<Outlet, sqlx::Error> {
        sqlx::query_as::<_, Outlet>(
            "INSERT INTO outlets (id, name, verified) \
             VALUES (COALESCE($1, nextval('outlets_id_seq')), $2, $3) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, verified = EXCLUDED.verified \
             RETURNING id, name, verified",
        )
        .bind(outlet.id)
        .bind(&outlet.name)
        .bind(outlet.verified)
        .fetch_one(conn)
        .await
    }
}

pub fn new_outlet(name: &str) -> Outlet {
    Outlet {
        id: None,
        name: name.to_string(),
        verified: false,
    }
}

// ---------------------------------------------------------------------------
// Engine wiring
// ---------------------------------------------------------------------------

pub fn registry() -> Arc<EntityRegistry> {
    let mut registry = EntityRegistry::new(ModerationConfig::default());
    registry.register::<Quote, _>(Arc::new(QuoteRepo)).unwrap();
    registry.register::<Source, _>(Arc::new(SourceRepo)).unwrap();
    registry.register::<Outlet, _>(Arc::new(OutletRepo)).unwrap();
    Arc::new(registry)
}

pub fn quotes(
    pool: &PgPool,
    registry: &Arc<EntityRegistry>,
) -> ModeratingRepository<Quote, QuoteRepo> {
    ModeratingRepository::new(pool.clone(), Arc::new(QuoteRepo), registry.clone()).unwrap()
}

pub fn sources(
    pool: &PgPool,
    registry: &Arc<EntityRegistry>,
) -> ModeratingRepository<Source, SourceRepo> {
    ModeratingRepository::new(pool.clone(), Arc::new(SourceRepo), registry.clone()).unwrap()
}

pub fn outlets(
    pool: &PgPool,
    registry: &Arc<EntityRegistry>,
) -> ModeratingRepository<Outlet, OutletRepo> {
    ModeratingRepository::new(pool.clone(), Arc::new(OutletRepo), registry.clone()).unwrap()
}

pub const ALICE: DbId = 10;
pub const BOB: DbId = 11;
pub const CAROL: DbId = 12;
pub const ADMIN: DbId = 99;

/// Save a new quote and submit its draft change. Returns (object_id, change_id).
pub async fn submitted_quote(
    pool: &PgPool,
    registry: &Arc<EntityRegistry>,
    text: &str,
) -> (DbId, DbId) {
    let outcome = quotes(pool, registry)
        .save(&new_quote(text), Some(ALICE))
        .await
        .unwrap();
    let SaveOutcome::Created {
        object_id,
        change_id,
    } = outcome
    else {
        panic!("expected a created quote, got {outcome:?}");
    };
    ChangeRepo::submit(pool, change_id).await.unwrap();
    (object_id, change_id)
}

/// A quote whose creating change has been approved and merged.
pub async fn published_quote(pool: &PgPool, registry: &Arc<EntityRegistry>, text: &str) -> Quote {
    let (object_id, change_id) = submitted_quote(pool, registry, text).await;
    ChangeRepo::approve(pool, registry, change_id, &Moderator::user(BOB), "ok", false)
        .await
        .unwrap();
    ChangeRepo::approve(pool, registry, change_id, &Moderator::user(CAROL), "ok", false)
        .await
        .unwrap();
    assert!(ChangeRepo::apply(pool, registry, change_id).await.unwrap());
    quotes(pool, registry)
        .find_unmoderated(object_id)
        .await
        .unwrap()
        .unwrap()
}
