//! Generic CRUD engine.
//!
//! One engine type, parameterized by entity, over a document-oriented
//! session. Entities are stored as JSON documents keyed by `(kind, id)`;
//! every filter defaults to newest-first ordering on `created_at`.
//!
//! The engine has no retry logic. Errors surface to the handler and from
//! there to the retry middleware.
//!
//! Backends:
//! - `memory`: process-local, staged writes applied on commit
//! - `sqlite`: sqlx transaction per session, queries built with sea-query

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::uow::Session;

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// JSON object body.
pub type JsonMap = serde_json::Map<String, Value>;

/// Fields owned by the engine; patches never overwrite them.
const IMMUTABLE_FIELDS: [&str; 2] = ["id", "created_at"];

/// Errors raised by the CRUD engine and its backends.
#[derive(Debug, thiserror::Error)]
pub enum CrudError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query build error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid update for {kind}: {reason}")]
    InvalidPatch { kind: &'static str, reason: String },

    #[error("{kind} {id} already exists")]
    Duplicate { kind: String, id: Uuid },

    #[error("Corrupt document: {0}")]
    Corrupt(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// A storable entity.
///
/// The entity's JSON form must carry its id under `id` and its creation time
/// under `created_at`.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Storage namespace, e.g. `"project"`.
    const KIND: &'static str;

    /// Create payload.
    type Input: DeserializeOwned + Send + 'static;

    fn from_input(id: Uuid, created_at: DateTime<Utc>, input: Self::Input) -> Self;

    fn id(&self) -> Uuid;

    fn created_at(&self) -> DateTime<Utc>;
}

/// Stored form of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub body: JsonMap,
}

impl Document {
    pub fn from_entity<E: Entity>(entity: &E) -> Result<Self, CrudError> {
        match serde_json::to_value(entity)? {
            Value::Object(body) => Ok(Self {
                id: entity.id(),
                created_at: entity.created_at(),
                body,
            }),
            other => Err(CrudError::Corrupt(format!(
                "{} serialized to non-object {}",
                E::KIND,
                other
            ))),
        }
    }

    pub fn into_entity<E: Entity>(self) -> Result<E, CrudError> {
        Ok(serde_json::from_value(Value::Object(self.body))?)
    }
}

/// Which fields a projection returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldSelection {
    #[default]
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl FieldSelection {
    pub fn apply(&self, mut body: JsonMap) -> JsonMap {
        match self {
            FieldSelection::All => body,
            FieldSelection::Include(fields) => {
                body.retain(|key, _| fields.iter().any(|f| f == key));
                body
            }
            FieldSelection::Exclude(fields) => {
                body.retain(|key, _| !fields.iter().any(|f| f == key));
                body
            }
        }
    }
}

/// Result ordering on `created_at`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Equality filter with projection, ordering and limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Top-level field equalities, all of which must hold.
    pub conditions: Vec<(String, Value)>,
    pub fields: FieldSelection,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: Uuid) -> Self {
        Self::new().eq("id", id.to_string())
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn include<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = FieldSelection::Include(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = FieldSelection::Exclude(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn oldest_first(mut self) -> Self {
        self.order = SortOrder::OldestFirst;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document satisfies every condition.
    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|(field, expected)| {
            if field == "id" {
                return expected.as_str() == Some(doc.id.to_string().as_str());
            }
            doc.body.get(field).unwrap_or(&Value::Null) == expected
        })
    }

    /// Order, then truncate, an unordered candidate set.
    pub fn arrange(&self, mut docs: Vec<Document>) -> Vec<Document> {
        docs.sort_by(|a, b| {
            let by_time = a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id));
            match self.order {
                SortOrder::NewestFirst => by_time.reverse(),
                SortOrder::OldestFirst => by_time,
            }
        });
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
        docs
    }
}

/// Document operations a storage session supports.
#[async_trait]
pub trait DocumentSession: Session {
    async fn insert(&mut self, kind: &str, doc: Document) -> Result<(), CrudError>;

    async fn find(&mut self, kind: &str, filter: &Filter) -> Result<Vec<Document>, CrudError>;

    /// Replace an existing document. Returns `false` if it does not exist.
    async fn replace(&mut self, kind: &str, doc: Document) -> Result<bool, CrudError>;

    /// Returns `false` if the document did not exist.
    async fn remove(&mut self, kind: &str, id: Uuid) -> Result<bool, CrudError>;
}

/// Create/get/list/update/delete for one entity type.
pub struct CrudEngine<E> {
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for CrudEngine<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for CrudEngine<E> {}

impl<E> Default for CrudEngine<E> {
    fn default() -> Self {
        Self {
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> fmt::Debug for CrudEngine<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrudEngine").field("kind", &E::KIND).finish()
    }
}

impl<E: Entity> CrudEngine<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create<S: DocumentSession>(&self, session: &mut S, input: E::Input) -> Result<E, CrudError> {
        let entity = E::from_input(Uuid::new_v4(), Utc::now(), input);
        session
            .insert(E::KIND, Document::from_entity(&entity)?)
            .await?;
        Ok(entity)
    }

    /// First match in filter order, newest first unless stated otherwise.
    pub async fn get<S: DocumentSession>(&self, session: &mut S, filter: &Filter) -> Result<Option<E>, CrudError> {
        let filter = filter.clone().limit(1);
        match session.find(E::KIND, &filter).await?.into_iter().next() {
            Some(doc) => Ok(Some(doc.into_entity()?)),
            None => Ok(None),
        }
    }

    pub async fn list<S: DocumentSession>(&self, session: &mut S, filter: &Filter) -> Result<Vec<E>, CrudError> {
        session
            .find(E::KIND, filter)
            .await?
            .into_iter()
            .map(Document::into_entity)
            .collect()
    }

    /// Matching documents reduced to the filter's field selection.
    pub async fn project<S: DocumentSession>(&self, session: &mut S, filter: &Filter) -> Result<Vec<JsonMap>, CrudError> {
        Ok(session
            .find(E::KIND, filter)
            .await?
            .into_iter()
            .map(|doc| filter.fields.apply(doc.body))
            .collect())
    }

    /// Apply a partial update. `null` values and engine-owned fields are
    /// ignored. Returns `None` if the entity does not exist.
    pub async fn update<S: DocumentSession>(
        &self,
        session: &mut S,
        id: Uuid,
        patch: JsonMap,
    ) -> Result<Option<E>, CrudError> {
        let Some(current) = session
            .find(E::KIND, &Filter::by_id(id).limit(1))
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        let mut body = current.body;
        for (field, value) in patch {
            if value.is_null() || IMMUTABLE_FIELDS.contains(&field.as_str()) {
                continue;
            }
            body.insert(field, value);
        }

        let entity: E =
            serde_json::from_value(Value::Object(body)).map_err(|e| CrudError::InvalidPatch {
                kind: E::KIND,
                reason: e.to_string(),
            })?;
        let replaced = session
            .replace(E::KIND, Document::from_entity(&entity)?)
            .await?;
        Ok(replaced.then_some(entity))
    }

    /// Returns whether the entity existed.
    pub async fn delete<S: DocumentSession>(&self, session: &mut S, id: Uuid) -> Result<bool, CrudError> {
        session.remove(E::KIND, id).await
    }
}
