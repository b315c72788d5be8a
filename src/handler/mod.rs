//! Command handlers.
//!
//! A handler turns one command payload into one event body. The generic
//! create/update/delete handlers each run inside their own unit of work, so
//! by the time an error leaves `handle` the session is already rolled back
//! and closed.

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::correlation::MessageContext;
use crate::crud::{CrudEngine, CrudError, DocumentSession, Entity, JsonMap};
use crate::message::{decode_entity_id, EntityDeleted, UpdateCommand};
use crate::uow::{self, SessionFactory, UowError};

/// Coarse failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Malformed,
    NotFound,
    Conflict,
    Validation,
    Transient,
    Internal,
}

/// Errors a handler may return. Every variant is retried under the default
/// error policy.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] CrudError),

    #[error("Unit of work error: {0}")]
    UnitOfWork(#[from] UowError),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Malformed(_) => ErrorKind::Malformed,
            HandlerError::NotFound { .. } => ErrorKind::NotFound,
            HandlerError::Conflict(_) => ErrorKind::Conflict,
            HandlerError::Validation(_) => ErrorKind::Validation,
            HandlerError::Storage(CrudError::InvalidPatch { .. }) => ErrorKind::Validation,
            HandlerError::Storage(CrudError::Duplicate { .. }) => ErrorKind::Conflict,
            HandlerError::Storage(CrudError::Serialization(_) | CrudError::Corrupt(_)) => {
                ErrorKind::Internal
            }
            HandlerError::Storage(_) | HandlerError::UnitOfWork(_) | HandlerError::Transient(_) => {
                ErrorKind::Transient
            }
            HandlerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Failures that a retry cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Malformed | ErrorKind::NotFound | ErrorKind::Conflict | ErrorKind::Validation
        )
    }

    /// Stable name recorded as the dead letter's exception type.
    pub fn type_name(&self) -> &'static str {
        match self {
            HandlerError::Malformed(_) => "MalformedPayload",
            HandlerError::NotFound { .. } => "NotFound",
            HandlerError::Conflict(_) => "Conflict",
            HandlerError::Validation(_) => "ValidationError",
            HandlerError::Storage(_) => "StorageError",
            HandlerError::UnitOfWork(_) => "UnitOfWorkError",
            HandlerError::Transient(_) => "TransientError",
            HandlerError::Internal(_) => "InternalError",
        }
    }

    /// The error followed by its source chain, one cause per line.
    pub fn trace(&self) -> String {
        let mut trace = format!("{}: {}", self.type_name(), self);
        let mut source = self.source();
        while let Some(cause) = source {
            trace.push_str("\ncaused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        trace
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::Internal(format!("event encoding failed: {e}"))
    }
}

/// Business logic for one command subject.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Process one command. The returned value becomes the event body.
    async fn handle(&self, ctx: &MessageContext, payload: &[u8]) -> Result<Value, HandlerError>;
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, HandlerError> {
    serde_json::from_slice(payload).map_err(|e| HandlerError::Malformed(e.to_string()))
}

/// Shared state of the generic entity handlers.
struct EntityHandler<E, F> {
    store: Arc<F>,
    engine: CrudEngine<E>,
}

impl<E, F> EntityHandler<E, F> {
    fn new(store: Arc<F>) -> Self {
        Self {
            store,
            engine: CrudEngine::default(),
        }
    }
}

/// `Create<Entity>`: body is the entity's input; emits the created entity.
pub struct CreateHandler<E, F> {
    inner: EntityHandler<E, F>,
}

impl<E, F> CreateHandler<E, F> {
    pub fn new(store: Arc<F>) -> Self {
        Self {
            inner: EntityHandler::new(store),
        }
    }
}

#[async_trait]
impl<E, F> CommandHandler for CreateHandler<E, F>
where
    E: Entity,
    F: SessionFactory,
    F::Session: DocumentSession,
{
    async fn handle(&self, _ctx: &MessageContext, payload: &[u8]) -> Result<Value, HandlerError> {
        let input: E::Input = decode(payload)?;
        let engine = self.inner.engine;

        let created = uow::scoped(self.inner.store.clone(), move |uow| {
            Box::pin(async move {
                let session = uow.session().await?;
                Ok::<_, HandlerError>(engine.create(session, input).await?)
            })
        })
        .await?;

        info!(kind = E::KIND, id = %created.id(), "Entity created");
        Ok(serde_json::to_value(&created)?)
    }
}

/// `Update<Entity>`: body is `{"id": ..., "data": {...}}`; emits the updated
/// entity. Updating a missing entity is `NotFound`.
pub struct UpdateHandler<E, F> {
    inner: EntityHandler<E, F>,
}

impl<E, F> UpdateHandler<E, F> {
    pub fn new(store: Arc<F>) -> Self {
        Self {
            inner: EntityHandler::new(store),
        }
    }
}

#[async_trait]
impl<E, F> CommandHandler for UpdateHandler<E, F>
where
    E: Entity,
    F: SessionFactory,
    F::Session: DocumentSession,
{
    async fn handle(&self, _ctx: &MessageContext, payload: &[u8]) -> Result<Value, HandlerError> {
        let UpdateCommand { id, data } = decode::<UpdateCommand<JsonMap>>(payload)?;
        let engine = self.inner.engine;

        let updated = uow::scoped(self.inner.store.clone(), move |uow| {
            Box::pin(async move {
                let session = uow.session().await?;
                engine
                    .update(session, id, data)
                    .await?
                    .ok_or(HandlerError::NotFound { kind: E::KIND, id })
            })
        })
        .await?;

        info!(kind = E::KIND, %id, "Entity updated");
        Ok(serde_json::to_value(&updated)?)
    }
}

/// `Delete<Entity>`: body is the entity id; emits [`EntityDeleted`].
///
/// Deleting an id that does not exist still succeeds, so a redelivered
/// delete completes instead of dead-lettering.
pub struct DeleteHandler<E, F> {
    inner: EntityHandler<E, F>,
}

impl<E, F> DeleteHandler<E, F> {
    pub fn new(store: Arc<F>) -> Self {
        Self {
            inner: EntityHandler::new(store),
        }
    }
}

#[async_trait]
impl<E, F> CommandHandler for DeleteHandler<E, F>
where
    E: Entity,
    F: SessionFactory,
    F::Session: DocumentSession,
{
    async fn handle(&self, _ctx: &MessageContext, payload: &[u8]) -> Result<Value, HandlerError> {
        let id = decode_entity_id(payload).map_err(HandlerError::Malformed)?;
        let engine = self.inner.engine;

        let existed = uow::scoped(self.inner.store.clone(), move |uow| {
            Box::pin(async move {
                let session = uow.session().await?;
                Ok::<_, HandlerError>(engine.delete(session, id).await?)
            })
        })
        .await?;

        if existed {
            info!(kind = E::KIND, %id, "Entity deleted");
        } else {
            debug!(kind = E::KIND, %id, "Delete of absent entity");
        }
        Ok(serde_json::to_value(EntityDeleted {
            id,
            deleted_at: Utc::now(),
        })?)
    }
}

/// Adapts an async closure into a [`CommandHandler`].
pub struct FnHandler<H> {
    f: H,
}

impl<H, Fut> FnHandler<H>
where
    H: Fn(MessageContext, bytes::Bytes) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send,
{
    pub fn new(f: H) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<H, Fut> CommandHandler for FnHandler<H>
where
    H: Fn(MessageContext, bytes::Bytes) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, ctx: &MessageContext, payload: &[u8]) -> Result<Value, HandlerError> {
        (self.f)(ctx.clone(), bytes::Bytes::copy_from_slice(payload)).await
    }
}
