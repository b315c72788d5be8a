//! Unit of Work.
//!
//! One transactional storage session per message. The session is opened on
//! first use, committed when the wrapped body returns `Ok`, rolled back when
//! it returns `Err`, and closed exactly once on every path. A session that is
//! dropped without commit (panic, cancelled task) is rolled back by its
//! backend's `Drop`.
//!
//! ```ignore
//! let project = uow::scoped(factory.clone(), |uow| {
//!     Box::pin(async move {
//!         let session = uow.session().await?;
//!         Ok::<_, HandlerError>(engine.create(session, input).await?)
//!     })
//! })
//! .await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, warn};

/// Errors raised by session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum UowError {
    #[error("Failed to open session: {0}")]
    Open(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Rollback failed: {0}")]
    Rollback(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// A transactional storage session.
///
/// `commit` and `rollback` consume the session; dropping it releases the
/// underlying resource.
#[async_trait]
pub trait Session: Send {
    async fn commit(self) -> Result<(), UowError>;

    async fn rollback(self) -> Result<(), UowError>;
}

/// Opens sessions against one storage backend.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session;

    async fn open(&self) -> Result<Self::Session, UowError>;
}

/// Lifecycle counters shared by every session of one store.
#[derive(Debug, Default)]
pub struct SessionTracker {
    opened: AtomicU64,
    closed: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

/// Point-in-time copy of a [`SessionTracker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub opened: u64,
    pub closed: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

impl SessionStats {
    /// Sessions opened and not yet closed.
    pub fn open(&self) -> u64 {
        self.opened - self.closed
    }
}

impl SessionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record an opened session. The returned guard records its close when dropped.
    pub fn track(self: &Arc<Self>) -> SessionGuard {
        self.opened.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            tracker: self.clone(),
        }
    }

    pub fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_rollback(&self) {
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            opened: self.opened.load(Ordering::SeqCst),
            closed: self.closed.load(Ordering::SeqCst),
            committed: self.committed.load(Ordering::SeqCst),
            rolled_back: self.rolled_back.load(Ordering::SeqCst),
        }
    }
}

/// Marks one session as open for as long as it lives.
#[derive(Debug)]
pub struct SessionGuard {
    tracker: Arc<SessionTracker>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tracker.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Per-message session scope. Not reusable across messages.
pub struct UnitOfWork<F: SessionFactory> {
    factory: Arc<F>,
    session: Option<F::Session>,
}

impl<F: SessionFactory> UnitOfWork<F> {
    pub fn new(factory: Arc<F>) -> Self {
        Self {
            factory,
            session: None,
        }
    }

    /// The session, opened on first call.
    pub async fn session(&mut self) -> Result<&mut F::Session, UowError> {
        if self.session.is_none() {
            let session = self.factory.open().await?;
            debug!("Unit of work session opened");
            self.session = Some(session);
        }
        self.session
            .as_mut()
            .ok_or_else(|| UowError::Open("session missing after open".to_string()))
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Commit and close. A scope that never opened a session commits nothing.
    pub async fn commit(mut self) -> Result<(), UowError> {
        match self.session.take() {
            Some(session) => session.commit().await,
            None => Ok(()),
        }
    }

    /// Roll back and close.
    pub async fn rollback(mut self) -> Result<(), UowError> {
        match self.session.take() {
            Some(session) => session.rollback().await,
            None => Ok(()),
        }
    }
}

/// Run `body` inside a fresh unit of work.
///
/// Commits when `body` returns `Ok`; rolls back when it returns `Err`. A
/// failed commit is returned as the error, so the caller never sees `Ok` for
/// a mutation that was not persisted. A failed rollback is logged and the
/// body's original error is returned.
pub async fn scoped<F, T, E, B>(factory: Arc<F>, body: B) -> Result<T, E>
where
    F: SessionFactory,
    E: From<UowError> + std::fmt::Display,
    B: for<'u> FnOnce(&'u mut UnitOfWork<F>) -> BoxFuture<'u, Result<T, E>>,
{
    let mut uow = UnitOfWork::new(factory);
    match body(&mut uow).await {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = uow.rollback().await {
                warn!(error = %err, rollback_error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}
