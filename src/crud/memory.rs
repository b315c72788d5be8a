//! In-memory document store.
//!
//! Writes are staged per session and applied atomically on commit, so a
//! rolled-back or dropped session leaves no trace. Reads inside a session see
//! its own staged writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::{CrudError, Document, DocumentSession, Filter};
use crate::uow::{Session, SessionFactory, SessionGuard, SessionStats, SessionTracker, UowError};

type Collections = HashMap<String, HashMap<Uuid, Document>>;

struct Inner {
    docs: Mutex<Collections>,
    tracker: Arc<SessionTracker>,
    unavailable: AtomicBool,
}

/// Process-local document store. Clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("stats", &self.stats())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                docs: Mutex::new(HashMap::new()),
                tracker: SessionTracker::new(),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Simulate an outage: opening and committing sessions fail while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.tracker.stats()
    }

    /// Committed documents of one kind.
    pub fn count(&self, kind: &str) -> usize {
        self.docs().get(kind).map_or(0, HashMap::len)
    }

    fn docs(&self) -> MutexGuard<'_, Collections> {
        self.inner.docs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_unavailable(&self) -> bool {
        self.inner.unavailable.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for MemoryStore {
    type Session = MemorySession;

    async fn open(&self) -> Result<MemorySession, UowError> {
        if self.is_unavailable() {
            return Err(UowError::Unavailable("memory store offline".to_string()));
        }
        Ok(MemorySession {
            store: self.clone(),
            staged: Vec::new(),
            _guard: self.inner.tracker.track(),
        })
    }
}

#[derive(Debug, Clone)]
enum Staged {
    Insert(String, Document),
    Replace(String, Document),
    Remove(String, Uuid),
}

impl Staged {
    fn kind(&self) -> &str {
        match self {
            Staged::Insert(kind, _) | Staged::Replace(kind, _) | Staged::Remove(kind, _) => kind,
        }
    }

    fn apply(self, docs: &mut Collections) {
        match self {
            Staged::Insert(kind, doc) | Staged::Replace(kind, doc) => {
                docs.entry(kind).or_default().insert(doc.id, doc);
            }
            Staged::Remove(kind, id) => {
                if let Some(collection) = docs.get_mut(&kind) {
                    collection.remove(&id);
                }
            }
        }
    }
}

/// A staged view over a [`MemoryStore`].
pub struct MemorySession {
    store: MemoryStore,
    staged: Vec<Staged>,
    _guard: SessionGuard,
}

impl MemorySession {
    /// Committed state of `kind` with this session's staged writes applied.
    fn view(&self, kind: &str) -> HashMap<Uuid, Document> {
        let mut view = Collections::new();
        if let Some(committed) = self.store.docs().get(kind) {
            view.insert(kind.to_string(), committed.clone());
        }
        for op in self.staged.iter().filter(|op| op.kind() == kind) {
            op.clone().apply(&mut view);
        }
        view.remove(kind).unwrap_or_default()
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn commit(self) -> Result<(), UowError> {
        if self.store.is_unavailable() {
            return Err(UowError::Commit("memory store offline".to_string()));
        }
        {
            let mut docs = self.store.docs();
            for op in self.staged {
                op.apply(&mut docs);
            }
        }
        self.store.inner.tracker.record_commit();
        Ok(())
    }

    async fn rollback(self) -> Result<(), UowError> {
        self.store.inner.tracker.record_rollback();
        Ok(())
    }
}

#[async_trait]
impl DocumentSession for MemorySession {
    async fn insert(&mut self, kind: &str, doc: Document) -> Result<(), CrudError> {
        if self.view(kind).contains_key(&doc.id) {
            return Err(CrudError::Duplicate {
                kind: kind.to_string(),
                id: doc.id,
            });
        }
        self.staged.push(Staged::Insert(kind.to_string(), doc));
        Ok(())
    }

    async fn find(&mut self, kind: &str, filter: &Filter) -> Result<Vec<Document>, CrudError> {
        let candidates = self
            .view(kind)
            .into_values()
            .filter(|doc| filter.matches(doc))
            .collect();
        Ok(filter.arrange(candidates))
    }

    async fn replace(&mut self, kind: &str, doc: Document) -> Result<bool, CrudError> {
        if !self.view(kind).contains_key(&doc.id) {
            return Ok(false);
        }
        self.staged.push(Staged::Replace(kind.to_string(), doc));
        Ok(true)
    }

    async fn remove(&mut self, kind: &str, id: Uuid) -> Result<bool, CrudError> {
        if !self.view(kind).contains_key(&id) {
            return Ok(false);
        }
        self.staged.push(Staged::Remove(kind.to_string(), id));
        Ok(true)
    }
}
