//! Test utilities: a sample entity and scripted handlers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::correlation::{MessageContext, CORRELATION_HEADER};
use crate::crud::Entity;
use crate::handler::{CommandHandler, HandlerError};
use crate::message::{Headers, InboundMessage};

/// Sample entity used across unit tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i64,
}

impl NewProject {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            priority: 0,
        }
    }
}

impl Entity for Project {
    const KIND: &'static str = "project";
    type Input = NewProject;

    fn from_input(id: Uuid, created_at: DateTime<Utc>, input: NewProject) -> Self {
        Self {
            id,
            name: input.name,
            description: input.description,
            priority: input.priority,
            created_at,
        }
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Inbound command with an optional correlation header.
pub fn inbound(subject: &str, payload: impl Into<Bytes>, correlation_id: Option<&str>) -> InboundMessage {
    let mut headers = Headers::new();
    if let Some(id) = correlation_id {
        headers.insert(CORRELATION_HEADER.to_string(), id.to_string());
    }
    InboundMessage {
        stream: "cmd".to_string(),
        subject: subject.to_string(),
        message_id: Uuid::new_v4().to_string(),
        headers,
        payload: payload.into(),
        delivered: 1,
    }
}

/// Handler that fails its first `failures` invocations, then echoes the
/// payload back as JSON.
pub struct FlakyHandler {
    failures: u32,
    calls: AtomicU32,
    error: fn() -> HandlerError,
    seen: Mutex<Vec<MessageContext>>,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Self {
        Self::with_error(failures, || HandlerError::Transient("database is locked".to_string()))
    }

    /// A handler that never succeeds.
    pub fn always_failing() -> Self {
        Self::new(u32::MAX)
    }

    pub fn with_error(failures: u32, error: fn() -> HandlerError) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            error,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Contexts of every invocation, in order.
    pub fn seen(&self) -> Vec<MessageContext> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandHandler for FlakyHandler {
    async fn handle(&self, ctx: &MessageContext, payload: &[u8]) -> Result<Value, HandlerError> {
        self.seen.lock().unwrap().push(ctx.clone());
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err((self.error)());
        }
        serde_json::from_slice(payload).map_err(|e| HandlerError::Malformed(e.to_string()))
    }
}
