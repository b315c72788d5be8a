//! cqbus-worker: command worker for the `projects` service
//!
//! Consumes `cmd.<service>.{Create,Update,Delete}Project` as a queue group,
//! persists projects in the configured document store and emits
//! `events.<service>.Project{Created,Updated,Deleted}`. Run several replicas
//! against the same broker to share the load.
//!
//! ## Configuration
//! - CQBUS_CONFIG: path to a YAML config file (optional)
//! - CQBUS__MESSAGING__TYPE: `channel` or `nats`
//! - CQBUS__STORAGE__TYPE: `memory` or `sqlite`
//! - CQBUS_LOG / CQBUS_LOG_FORMAT: log filter and format

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use cqbus::bus::{init_broker, Broker};
use cqbus::config::{Config, StorageType};
use cqbus::consumer::ServiceRuntime;
use cqbus::crud::memory::MemoryStore;
use cqbus::crud::{DocumentSession, Entity};
use cqbus::uow::SessionFactory;
use cqbus::utils::bootstrap::init_tracing;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Project {
    id: Uuid,
    name: String,
    #[serde(default)]
    description: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct NewProject {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

impl Entity for Project {
    const KIND: &'static str = "project";
    type Input = NewProject;

    fn from_input(id: Uuid, created_at: DateTime<Utc>, input: NewProject) -> Self {
        Self {
            id,
            name: input.name,
            description: input.description,
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(None)?;
    init_tracing();

    let broker = init_broker(&config.messaging).await?;
    info!(
        service = %config.service.name,
        broker = broker.name(),
        debug_profile = config.is_debug_profile(),
        "cqbus-worker starting"
    );

    match config.storage.storage_type {
        StorageType::Memory => run(&config, broker, Arc::new(MemoryStore::new())).await,
        StorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let store = cqbus::crud::sqlite::SqliteStore::connect(&config.storage.sqlite).await?;
                run(&config, broker, Arc::new(store)).await
            }
            #[cfg(not(feature = "sqlite"))]
            {
                error!("SQLite storage requested but the 'sqlite' feature is not compiled in");
                Err("sqlite feature not enabled".into())
            }
        }
    }
}

async fn run<F>(
    config: &Config,
    broker: Arc<dyn Broker>,
    store: Arc<F>,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: SessionFactory,
    F::Session: DocumentSession,
{
    let mut runtime = ServiceRuntime::new(
        config.service.name.clone(),
        broker.clone(),
        config.retry_policy(),
        config.consumer.clone(),
    );
    runtime.register::<Project, F>("Project", store)?;

    let running = runtime.start().await?;
    info!(subjects = ?running.subjects(), "cqbus-worker ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");

    running.shutdown().await?;
    broker.close().await?;
    Ok(())
}
