//! SQLite document store.
//!
//! Each session holds one pooled connection inside a `BEGIN IMMEDIATE`
//! transaction. The write lock is taken upfront so concurrent sessions queue
//! on `busy_timeout` instead of failing to upgrade a shared lock. A session
//! dropped without commit or rollback detaches and closes its connection,
//! which discards the open transaction.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{Expr, Order, Query, SimpleExpr, SqliteQueryBuilder, Value as SqlValue};
use sea_query_binder::SqlxBinder;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::schema::{Documents, CREATE_DOCUMENTS_TABLE};
use super::{CrudError, Document, DocumentSession, Filter, SortOrder};
use crate::config::SqliteConfig;
use crate::uow::{Session, SessionFactory, SessionGuard, SessionStats, SessionTracker, UowError};

const IN_MEMORY: &str = ":memory:";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed session factory.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    tracker: Arc<SessionTracker>,
}

impl SqliteStore {
    /// Open (creating if missing) the database and ensure the schema exists.
    pub async fn connect(config: &SqliteConfig) -> Result<Self, CrudError> {
        let in_memory = config.path == IN_MEMORY;
        let mut options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives and dies with its one connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };
        let pool = pool_options.connect_with(options).await?;

        info!(path = %config.path, "Connected to SQLite document store");
        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            tracker: SessionTracker::new(),
        }
    }

    /// Create the documents table if absent.
    pub async fn init(&self) -> Result<(), CrudError> {
        sqlx::raw_sql(CREATE_DOCUMENTS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn stats(&self) -> SessionStats {
        self.tracker.stats()
    }
}

#[async_trait]
impl SessionFactory for SqliteStore {
    type Session = SqliteSession;

    async fn open(&self) -> Result<SqliteSession, UowError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| UowError::Unavailable(e.to_string()))?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| UowError::Open(e.to_string()))?;

        Ok(SqliteSession {
            conn: Some(conn),
            tracker: self.tracker.clone(),
            _guard: self.tracker.track(),
        })
    }
}

/// One open transaction.
pub struct SqliteSession {
    conn: Option<PoolConnection<Sqlite>>,
    tracker: Arc<SessionTracker>,
    _guard: SessionGuard,
}

impl SqliteSession {
    fn conn(&mut self) -> Result<&mut SqliteConnection, CrudError> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| CrudError::Unavailable("session already closed".to_string()))
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!("SQLite session dropped with open transaction, closing connection");
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl Session for SqliteSession {
    async fn commit(mut self) -> Result<(), UowError> {
        let Some(mut conn) = self.conn.take() else {
            return Err(UowError::Commit("session already closed".to_string()));
        };
        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(UowError::Commit(e.to_string()));
        }
        self.tracker.record_commit();
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), UowError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        self.tracker.record_rollback();
        sqlx::query("ROLLBACK")
            .execute(&mut *conn)
            .await
            .map_err(|e| UowError::Rollback(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DocumentSession for SqliteSession {
    async fn insert(&mut self, kind: &str, doc: Document) -> Result<(), CrudError> {
        let (sql, values) = Query::insert()
            .into_table(Documents::Table)
            .columns([
                Documents::Kind,
                Documents::Id,
                Documents::CreatedAt,
                Documents::Body,
            ])
            .values([
                kind.into(),
                doc.id.to_string().into(),
                format_timestamp(doc.created_at).into(),
                serde_json::to_string(&doc.body)?.into(),
            ])
            .map_err(|e| CrudError::Query(e.to_string()))?
            .build_sqlx(SqliteQueryBuilder);

        match sqlx::query_with(&sql, values).execute(self.conn()?).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(CrudError::Duplicate {
                kind: kind.to_string(),
                id: doc.id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&mut self, kind: &str, filter: &Filter) -> Result<Vec<Document>, CrudError> {
        let direction = match filter.order {
            SortOrder::NewestFirst => Order::Desc,
            SortOrder::OldestFirst => Order::Asc,
        };

        let mut query = Query::select();
        query
            .columns([Documents::Id, Documents::CreatedAt, Documents::Body])
            .from(Documents::Table)
            .and_where(Expr::col(Documents::Kind).eq(kind))
            .order_by(Documents::CreatedAt, direction.clone())
            .order_by(Documents::Id, direction);
        for (field, expected) in &filter.conditions {
            query.and_where(condition(field, expected));
        }
        if let Some(limit) = filter.limit {
            query.limit(limit as u64);
        }
        let (sql, values) = query.build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&sql, values)
            .fetch_all(self.conn()?)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn replace(&mut self, kind: &str, doc: Document) -> Result<bool, CrudError> {
        let (sql, values) = Query::update()
            .table(Documents::Table)
            .value(Documents::Body, serde_json::to_string(&doc.body)?)
            .and_where(Expr::col(Documents::Kind).eq(kind))
            .and_where(Expr::col(Documents::Id).eq(doc.id.to_string()))
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&mut self, kind: &str, id: Uuid) -> Result<bool, CrudError> {
        let (sql, values) = Query::delete()
            .from_table(Documents::Table)
            .and_where(Expr::col(Documents::Kind).eq(kind))
            .and_where(Expr::col(Documents::Id).eq(id.to_string()))
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Equality on a top-level body field. `id` uses the key column.
fn condition(field: &str, expected: &Value) -> SimpleExpr {
    if field == "id" {
        let id = match expected {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Expr::col(Documents::Id).eq(id);
    }

    let path = SqlValue::from(format!("$.\"{}\"", field.replace('"', "\\\"")));
    let bound = match expected {
        Value::Null => {
            return Expr::cust_with_values("json_extract(body, ?) IS NULL", [path]);
        }
        Value::Bool(b) => SqlValue::from(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::from(i),
            None => SqlValue::from(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::from(s.clone()),
        composite => SqlValue::from(composite.to_string()),
    };
    Expr::cust_with_values("json_extract(body, ?) = ?", [path, bound])
}

fn document_from_row(row: &SqliteRow) -> Result<Document, CrudError> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let body: String = row.try_get("body")?;

    let id = Uuid::from_str(&id).map_err(|e| CrudError::Corrupt(format!("id {id}: {e}")))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| CrudError::Corrupt(format!("created_at {created_at}: {e}")))?
        .with_timezone(&Utc);
    let body = match serde_json::from_str(&body)? {
        Value::Object(map) => map,
        other => return Err(CrudError::Corrupt(format!("body of {id} is {other}"))),
    };

    Ok(Document {
        id,
        created_at,
        body,
    })
}

/// Fixed-width UTC timestamps sort lexicographically.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_as_text() {
        let earlier = DateTime::parse_from_rfc3339("2024-01-01T09:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = DateTime::parse_from_rfc3339("2024-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(format_timestamp(earlier) < format_timestamp(later));
        assert_eq!(format_timestamp(later), "2024-01-01T10:00:00.000000Z");
    }

    #[test]
    fn test_condition_on_id_uses_key_column() {
        let id = Uuid::new_v4();
        let (sql, _) = Query::select()
            .column(Documents::Id)
            .from(Documents::Table)
            .and_where(condition("id", &Value::String(id.to_string())))
            .build(SqliteQueryBuilder);
        assert!(sql.contains("\"id\" = ?"), "{sql}");
        assert!(!sql.contains("json_extract"), "{sql}");
    }

    #[test]
    fn test_condition_on_null_field() {
        let (sql, _) = Query::select()
            .column(Documents::Id)
            .from(Documents::Table)
            .and_where(condition("description", &Value::Null))
            .build(SqliteQueryBuilder);
        assert!(sql.contains("json_extract(body, ?) IS NULL"), "{sql}");
    }

    #[tokio::test]
    async fn test_in_memory_store_round_trip() {
        let store = SqliteStore::connect(&SqliteConfig {
            path: IN_MEMORY.to_string(),
            max_connections: 5,
        })
        .await
        .unwrap();

        let mut session = store.open().await.unwrap();
        let mut body = serde_json::Map::new();
        body.insert("name".to_string(), Value::from("alpha"));
        body.insert("archived".to_string(), Value::from(false));
        let doc = Document {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            body,
        };
        session.insert("project", doc.clone()).await.unwrap();
        session.commit().await.unwrap();

        let mut session = store.open().await.unwrap();
        let found = session
            .find("project", &Filter::new().eq("archived", false))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, doc.id);
        assert_eq!(found[0].body, doc.body);
        session.rollback().await.unwrap();

        assert_eq!(store.stats().open(), 0);
    }
}
