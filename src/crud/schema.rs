//! Document table schema using sea-query.

use sea_query::Iden;

/// Documents table. One row per `(kind, id)`; the entity is stored as JSON.
#[derive(Iden)]
pub enum Documents {
    Table,
    #[iden = "kind"]
    Kind,
    #[iden = "id"]
    Id,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "body"]
    Body,
}

/// SQL for creating the documents table.
pub const CREATE_DOCUMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    kind TEXT NOT NULL,
    id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (kind, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_kind_created ON documents(kind, created_at);
"#;
