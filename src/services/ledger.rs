//! File ledger: the authoritative per-user index of uploaded files.
//!
//! Every read is scoped by owner inside the SQL itself; no query in this
//! module can return another principal's rows.

use crate::models::file_record::{FileRecord, NewFileRecord, UsageSummary};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("file record `{0}` not found")]
    NotFound(Uuid),
    #[error("metadata store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[async_trait]
pub trait FileLedger: Send + Sync {
    /// Persist a record; returns it with its assigned id once durable.
    async fn insert(&self, record: NewFileRecord) -> LedgerResult<FileRecord>;

    /// Records owned by `owner`, newest first.
    async fn list_for(&self, owner: Uuid) -> LedgerResult<Vec<FileRecord>>;

    async fn get(&self, owner: Uuid, id: Uuid) -> LedgerResult<FileRecord>;

    async fn delete_by_id(&self, owner: Uuid, id: Uuid) -> LedgerResult<()>;

    async fn usage_for(&self, owner: Uuid) -> LedgerResult<UsageSummary>;

    /// Readiness check.
    async fn probe(&self) -> LedgerResult<()>;
}

const RECORD_COLUMNS: &str = "id, owner_id, name, size_bytes, locator, checksum, created_at";

/// Ledger stored in the SQLite `files` table.
#[derive(Clone)]
pub struct SqliteLedger {
    db: Arc<SqlitePool>,
}

impl SqliteLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FileLedger for SqliteLedger {
    async fn insert(&self, record: NewFileRecord) -> LedgerResult<FileRecord> {
        let sql = format!(
            "INSERT INTO files ({RECORD_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING {RECORD_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(Uuid::new_v4())
            .bind(record.owner_id)
            .bind(&record.name)
            .bind(record.size_bytes)
            .bind(&record.locator)
            .bind(&record.checksum)
            .bind(record.created_at)
            .fetch_one(&*self.db)
            .await?;
        Ok(inserted)
    }

    async fn list_for(&self, owner: Uuid) -> LedgerResult<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM files
             WHERE owner_id = ?
             ORDER BY created_at DESC, rowid DESC"
        );
        let records = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(owner)
            .fetch_all(&*self.db)
            .await?;
        Ok(records)
    }

    async fn get(&self, owner: Uuid, id: Uuid) -> LedgerResult<FileRecord> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM files WHERE id = ? AND owner_id = ?");
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .bind(owner)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(LedgerError::NotFound(id))
    }

    async fn delete_by_id(&self, owner: Uuid, id: Uuid) -> LedgerResult<()> {
        let result = sqlx::query("DELETE FROM files WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id));
        }
        Ok(())
    }

    async fn usage_for(&self, owner: Uuid) -> LedgerResult<UsageSummary> {
        let usage = sqlx::query_as::<_, UsageSummary>(
            "SELECT COUNT(*) AS file_count, COALESCE(SUM(size_bytes), 0) AS total_bytes
             FROM files WHERE owner_id = ?",
        )
        .bind(owner)
        .fetch_one(&*self.db)
        .await?;
        Ok(usage)
    }

    async fn probe(&self) -> LedgerResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}
