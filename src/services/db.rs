//! src/services/db.rs
//!
//! Metadata store on SQLite. Holds the `data` table (content-addressed,
//! insert-if-absent), the `blob` table (name → content pointers with a
//! soft-delete flag) and the `upload` table (resumable session state).
//! Multi-row writes that must land together run in one transaction.

use super::error::BlobResult;
use crate::models::{
    blob::{Blob, ResolvedBlob},
    data::{ContentHash, Data, Location},
    upload::{UploadKind, UploadSession, UploadState},
};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::debug;

/// Schema applied by [`MetadataStore::migrate`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const DATA_COLUMNS: &str = "hash, location, filename, type, size, created_at";
const UPLOAD_COLUMNS: &str = "upload_id, kind, workspace, name, location, filename, \
                              content_type, state, created_at, expires_at";

#[derive(Clone)]
pub struct MetadataStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> BlobResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    pub async fn ping(&self) -> BlobResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn get_data(
        &self,
        hash: &ContentHash,
        location: &Location,
    ) -> BlobResult<Option<Data>> {
        let data = sqlx::query_as::<_, Data>(&format!(
            "SELECT {DATA_COLUMNS} FROM data WHERE hash = ? AND location = ?"
        ))
        .bind(hash)
        .bind(location)
        .fetch_optional(&*self.db)
        .await?;
        Ok(data)
    }

    /// Raw blob row, deleted or not.
    pub async fn get_blob(&self, workspace: &str, name: &str) -> BlobResult<Option<Blob>> {
        let blob = sqlx::query_as::<_, Blob>(
            "SELECT workspace, name, hash, location, deleted, updated_at
             FROM blob WHERE workspace = ? AND name = ?",
        )
        .bind(workspace)
        .bind(name)
        .fetch_optional(&*self.db)
        .await?;
        Ok(blob)
    }

    /// Active blob joined with its data row. Deleted blobs resolve to `None`.
    pub async fn resolve_blob(
        &self,
        workspace: &str,
        name: &str,
    ) -> BlobResult<Option<ResolvedBlob>> {
        let blob = sqlx::query_as::<_, ResolvedBlob>(
            "SELECT b.workspace, b.name, b.hash, b.location, d.filename, d.type, d.size
             FROM blob b
             JOIN data d ON d.hash = b.hash AND d.location = b.location
             WHERE b.workspace = ? AND b.name = ? AND b.deleted = 0",
        )
        .bind(workspace)
        .bind(name)
        .fetch_optional(&*self.db)
        .await?;
        Ok(blob)
    }

    /// Active blobs of a workspace ordered by name, starting after `after`.
    pub async fn list_blobs(
        &self,
        workspace: &str,
        after: Option<&str>,
        limit: usize,
    ) -> BlobResult<Vec<ResolvedBlob>> {
        let rows = sqlx::query_as::<_, ResolvedBlob>(
            "SELECT b.workspace, b.name, b.hash, b.location, d.filename, d.type, d.size
             FROM blob b
             JOIN data d ON d.hash = b.hash AND d.location = b.location
             WHERE b.workspace = ? AND b.deleted = 0 AND b.name > ?
             ORDER BY b.name ASC LIMIT ?",
        )
        .bind(workspace)
        .bind(after.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Insert `data` if absent and point `blob` at it, atomically.
    ///
    /// Returns `false` when a row for `(hash, location)` already existed, in
    /// which case the existing row is kept and `data.filename` is unused.
    pub async fn insert_data_and_blob(&self, data: &Data, blob: &Blob) -> BlobResult<bool> {
        let mut tx = self.db.begin().await?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO data ({DATA_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(hash, location) DO NOTHING"
        ))
        .bind(data.hash)
        .bind(&data.location)
        .bind(&data.filename)
        .bind(&data.content_type)
        .bind(data.size)
        .bind(data.created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        upsert_blob(&mut tx, blob).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Point `blob` at an existing data row.
    ///
    /// Returns `false`, leaving nothing changed, if the data row has vanished.
    pub async fn link_blob(&self, blob: &Blob) -> BlobResult<bool> {
        let mut tx = self.db.begin().await?;
        upsert_blob(&mut tx, blob).await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM data WHERE hash = ? AND location = ?)",
        )
        .bind(blob.hash)
        .bind(&blob.location)
        .fetch_one(&mut *tx)
        .await?;
        if !exists {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Soft-delete. Returns `false` if no active blob had that name.
    pub async fn delete_blob(&self, workspace: &str, name: &str) -> BlobResult<bool> {
        let result = sqlx::query(
            "UPDATE blob SET deleted = 1, updated_at = ?
             WHERE workspace = ? AND name = ? AND deleted = 0",
        )
        .bind(Utc::now())
        .bind(workspace)
        .bind(name)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Data rows created before `before` that no active blob points at.
    pub async fn unreferenced_data(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> BlobResult<Vec<Data>> {
        let rows = sqlx::query_as::<_, Data>(
            "SELECT d.hash, d.location, d.filename, d.type, d.size, d.created_at
             FROM data d
             WHERE d.created_at < ?
               AND NOT EXISTS (
                   SELECT 1 FROM blob b
                   WHERE b.hash = d.hash AND b.location = d.location AND b.deleted = 0
               )
             LIMIT ?",
        )
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Delete a data row only if it is still unreferenced.
    pub async fn delete_unreferenced_data(
        &self,
        hash: &ContentHash,
        location: &Location,
    ) -> BlobResult<bool> {
        let result = sqlx::query(
            "DELETE FROM data
             WHERE hash = ? AND location = ?
               AND NOT EXISTS (
                   SELECT 1 FROM blob b
                   WHERE b.hash = data.hash AND b.location = data.location AND b.deleted = 0
               )",
        )
        .bind(hash)
        .bind(location)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_upload(&self, session: &UploadSession) -> BlobResult<()> {
        sqlx::query(&format!(
            "INSERT INTO upload ({UPLOAD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&session.upload_id)
        .bind(session.kind)
        .bind(&session.workspace)
        .bind(&session.name)
        .bind(&session.location)
        .bind(&session.filename)
        .bind(&session.content_type)
        .bind(session.state)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn get_upload(&self, upload_id: &str) -> BlobResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM upload WHERE upload_id = ?"
        ))
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(session)
    }

    /// Most recent session of `kind` targeting `workspace/name`, in any state.
    pub async fn latest_upload(
        &self,
        kind: UploadKind,
        workspace: &str,
        name: &str,
    ) -> BlobResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM upload
             WHERE workspace = ? AND name = ? AND kind = ?
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ))
        .bind(workspace)
        .bind(name)
        .bind(kind)
        .fetch_optional(&*self.db)
        .await?;
        Ok(session)
    }

    /// Most recent session of `kind` that reserved `filename` at `location`.
    pub async fn upload_for_object(
        &self,
        kind: UploadKind,
        location: &Location,
        filename: &str,
    ) -> BlobResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM upload
             WHERE location = ? AND filename = ? AND kind = ?
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ))
        .bind(location)
        .bind(filename)
        .bind(kind)
        .fetch_optional(&*self.db)
        .await?;
        Ok(session)
    }

    /// Compare-and-set on the session state.
    pub async fn transition_upload(
        &self,
        upload_id: &str,
        from: UploadState,
        to: UploadState,
    ) -> BlobResult<bool> {
        let result = sqlx::query("UPDATE upload SET state = ? WHERE upload_id = ? AND state = ?")
            .bind(to)
            .bind(upload_id)
            .bind(from)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Unfinished sessions of `kind` that went stale before `before`.
    ///
    /// Signed sessions go stale at `expires_at`, multipart ones are measured
    /// from `created_at`.
    pub async fn stale_uploads(
        &self,
        kind: UploadKind,
        before: DateTime<Utc>,
    ) -> BlobResult<Vec<UploadSession>> {
        let column = match kind {
            UploadKind::Signed => "expires_at",
            UploadKind::Multipart => "created_at",
        };
        let rows = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM upload
             WHERE kind = ? AND state IN ('created', 'completing') AND {column} < ?"
        ))
        .bind(kind)
        .bind(before)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }
}

async fn upsert_blob(conn: &mut SqliteConnection, blob: &Blob) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO blob (workspace, name, hash, location, deleted, updated_at)
         VALUES (?, ?, ?, ?, 0, ?)
         ON CONFLICT(workspace, name) DO UPDATE SET
             hash = excluded.hash,
             location = excluded.location,
             deleted = 0,
             updated_at = excluded.updated_at",
    )
    .bind(&blob.workspace)
    .bind(&blob.name)
    .bind(blob.hash)
    .bind(&blob.location)
    .bind(blob.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_store() -> MetadataStore {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = MetadataStore::new(Arc::new(pool));
    store.migrate().await.unwrap();
    store
}
