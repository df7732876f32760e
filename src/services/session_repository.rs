//! src/services/session_repository.rs
//!
//! Durable store of upload sessions. Every mutation is a single conditional
//! statement keyed by `session_id` (and `chunk_index` for chunks), so
//! concurrent requests against one session can interleave freely without
//! corrupting the record. The manager never caches what it reads here.

use crate::models::session::{ChunkRecord, ProviderKind, SessionStatus, UploadSession};
use crate::services::selector::MigrationPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Schema applied by `--migrate` and by tests.
pub const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const SESSION_COLUMNS: &str = "session_id, name, declared_size, mime_type, provider, provider_key, \
     multipart_id, chunk_size, chunk_count, uploader_id, status, download_count, \
     last_download_at, migration_scheduled, migration_scheduled_at, original_provider, \
     expires_at, created_at, updated_at";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Outcome of a compare-and-set chunk insert.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkInsert {
    Inserted,
    /// A record for that index already existed and was left untouched.
    Existing(ChunkRecord),
}

/// State after one atomically counted download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRecord {
    pub download_count: i64,
    pub migration_scheduled: bool,
    /// True only for the download that flipped the flag.
    pub newly_scheduled: bool,
}

/// Minimal view the reaper needs to reclaim a session.
#[derive(Debug, Clone, FromRow)]
pub struct ExpiredSession {
    pub session_id: Uuid,
    pub provider: ProviderKind,
    pub provider_key: String,
    pub status: SessionStatus,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert_session(&self, session: &UploadSession) -> RepositoryResult<()>;

    /// Session with recipients and chunks, regardless of expiry.
    async fn find_session(&self, session_id: Uuid) -> RepositoryResult<Option<UploadSession>>;

    /// Insert a chunk record unless one exists for `(session_id, index)`.
    async fn insert_chunk(
        &self,
        session_id: Uuid,
        chunk: &ChunkRecord,
    ) -> RepositoryResult<ChunkInsert>;

    async fn count_chunks(&self, session_id: Uuid) -> RepositoryResult<i64>;

    /// `init -> uploading`. Returns whether this call made the transition.
    async fn mark_uploading(&self, session_id: Uuid, now: DateTime<Utc>) -> RepositoryResult<bool>;

    /// `init | uploading -> ready`. Returns whether this call made the transition.
    async fn mark_ready(&self, session_id: Uuid, now: DateTime<Utc>) -> RepositoryResult<bool>;

    /// Any state `-> error`, pulling `expires_at` forward to `horizon`
    /// (never pushing it later). Returns the resulting expiry.
    async fn mark_aborted(
        &self,
        session_id: Uuid,
        horizon: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<DateTime<Utc>>>;

    /// Count one download on a ready session and, in the same statement,
    /// set the migration flag when `policy` says so. `None` if no ready
    /// session matched.
    async fn record_download(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        policy: &MigrationPolicy,
    ) -> RepositoryResult<Option<DownloadRecord>>;

    /// Sessions whose `expires_at` is at or before `now`. Those with fewer
    /// failed reclaim attempts come first, then the oldest.
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> RepositoryResult<Vec<ExpiredSession>>;

    /// Count a failed reclaim so the session sorts behind fresh work.
    async fn defer_reap(&self, session_id: Uuid) -> RepositoryResult<bool>;

    async fn delete_session(&self, session_id: Uuid) -> RepositoryResult<bool>;

    /// Flagged sessions awaiting the external migration job.
    async fn list_migration_candidates(&self, limit: u32) -> RepositoryResult<Vec<UploadSession>>;

    /// Record a finished relocation. Applies only while the flag is set and
    /// the session is not already on `provider`, so the job can run
    /// more than once per session.
    async fn complete_migration(
        &self,
        session_id: Uuid,
        provider: ProviderKind,
        provider_key: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool>;
}

/// SQLite-backed [`SessionRepository`].
#[derive(Clone)]
pub struct SqliteSessionRepository {
    pub db: Arc<SqlitePool>,
}

impl SqliteSessionRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    async fn chunks(&self, session_id: Uuid) -> RepositoryResult<Vec<ChunkRecord>> {
        let chunks = sqlx::query_as::<_, ChunkRecord>(
            "SELECT chunk_index, checksum, size, etag, uploaded_at
             FROM upload_chunks WHERE session_id = ? ORDER BY chunk_index ASC",
        )
        .bind(session_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(chunks)
    }

    async fn chunk(&self, session_id: Uuid, index: i64) -> RepositoryResult<Option<ChunkRecord>> {
        let chunk = sqlx::query_as::<_, ChunkRecord>(
            "SELECT chunk_index, checksum, size, etag, uploaded_at
             FROM upload_chunks WHERE session_id = ? AND chunk_index = ?",
        )
        .bind(session_id)
        .bind(index)
        .fetch_optional(&*self.db)
        .await?;
        Ok(chunk)
    }

    async fn recipients(&self, session_id: Uuid) -> RepositoryResult<Vec<String>> {
        let recipients = sqlx::query_scalar::<_, String>(
            "SELECT recipient_id FROM session_recipients WHERE session_id = ? ORDER BY recipient_id",
        )
        .bind(session_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(recipients)
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn insert_session(&self, session: &UploadSession) -> RepositoryResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO upload_sessions ({SESSION_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(session.session_id)
        .bind(&session.name)
        .bind(session.declared_size)
        .bind(&session.mime_type)
        .bind(session.provider)
        .bind(&session.provider_key)
        .bind(&session.multipart_id)
        .bind(session.chunk_size)
        .bind(session.chunk_count)
        .bind(&session.uploader_id)
        .bind(session.status)
        .bind(session.download_count)
        .bind(session.last_download_at)
        .bind(session.migration_scheduled)
        .bind(session.migration_scheduled_at)
        .bind(session.original_provider)
        .bind(session.expires_at)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&mut *tx)
        .await?;

        for recipient in &session.recipients {
            sqlx::query(
                "INSERT INTO session_recipients (session_id, recipient_id) VALUES (?, ?)
                 ON CONFLICT(session_id, recipient_id) DO NOTHING",
            )
            .bind(session.session_id)
            .bind(recipient)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(session_id = %session.session_id, "inserted upload session");
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> RepositoryResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE session_id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&*self.db)
        .await?;

        let Some(mut session) = session else {
            return Ok(None);
        };
        session.recipients = self.recipients(session_id).await?;
        session.uploaded_chunks = self.chunks(session_id).await?;
        Ok(Some(session))
    }

    async fn insert_chunk(
        &self,
        session_id: Uuid,
        chunk: &ChunkRecord,
    ) -> RepositoryResult<ChunkInsert> {
        let result = sqlx::query(
            "INSERT INTO upload_chunks (session_id, chunk_index, checksum, size, etag, uploaded_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id, chunk_index) DO NOTHING",
        )
        .bind(session_id)
        .bind(chunk.index)
        .bind(&chunk.checksum)
        .bind(chunk.size)
        .bind(&chunk.etag)
        .bind(chunk.uploaded_at)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(ChunkInsert::Inserted);
        }

        // Rows are never deleted individually, so the conflicting row is
        // still there.
        match self.chunk(session_id, chunk.index).await? {
            Some(existing) => Ok(ChunkInsert::Existing(existing)),
            None => Err(RepositoryError::Sqlx(sqlx::Error::RowNotFound)),
        }
    }

    async fn count_chunks(&self, session_id: Uuid) -> RepositoryResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM upload_chunks WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    async fn mark_uploading(&self, session_id: Uuid, now: DateTime<Utc>) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = 'uploading', updated_at = ?
             WHERE session_id = ? AND status = 'init'",
        )
        .bind(now)
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_ready(&self, session_id: Uuid, now: DateTime<Utc>) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = 'ready', updated_at = ?
             WHERE session_id = ? AND status IN ('init', 'uploading')",
        )
        .bind(now)
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_aborted(
        &self,
        session_id: Uuid,
        horizon: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<DateTime<Utc>>> {
        let expires_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            "UPDATE upload_sessions SET
                 status = 'error',
                 expires_at = CASE WHEN expires_at < ?1 THEN expires_at ELSE ?1 END,
                 updated_at = ?2
             WHERE session_id = ?3
             RETURNING expires_at",
        )
        .bind(horizon)
        .bind(now)
        .bind(session_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(expires_at)
    }

    async fn record_download(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        policy: &MigrationPolicy,
    ) -> RepositoryResult<Option<DownloadRecord>> {
        // SET expressions see pre-update values, so `download_count + 1`
        // is the post-increment count in every CASE arm. The trigger count
        // is unique per download, which identifies the flipping request.
        let row = sqlx::query_as::<_, (i64, bool, Option<i64>)>(
            "UPDATE upload_sessions SET
                 download_count = download_count + 1,
                 last_download_at = ?1,
                 updated_at = ?1,
                 migration_scheduled = CASE
                     WHEN migration_scheduled = 0 AND provider = ?2 AND download_count + 1 >= ?3
                     THEN 1 ELSE migration_scheduled END,
                 migration_scheduled_at = CASE
                     WHEN migration_scheduled = 0 AND provider = ?2 AND download_count + 1 >= ?3
                     THEN ?1 ELSE migration_scheduled_at END,
                 migration_trigger_count = CASE
                     WHEN migration_scheduled = 0 AND provider = ?2 AND download_count + 1 >= ?3
                     THEN download_count + 1 ELSE migration_trigger_count END
             WHERE session_id = ?4 AND status = 'ready'
             RETURNING download_count, migration_scheduled, migration_trigger_count",
        )
        .bind(now)
        .bind(policy.source)
        .bind(policy.popularity_threshold)
        .bind(session_id)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(|(download_count, migration_scheduled, trigger)| DownloadRecord {
            download_count,
            migration_scheduled,
            newly_scheduled: migration_scheduled && trigger == Some(download_count),
        }))
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> RepositoryResult<Vec<ExpiredSession>> {
        let expired = sqlx::query_as::<_, ExpiredSession>(
            "SELECT session_id, provider, provider_key, status
             FROM upload_sessions
             WHERE expires_at <= ?
             ORDER BY reap_attempts ASC, expires_at ASC
             LIMIT ?",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.db)
        .await?;
        Ok(expired)
    }

    async fn defer_reap(&self, session_id: Uuid) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET reap_attempts = reap_attempts + 1 WHERE session_id = ?",
        )
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_session(&self, session_id: Uuid) -> RepositoryResult<bool> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM session_recipients WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM upload_sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_migration_candidates(&self, limit: u32) -> RepositoryResult<Vec<UploadSession>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT session_id FROM upload_sessions
             WHERE migration_scheduled = 1 AND status = 'ready'
             ORDER BY migration_scheduled_at ASC
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&*self.db)
        .await?;

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.find_session(id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn complete_migration(
        &self,
        session_id: Uuid,
        provider: ProviderKind,
        provider_key: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET
                 original_provider = provider,
                 provider = ?1,
                 provider_key = ?2,
                 migration_scheduled = 0,
                 updated_at = ?3
             WHERE session_id = ?4 AND migration_scheduled = 1 AND provider <> ?1",
        )
        .bind(provider)
        .bind(provider_key)
        .bind(now)
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Run every statement in [`SCHEMA`]. Returns how many were executed.
pub async fn apply_schema(db: &SqlitePool) -> RepositoryResult<usize> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    for stmt in &statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(statements.len())
}
