//! Upload sessions and the chunk records acknowledged against them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Storage backends a session can be placed on.
///
/// The set is closed: every variant has exactly one adapter registered in
/// [`crate::providers::ProviderRegistry`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
pub enum ProviderKind {
    /// Backblaze B2, native API. Low-cost default placement.
    B2,
    /// Cloudflare R2, S3-compatible API. Used for large objects.
    R2,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::B2 => "B2",
            ProviderKind::R2 => "R2",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an upload session.
///
/// `Init -> Uploading -> Ready`, with `Error` reachable from anywhere.
/// Nothing leaves `Ready` or `Error` except expiry.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    Init,
    Uploading,
    Ready,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Init => "init",
            SessionStatus::Uploading => "uploading",
            SessionStatus::Ready => "ready",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical chunked file transfer.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Server-generated identifier, never reused.
    pub session_id: Uuid,

    /// Original filename supplied by the uploader.
    pub name: String,

    /// Client-asserted size in bytes.
    pub declared_size: i64,

    pub mime_type: String,

    /// Backend chosen at creation.
    pub provider: ProviderKind,

    /// Backend-specific object path.
    pub provider_key: String,

    /// Backend multipart identifier (B2 large-file id or S3 upload id),
    /// present only when `chunk_count > 1`.
    pub multipart_id: Option<String>,

    pub chunk_size: i64,

    /// `ceil(declared_size / chunk_size)`, always >= 1.
    pub chunk_count: i64,

    /// Resolved identity of the caller who created the session.
    pub uploader_id: String,

    /// Identities granted read access.
    #[sqlx(skip)]
    pub recipients: Vec<String>,

    pub status: SessionStatus,

    /// Acknowledged chunks, ordered by index.
    #[sqlx(skip)]
    pub uploaded_chunks: Vec<ChunkRecord>,

    pub download_count: i64,
    pub last_download_at: Option<DateTime<Utc>>,

    /// Overlay flag read by the external migration job.
    pub migration_scheduled: bool,
    pub migration_scheduled_at: Option<DateTime<Utc>>,

    /// Provider the object lived on before a completed migration.
    pub original_provider: Option<ProviderKind>,

    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    /// A session past `expires_at` is dead even if the reaper has not run yet.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_uploader(&self, caller: &str) -> bool {
        self.uploader_id == caller
    }

    /// Uploader or any recipient.
    pub fn can_read(&self, caller: &str) -> bool {
        self.is_uploader(caller) || self.recipients.iter().any(|r| r == caller)
    }

    pub fn acknowledged(&self) -> i64 {
        self.uploaded_chunks.len() as i64
    }

    pub fn is_complete(&self) -> bool {
        self.acknowledged() == self.chunk_count
    }

    pub fn index_in_range(&self, index: i64) -> bool {
        (0..self.chunk_count).contains(&index)
    }
}

/// A chunk the client reported as durably uploaded.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    /// 0-based chunk index.
    #[sqlx(rename = "chunk_index")]
    pub index: i64,

    /// Client-computed content digest. Immutable once recorded.
    pub checksum: String,

    pub size: i64,

    /// Backend-assigned part token (S3 ETag or B2 SHA-1).
    pub etag: Option<String>,

    pub uploaded_at: DateTime<Utc>,
}

/// Number of chunks needed to cover `declared_size` bytes.
///
/// Both arguments must be positive.
pub fn chunk_count_for(declared_size: i64, chunk_size: i64) -> i64 {
    (declared_size as u64).div_ceil(chunk_size as u64) as i64
}

/// Inclusive byte range of chunk `index` within an object of `total` bytes.
pub fn chunk_byte_range(index: i64, chunk_size: i64, total: i64) -> (i64, i64) {
    let start = index * chunk_size;
    let end = (start + chunk_size).min(total) - 1;
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: i64 = 1024 * 1024;

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count_for(10 * MIB, 4 * MIB), 3);
        assert_eq!(chunk_count_for(8 * MIB, 4 * MIB), 2);
        assert_eq!(chunk_count_for(1, 4 * MIB), 1);
        assert_eq!(chunk_count_for(4 * MIB + 1, 4 * MIB), 2);
    }

    #[test]
    fn last_chunk_range_is_truncated() {
        assert_eq!(chunk_byte_range(0, 4 * MIB, 10 * MIB), (0, 4 * MIB - 1));
        assert_eq!(chunk_byte_range(2, 4 * MIB, 10 * MIB), (8 * MIB, 10 * MIB - 1));
    }

    #[test]
    fn status_strings_match_storage_encoding() {
        assert_eq!(SessionStatus::Uploading.to_string(), "uploading");
        assert_eq!(
            serde_json::to_string(&SessionStatus::Ready).unwrap(),
            "\"ready\""
        );
        assert_eq!(serde_json::to_string(&ProviderKind::R2).unwrap(), "\"R2\"");
    }
}
