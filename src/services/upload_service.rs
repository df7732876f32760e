//! src/services/upload_service.rs
//!
//! Upload session manager. Owns the session lifecycle: creation with
//! capability issuance, chunk acknowledgment, finalization, abort, status
//! and download grants. All state lives in the repository; nothing is
//! cached between calls.

use crate::models::{
    capability::{ByteRange, DownloadCapability, PartToken, UploadCapability, part_number_for},
    session::{
        ChunkRecord, ProviderKind, SessionStatus, UploadSession, chunk_byte_range, chunk_count_for,
    },
};
use crate::providers::{ProviderError, ProviderRegistry, object_key_for};
use crate::services::{
    selector::{MigrationPolicy, select_provider},
    session_repository::{ChunkInsert, RepositoryError, SessionRepository},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Multipart part ceiling shared by both backends.
pub const MAX_PARTS: i64 = 10_000;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub chunk_size: i64,
    pub large_file_threshold: i64,
    pub session_ttl: Duration,
    /// How long an aborted session lingers before the reaper reclaims it.
    pub abort_grace: Duration,
    pub migration: MigrationPolicy,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("upload session not found")]
    NotFound,
    #[error("caller is not allowed to access this upload")]
    Forbidden,
    #[error("chunk {index} was already acknowledged with a different checksum")]
    ChecksumConflict {
        index: i64,
        expected: String,
        received: String,
    },
    #[error("upload incomplete: {received} of {expected} chunks acknowledged")]
    IncompleteUpload { received: i64, expected: i64 },
    #[error("chunk index {index} is outside 0..{chunk_count}")]
    InvalidIndex { index: i64, chunk_count: i64 },
    #[error("upload is not ready for download (status: {status})")]
    NotReady { status: SessionStatus },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub type SessionResult<T> = Result<T, SessionError>;

fn invalid(msg: impl Into<String>) -> SessionError {
    SessionError::InvalidRequest(msg.into())
}

fn non_blank(value: Option<String>, field: &str) -> SessionResult<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(invalid(format!("{field} is required"))),
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckChunkRequest {
    pub chunk_index: Option<i64>,
    pub checksum: Option<String>,
    pub size: Option<i64>,
    pub etag: Option<String>,
}

/// Optional finalization inputs for tokens the acknowledgments lacked.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeArgs {
    #[serde(alias = "uploadId")]
    pub multipart_id: Option<String>,
    pub parts: Option<Vec<ClientPart>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPart {
    /// 1-based.
    pub part_number: i32,
    #[serde(alias = "sha1")]
    pub etag: String,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: Uuid,
    pub provider: ProviderKind,
    pub provider_key: String,
    pub chunk_size: i64,
    pub chunk_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multipart_id: Option<String>,
    pub presigned_urls: Vec<UploadCapability>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub accepted: bool,
    pub already_exists: bool,
    pub acknowledged: i64,
    pub chunk_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub name: String,
    pub status: SessionStatus,
    pub chunk_size: i64,
    pub chunk_count: i64,
    pub uploaded_chunks: Vec<ChunkRecord>,
    pub acknowledged: i64,
    pub is_complete: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedUpload {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub provider: ProviderKind,
    pub provider_key: String,
    pub download_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortedUpload {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadGrant {
    pub session_id: Uuid,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub chunk_size: i64,
    pub chunk_count: i64,
    pub download_count: i64,
    pub presigned_urls: Vec<DownloadCapability>,
}

/// Coordinates sessions across the repository and the backend adapters.
#[derive(Clone)]
pub struct UploadService {
    repo: Arc<dyn SessionRepository>,
    providers: ProviderRegistry,
    settings: SessionSettings,
}

impl UploadService {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        providers: ProviderRegistry,
        settings: SessionSettings,
    ) -> Self {
        Self {
            repo,
            providers,
            settings,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Load a session that exists and has not expired.
    async fn live_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> SessionResult<UploadSession> {
        match self.repo.find_session(session_id).await? {
            Some(session) if !session.is_expired(now) => Ok(session),
            Some(_) => {
                debug!(%session_id, "session expired, treating as not found");
                Err(SessionError::NotFound)
            }
            None => Err(SessionError::NotFound),
        }
    }

    async fn owned_session(
        &self,
        session_id: Uuid,
        caller: &str,
        now: DateTime<Utc>,
    ) -> SessionResult<UploadSession> {
        let session = self.live_session(session_id, now).await?;
        if !session.is_uploader(caller) {
            warn!(%session_id, caller, "rejected non-uploader caller");
            return Err(SessionError::Forbidden);
        }
        Ok(session)
    }

    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
        caller: &str,
    ) -> SessionResult<CreatedSession> {
        let name = non_blank(request.name, "name")?;
        let mime_type = non_blank(request.mime_type, "mimeType")?;
        let declared_size = match request.size {
            Some(size) if size > 0 => size,
            _ => return Err(invalid("size must be a positive number of bytes")),
        };

        let chunk_size = self.settings.chunk_size;
        let chunk_count = chunk_count_for(declared_size, chunk_size);
        if chunk_count > MAX_PARTS {
            return Err(invalid(format!(
                "file needs {chunk_count} chunks, more than the {MAX_PARTS} part limit"
            )));
        }

        let provider = select_provider(declared_size, self.settings.large_file_threshold);
        let adapter = self.providers.get(provider)?;

        let session_id = Uuid::new_v4();
        let provider_key = object_key_for(&session_id);
        let capabilities = adapter
            .issue_put_capabilities(&provider_key, chunk_count)
            .await?;
        let multipart_id = capabilities
            .iter()
            .find_map(|cap| cap.multipart_id.clone());

        let recipients = request
            .recipients
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty() && r != caller)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let now = Utc::now();
        let session = UploadSession {
            session_id,
            name,
            declared_size,
            mime_type,
            provider,
            provider_key,
            multipart_id,
            chunk_size,
            chunk_count,
            uploader_id: caller.to_string(),
            recipients,
            status: SessionStatus::Init,
            uploaded_chunks: Vec::new(),
            download_count: 0,
            last_download_at: None,
            migration_scheduled: false,
            migration_scheduled_at: None,
            original_provider: None,
            expires_at: now + self.settings.session_ttl,
            created_at: now,
            updated_at: now,
        };

        if let Err(err) = self.repo.insert_session(&session).await {
            // Release the multipart session opened above.
            if let Err(cleanup) = adapter.delete_object(&session.provider_key).await {
                warn!(%session_id, error = %cleanup, "could not release backend upload");
            }
            return Err(err.into());
        }

        info!(
            %session_id,
            provider = %provider,
            chunk_count,
            declared_size,
            "created upload session"
        );

        Ok(CreatedSession {
            session_id,
            provider,
            provider_key: session.provider_key,
            chunk_size,
            chunk_count,
            multipart_id: session.multipart_id,
            presigned_urls: capabilities,
            expires_at: session.expires_at,
        })
    }

    pub async fn acknowledge_chunk(
        &self,
        session_id: Uuid,
        request: AckChunkRequest,
        caller: &str,
    ) -> SessionResult<ChunkAck> {
        let now = Utc::now();
        let session = self.owned_session(session_id, caller, now).await?;
        if session.status == SessionStatus::Error {
            return Err(invalid("upload was aborted"));
        }

        let checksum = non_blank(request.checksum, "checksum")?;
        let size = match request.size {
            Some(size) if size > 0 => size,
            _ => return Err(invalid("size must be a positive number of bytes")),
        };
        let index = match request.chunk_index {
            Some(index) if session.index_in_range(index) => index,
            Some(index) => {
                return Err(invalid(format!(
                    "chunkIndex {index} is outside 0..{}",
                    session.chunk_count
                )));
            }
            None => return Err(invalid("chunkIndex is required")),
        };

        let record = ChunkRecord {
            index,
            checksum,
            size,
            etag: request
                .etag
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
            uploaded_at: now,
        };

        let already_exists = match self.repo.insert_chunk(session_id, &record).await? {
            ChunkInsert::Inserted => {
                if self.repo.mark_uploading(session_id, now).await? {
                    info!(%session_id, "upload session is uploading");
                }
                false
            }
            ChunkInsert::Existing(existing) if existing.checksum == record.checksum => {
                debug!(%session_id, index, "duplicate chunk acknowledgment");
                true
            }
            ChunkInsert::Existing(existing) => {
                warn!(
                    %session_id,
                    index,
                    expected = %existing.checksum,
                    received = %record.checksum,
                    "chunk checksum conflict"
                );
                return Err(SessionError::ChecksumConflict {
                    index,
                    expected: existing.checksum,
                    received: record.checksum,
                });
            }
        };

        let acknowledged = self.repo.count_chunks(session_id).await?;
        Ok(ChunkAck {
            accepted: true,
            already_exists,
            acknowledged,
            chunk_count: session.chunk_count,
        })
    }

    pub async fn complete_upload(
        &self,
        session_id: Uuid,
        caller: &str,
        args: FinalizeArgs,
    ) -> SessionResult<CompletedUpload> {
        let now = Utc::now();
        let session = self.owned_session(session_id, caller, now).await?;

        match session.status {
            SessionStatus::Ready => {
                debug!(%session_id, "upload already complete");
                return Ok(completed(&session));
            }
            SessionStatus::Error => return Err(invalid("upload was aborted")),
            SessionStatus::Init | SessionStatus::Uploading => {}
        }

        if !session.is_complete() {
            return Err(SessionError::IncompleteUpload {
                received: session.acknowledged(),
                expected: session.chunk_count,
            });
        }

        if session.chunk_count > 1 {
            let stored = session
                .multipart_id
                .as_deref()
                .ok_or_else(|| invalid("session has no open multipart upload"))?;
            if let Some(supplied) = args.multipart_id.as_deref() {
                if supplied != stored {
                    return Err(invalid("multipartId does not match this upload"));
                }
            }

            let parts = part_tokens(&session.uploaded_chunks, args.parts.as_deref())?;
            let adapter = self.providers.get(session.provider)?;
            if let Err(err) = adapter
                .finalize_multipart(&session.provider_key, stored, &parts)
                .await
            {
                warn!(%session_id, error = %err, "multipart finalization failed");
                return Err(err.into());
            }
        }

        if self.repo.mark_ready(session_id, now).await? {
            info!(%session_id, provider = %session.provider, "upload session is ready");
            let mut session = session;
            session.status = SessionStatus::Ready;
            return Ok(completed(&session));
        }

        // Another request moved the session first; report what it left behind.
        match self.repo.find_session(session_id).await? {
            Some(current) if current.status == SessionStatus::Ready => Ok(completed(&current)),
            Some(current) => {
                warn!(
                    %session_id,
                    status = %current.status,
                    "session changed during finalization"
                );
                Err(invalid("upload was aborted"))
            }
            None => Err(SessionError::NotFound),
        }
    }

    pub async fn abort_upload(
        &self,
        session_id: Uuid,
        caller: &str,
    ) -> SessionResult<AbortedUpload> {
        let now = Utc::now();
        self.owned_session(session_id, caller, now).await?;

        let horizon = now + self.settings.abort_grace;
        let expires_at = self
            .repo
            .mark_aborted(session_id, horizon, now)
            .await?
            .ok_or(SessionError::NotFound)?;

        info!(%session_id, %expires_at, "upload session aborted");
        Ok(AbortedUpload {
            session_id,
            status: SessionStatus::Error,
            expires_at,
        })
    }

    pub async fn refresh_capability(
        &self,
        session_id: Uuid,
        index: i64,
        caller: &str,
    ) -> SessionResult<UploadCapability> {
        let session = self.owned_session(session_id, caller, Utc::now()).await?;
        match session.status {
            SessionStatus::Error => return Err(invalid("upload was aborted")),
            SessionStatus::Ready => return Err(invalid("upload is already complete")),
            SessionStatus::Init | SessionStatus::Uploading => {}
        }
        if !session.index_in_range(index) {
            return Err(SessionError::InvalidIndex {
                index,
                chunk_count: session.chunk_count,
            });
        }

        let adapter = self.providers.get(session.provider)?;
        let capability = adapter
            .reissue_put_capability(
                &session.provider_key,
                session.chunk_count,
                session.multipart_id.as_deref(),
                index,
            )
            .await?;
        debug!(%session_id, index, "reissued upload capability");
        Ok(capability)
    }

    pub async fn get_status(
        &self,
        session_id: Uuid,
        caller: &str,
    ) -> SessionResult<SessionSnapshot> {
        let session = self.live_session(session_id, Utc::now()).await?;
        if !session.can_read(caller) {
            return Err(SessionError::Forbidden);
        }

        let acknowledged = session.acknowledged();
        let is_complete = session.is_complete();
        Ok(SessionSnapshot {
            session_id,
            name: session.name,
            status: session.status,
            chunk_size: session.chunk_size,
            chunk_count: session.chunk_count,
            uploaded_chunks: session.uploaded_chunks,
            acknowledged,
            is_complete,
            expires_at: session.expires_at,
        })
    }

    /// Grant ranged read capabilities and count the download.
    ///
    /// Readiness is checked before identity, so a non-ready session reports
    /// `NotReady` to every caller.
    pub async fn get_download_capabilities(
        &self,
        session_id: Uuid,
        caller: &str,
    ) -> SessionResult<DownloadGrant> {
        let now = Utc::now();
        let session = self.live_session(session_id, now).await?;
        if session.status != SessionStatus::Ready {
            return Err(SessionError::NotReady {
                status: session.status,
            });
        }
        if !session.can_read(caller) {
            return Err(SessionError::Forbidden);
        }

        let adapter = self.providers.get(session.provider)?;
        let mut capabilities = adapter
            .issue_get_capabilities(&session.provider_key, session.chunk_count)
            .await?;
        for capability in &mut capabilities {
            let (start, end) =
                chunk_byte_range(capability.chunk_index, session.chunk_size, session.declared_size);
            capability.range = Some(ByteRange { start, end });
        }

        let record = self
            .repo
            .record_download(session_id, now, &self.settings.migration)
            .await?
            .ok_or(SessionError::NotReady {
                status: session.status,
            })?;
        if record.newly_scheduled {
            info!(
                %session_id,
                provider = %session.provider,
                target = %self.settings.migration.target,
                download_count = record.download_count,
                "scheduled popular upload for migration"
            );
        }

        Ok(DownloadGrant {
            session_id,
            name: session.name,
            size: session.declared_size,
            mime_type: session.mime_type,
            chunk_size: session.chunk_size,
            chunk_count: session.chunk_count,
            download_count: record.download_count,
            presigned_urls: capabilities,
        })
    }
}

fn completed(session: &UploadSession) -> CompletedUpload {
    CompletedUpload {
        session_id: session.session_id,
        status: session.status,
        provider: session.provider,
        provider_key: session.provider_key.clone(),
        download_url: format!("/api/files/{}/download-urls", session.session_id),
    }
}

/// Part tokens in index order. Acknowledged etags win over client-supplied
/// parts; a part with neither is rejected.
fn part_tokens(
    chunks: &[ChunkRecord],
    supplied: Option<&[ClientPart]>,
) -> SessionResult<Vec<PartToken>> {
    let mut chunks = chunks.to_vec();
    chunks.sort_by_key(|c| c.index);

    chunks
        .iter()
        .map(|chunk| {
            let part_number = part_number_for(chunk.index);
            let token = chunk
                .etag
                .clone()
                .or_else(|| {
                    supplied?
                        .iter()
                        .find(|p| p.part_number == part_number)
                        .map(|p| p.etag.clone())
                })
                .ok_or_else(|| invalid(format!("no part token for chunk {}", chunk.index)))?;
            Ok(PartToken { part_number, token })
        })
        .collect()
}
